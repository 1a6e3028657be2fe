//! Staged frame codec over a byte stream.
//!
//! Decoding runs a two-stage machine: collect the fixed header, then
//! collect the payload the header declares. A header with an unsupported
//! major version yields [`Decoded::BadVersion`] and the codec consumes
//! exactly the declared payload before parsing the next header, so one
//! stray frame never desynchronizes the stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, Header};
use crate::{ProtocolError, HEADER_SIZE, VERSION_MAJOR};

/// Decoder output: a complete frame, or notice of a version-mismatched
/// request (carrying the id to echo in the error response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    BadVersion { id: u32 },
}

#[derive(Debug, Clone, Copy)]
enum ReadStage {
    /// Waiting for a complete 8-byte header.
    Header,
    /// Waiting for the payload the parsed header declared.
    Payload(Header),
    /// Discarding the payload of a version-mismatched frame.
    Discard { remaining: usize },
}

/// Codec for frames over a TLS byte stream.
#[derive(Debug)]
pub struct FrameCodec {
    stage: ReadStage,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            stage: ReadStage::Header,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, Self::Error> {
        loop {
            match self.stage {
                ReadStage::Header => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = Header::parse(&src[..HEADER_SIZE])?;
                    src.advance(HEADER_SIZE);

                    if header.version_major != VERSION_MAJOR {
                        if header.length > 0 {
                            self.stage = ReadStage::Discard {
                                remaining: header.length as usize,
                            };
                        }
                        return Ok(Some(Decoded::BadVersion { id: header.id }));
                    }

                    if header.length == 0 {
                        return Ok(Some(Decoded::Frame(Frame {
                            header,
                            payload: Vec::new(),
                        })));
                    }

                    src.reserve(header.length as usize);
                    self.stage = ReadStage::Payload(header);
                }
                ReadStage::Payload(header) => {
                    let need = header.length as usize;
                    if src.len() < need {
                        src.reserve(need - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(need).to_vec();
                    self.stage = ReadStage::Header;
                    return Ok(Some(Decoded::Frame(Frame { header, payload })));
                }
                ReadStage::Discard { remaining } => {
                    let take = remaining.min(src.len());
                    src.advance(take);
                    if take < remaining {
                        self.stage = ReadStage::Discard {
                            remaining: remaining - take,
                        };
                        return Ok(None);
                    }
                    self.stage = ReadStage::Header;
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_SIZE + frame.payload.len());
        frame.header.write(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
