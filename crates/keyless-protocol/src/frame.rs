//! Frame layout: fixed header, TLV items, opcodes, wire error codes.
//!
//! All multi-byte integers are big-endian. A frame body is a sequence of
//! items, each `tag (u8) | length (u16) | data`. Duplicate tags are
//! tolerated on decode; the last occurrence wins.

use bytes::{BufMut, BytesMut};

use crate::{ProtocolError, HEADER_SIZE, ITEM_PREAMBLE_SIZE, VERSION_MAJOR, VERSION_MINOR};

// ============================================================================
// Header
// ============================================================================

/// Fixed 8-byte frame header.
///
/// `id` is an opaque correlation id chosen by the client; every response
/// echoes the id of the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version_major: u8,
    pub version_minor: u8,
    /// Payload byte count following the header.
    pub length: u16,
    pub id: u32,
}

impl Header {
    /// Header for an outbound frame at the served protocol version.
    pub fn new(length: u16, id: u32) -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            length,
            id,
        }
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// The version is not validated here; the connection engine decides
    /// how to answer a mismatched major version.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(buf.len()));
        }
        Ok(Self {
            version_major: buf[0],
            version_minor: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Append the wire encoding of this header to `dst`.
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version_major);
        dst.put_u8(self.version_minor);
        dst.put_u16(self.length);
        dst.put_u32(self.id);
    }
}

// ============================================================================
// Items
// ============================================================================

/// Item tag: 1-byte operation code.
pub const TAG_OPCODE: u8 = 0x01;
/// Item tag: opaque bytes the operation consumes or produces.
pub const TAG_PAYLOAD: u8 = 0x02;
/// Item tag: SHA-256 digest identifying a private key.
pub const TAG_KEY_ID: u8 = 0x03;
/// Item tag: 1-byte error code (responses only).
pub const TAG_ERROR: u8 = 0xFF;

/// Decoded view of a frame body. One slot per recognized tag; unrecognized
/// tags are skipped, duplicate tags keep the last occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Items {
    pub opcode: Option<u8>,
    pub payload: Option<Vec<u8>>,
    pub key_id: Option<Vec<u8>>,
    pub error: Option<u8>,
}

impl Items {
    /// Walk the TLV sequence in `body` until it is exhausted.
    ///
    /// Fails if an item preamble is truncated, an item's declared length
    /// overruns the remaining bytes, or a fixed-width item (OPCODE, ERROR)
    /// carries the wrong length.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut items = Items::default();
        let mut offset = 0;
        while offset < body.len() {
            if body.len() - offset < ITEM_PREAMBLE_SIZE {
                return Err(ProtocolError::TruncatedItem(offset));
            }
            let tag = body[offset];
            let declared = u16::from_be_bytes([body[offset + 1], body[offset + 2]]) as usize;
            let data_start = offset + ITEM_PREAMBLE_SIZE;
            let remaining = body.len() - data_start;
            if declared > remaining {
                return Err(ProtocolError::ItemOverrun {
                    offset,
                    declared,
                    remaining,
                });
            }
            let data = &body[data_start..data_start + declared];
            match tag {
                TAG_OPCODE => items.opcode = Some(single_byte(tag, data)?),
                TAG_PAYLOAD => items.payload = Some(data.to_vec()),
                TAG_KEY_ID => items.key_id = Some(data.to_vec()),
                TAG_ERROR => items.error = Some(single_byte(tag, data)?),
                _ => {}
            }
            offset = data_start + declared;
        }
        Ok(items)
    }
}

fn single_byte(tag: u8, data: &[u8]) -> Result<u8, ProtocolError> {
    if data.len() != 1 {
        return Err(ProtocolError::BadItemLength {
            tag,
            expected: 1,
            got: data.len(),
        });
    }
    Ok(data[0])
}

// ============================================================================
// Opcodes
// ============================================================================

/// Operation selector carried in an OPCODE item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    RsaDecrypt = 0x01,
    RsaSignMd5Sha1 = 0x02,
    RsaSignSha1 = 0x03,
    RsaSignSha224 = 0x04,
    RsaSignSha256 = 0x05,
    RsaSignSha384 = 0x06,
    RsaSignSha512 = 0x07,
    RsaDecryptRaw = 0x08,
    EcdsaSignMd5Sha1 = 0x12,
    EcdsaSignSha1 = 0x13,
    EcdsaSignSha224 = 0x14,
    EcdsaSignSha256 = 0x15,
    EcdsaSignSha384 = 0x16,
    EcdsaSignSha512 = 0x17,
    Response = 0xF0,
    Ping = 0xF1,
    Pong = 0xF2,
    Error = 0xFF,
}

impl Opcode {
    /// Opcodes that only ever appear in responses. Receiving one as a
    /// request is answered with UNEXPECTED_OPCODE.
    pub fn is_response_only(self) -> bool {
        matches!(self, Opcode::Response | Opcode::Pong | Opcode::Error)
    }

    /// Operations that require an RSA key.
    pub fn is_rsa_op(self) -> bool {
        matches!(
            self,
            Opcode::RsaDecrypt
                | Opcode::RsaDecryptRaw
                | Opcode::RsaSignMd5Sha1
                | Opcode::RsaSignSha1
                | Opcode::RsaSignSha224
                | Opcode::RsaSignSha256
                | Opcode::RsaSignSha384
                | Opcode::RsaSignSha512
        )
    }

    /// Operations that require an EC key.
    pub fn is_ecdsa_op(self) -> bool {
        matches!(
            self,
            Opcode::EcdsaSignMd5Sha1
                | Opcode::EcdsaSignSha1
                | Opcode::EcdsaSignSha224
                | Opcode::EcdsaSignSha256
                | Opcode::EcdsaSignSha384
                | Opcode::EcdsaSignSha512
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x01 => Opcode::RsaDecrypt,
            0x02 => Opcode::RsaSignMd5Sha1,
            0x03 => Opcode::RsaSignSha1,
            0x04 => Opcode::RsaSignSha224,
            0x05 => Opcode::RsaSignSha256,
            0x06 => Opcode::RsaSignSha384,
            0x07 => Opcode::RsaSignSha512,
            0x08 => Opcode::RsaDecryptRaw,
            0x12 => Opcode::EcdsaSignMd5Sha1,
            0x13 => Opcode::EcdsaSignSha1,
            0x14 => Opcode::EcdsaSignSha224,
            0x15 => Opcode::EcdsaSignSha256,
            0x16 => Opcode::EcdsaSignSha384,
            0x17 => Opcode::EcdsaSignSha512,
            0xF0 => Opcode::Response,
            0xF1 => Opcode::Ping,
            0xF2 => Opcode::Pong,
            0xFF => Opcode::Error,
            other => return Err(other),
        })
    }
}

// ============================================================================
// Error codes
// ============================================================================

/// Wire error codes carried in an ERROR item.
///
/// `None` is the internal success sentinel and is never sent. `Internal`
/// marks a server-side failure that must not be attributed to the request;
/// it is never sent either -- the connection terminates instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    CryptoFailed = 0x01,
    KeyNotFound = 0x02,
    Read = 0x03,
    VersionMismatch = 0x04,
    BadOpcode = 0x05,
    UnexpectedOpcode = 0x06,
    Format = 0x07,
    Internal = 0x08,
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::CryptoFailed,
            0x02 => ErrorCode::KeyNotFound,
            0x03 => ErrorCode::Read,
            0x04 => ErrorCode::VersionMismatch,
            0x05 => ErrorCode::BadOpcode,
            0x06 => ErrorCode::UnexpectedOpcode,
            0x07 => ErrorCode::Format,
            0x08 => ErrorCode::Internal,
            other => return Err(other),
        })
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One complete wire frame: header plus the raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame. Items are emitted in a fixed order:
    /// OPCODE, then KEY_ID and PAYLOAD when present.
    pub fn request(
        id: u32,
        opcode: Opcode,
        key_id: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Self, ProtocolError> {
        let mut body = BytesMut::new();
        put_item(&mut body, TAG_OPCODE, &[opcode as u8]);
        if let Some(key_id) = key_id {
            put_item(&mut body, TAG_KEY_ID, key_id);
        }
        if let Some(payload) = payload {
            put_item(&mut body, TAG_PAYLOAD, payload);
        }
        Self::with_body(id, body)
    }

    /// Build a success response: OPCODE(RESPONSE) plus the result payload.
    pub fn response(id: u32, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut body = BytesMut::new();
        put_item(&mut body, TAG_OPCODE, &[Opcode::Response as u8]);
        put_item(&mut body, TAG_PAYLOAD, payload);
        Self::with_body(id, body)
    }

    /// Build an error response: OPCODE(ERROR) plus the 1-byte code.
    pub fn error(id: u32, code: ErrorCode) -> Self {
        let mut body = BytesMut::new();
        put_item(&mut body, TAG_OPCODE, &[Opcode::Error as u8]);
        put_item(&mut body, TAG_ERROR, &[code as u8]);
        // 8 bytes of body always fit the length field.
        Self::with_body(id, body).expect("error frame body fits u16")
    }

    fn with_body(id: u32, body: BytesMut) -> Result<Self, ProtocolError> {
        let length = u16::try_from(body.len()).map_err(|_| ProtocolError::BodyTooLarge(body.len()))?;
        Ok(Self {
            header: Header::new(length, id),
            payload: body.to_vec(),
        })
    }
}

fn put_item(dst: &mut BytesMut, tag: u8, data: &[u8]) {
    dst.reserve(ITEM_PREAMBLE_SIZE + data.len());
    dst.put_u8(tag);
    dst.put_u16(data.len() as u16);
    dst.extend_from_slice(data);
}
