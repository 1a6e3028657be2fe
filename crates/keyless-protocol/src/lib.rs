//! Keyless Protocol -- wire types and frame codec.
//!
//! Requests and responses travel over mTLS as frames: a fixed 8-byte
//! header (version, payload length, correlation id) followed by a payload
//! of tag/length/value items. The codec stages reads header-first, then
//! payload, and resynchronizes after a version mismatch by discarding
//! exactly the offending frame's declared payload.

pub mod codec;
pub mod frame;

pub use codec::{Decoded, FrameCodec};
pub use frame::{
    ErrorCode, Frame, Header, Items, Opcode, TAG_ERROR, TAG_KEY_ID, TAG_OPCODE, TAG_PAYLOAD,
};

/// Protocol major version served by this implementation. Requests with a
/// different major version are answered with a VERSION_MISMATCH error.
pub const VERSION_MAJOR: u8 = 1;

/// Protocol minor version. Not validated on receive.
pub const VERSION_MINOR: u8 = 0;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Size of a tag + length item preamble in bytes.
pub const ITEM_PREAMBLE_SIZE: usize = 3;

/// Hard cap on response buffers queued per connection. The workload is one
/// response per request, serial per connection, so this bound is a safety
/// net: exceeding it indicates a bug, not load.
pub const SEND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("header requires {HEADER_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("truncated item preamble at payload offset {0}")]
    TruncatedItem(usize),
    #[error("item at offset {offset} declares {declared} bytes but only {remaining} remain")]
    ItemOverrun {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("item {tag:#04x} must be exactly {expected} byte(s), got {got}")]
    BadItemLength { tag: u8, expected: usize, got: usize },
    #[error("frame body of {0} bytes exceeds the u16 length field")]
    BodyTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
