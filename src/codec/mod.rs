//! Wire codec for the authorization callback protocol: varints, typed
//! key/value pairs, and length-prefixed frames.

pub mod frame;
pub mod value;
pub mod varint;

pub use frame::{Frame, FrameFlags, FrameType, MAX_FRAME_SIZE};
pub use value::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unexpected end of buffer")]
	UnexpectedEof,
	#[error("unterminated varint sequence")]
	UnterminatedVarint,
	#[error("unknown data type tag {0:#x}")]
	UnknownDataType(u8),
	#[error("unknown frame type {0:#x}")]
	UnknownFrameType(u8),
	#[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
	FrameTooLarge(usize),
	#[error("frame length prefix ({declared}) does not match available data ({available})")]
	IncompleteFrame { declared: usize, available: usize },
	#[error("invalid ip address payload of length {0}")]
	InvalidIpLength(usize),
	#[error("invalid utf-8 string payload: {0}")]
	InvalidUtf8(#[from] std::str::Utf8Error),
}
