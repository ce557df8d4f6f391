//! Length-prefixed frame envelope for the authorization callback protocol.
//!
//! Wire layout: a 4-byte big-endian length (excluding itself), followed by
//! a 1-byte frame type, a 4-byte big-endian flags word, a varint stream id,
//! a varint frame id, and the frame payload.

use byteorder::{BigEndian, ByteOrder};

use super::{varint, Error};

/// Largest frame HAProxy and this agent will negotiate, matching the
/// reference implementation's hard ceiling.
pub const MAX_FRAME_SIZE: usize = 16380;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
	HaproxyHello,
	HaproxyDisconnect,
	HaproxyNotify,
	AgentHello,
	AgentDisconnect,
	AgentAck,
}

impl FrameType {
	fn from_byte(b: u8) -> Result<Self, Error> {
		Ok(match b {
			1 => FrameType::HaproxyHello,
			2 => FrameType::HaproxyDisconnect,
			3 => FrameType::HaproxyNotify,
			101 => FrameType::AgentHello,
			102 => FrameType::AgentDisconnect,
			103 => FrameType::AgentAck,
			other => return Err(Error::UnknownFrameType(other)),
		})
	}

	fn to_byte(self) -> u8 {
		match self {
			FrameType::HaproxyHello => 1,
			FrameType::HaproxyDisconnect => 2,
			FrameType::HaproxyNotify => 3,
			FrameType::AgentHello => 101,
			FrameType::AgentDisconnect => 102,
			FrameType::AgentAck => 103,
		}
	}
}

/// Flags word. Only the low two bits are defined by the protocol; the
/// rest is reserved and round-tripped as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u32);

impl FrameFlags {
	pub const FIN: u32 = 1;
	pub const ABORT: u32 = 2;

	pub fn fin() -> Self {
		FrameFlags(Self::FIN)
	}

	pub fn is_fin(self) -> bool {
		self.0 & Self::FIN != 0
	}

	pub fn is_abort(self) -> bool {
		self.0 & Self::ABORT != 0
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub ftype: FrameType,
	pub flags: FrameFlags,
	pub stream_id: u64,
	pub frame_id: u64,
	pub payload: Vec<u8>,
}

impl Frame {
	/// Decodes one frame from `buf`, which must hold the whole frame
	/// including its 4-byte length prefix. Returns the frame and the
	/// number of bytes consumed.
	pub fn decode(buf: &[u8]) -> Result<(Frame, usize), Error> {
		if buf.len() < 4 {
			return Err(Error::UnexpectedEof);
		}
		let declared = BigEndian::read_u32(&buf[..4]) as usize;
		if declared > MAX_FRAME_SIZE {
			return Err(Error::FrameTooLarge(declared));
		}
		let body = buf.get(4..4 + declared).ok_or(Error::IncompleteFrame {
			declared,
			available: buf.len().saturating_sub(4),
		})?;

		if body.is_empty() {
			return Err(Error::UnexpectedEof);
		}

		let ftype = FrameType::from_byte(body[0])?;
		let mut off = 1;

		let flags = FrameFlags(BigEndian::read_u32(
			body.get(off..off + 4).ok_or(Error::UnexpectedEof)?,
		));
		off += 4;

		let (stream_id, n) = varint::decode(&body[off..])?;
		off += n;
		let (frame_id, n) = varint::decode(&body[off..])?;
		off += n;

		Ok((
			Frame {
				ftype,
				flags,
				stream_id,
				frame_id,
				payload: body[off..].to_vec(),
			},
			4 + declared,
		))
	}

	/// Encodes this frame, including its length prefix, appending the
	/// bytes to `out`.
	pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), Error> {
		let mut header = Vec::with_capacity(9);
		header.push(self.ftype.to_byte());

		let mut flags_buf = [0u8; 4];
		BigEndian::write_u32(&mut flags_buf, self.flags.0);
		header.extend_from_slice(&flags_buf);

		varint::encode(&mut header, self.stream_id);
		varint::encode(&mut header, self.frame_id);

		let total = header.len() + self.payload.len();
		if total > MAX_FRAME_SIZE {
			return Err(Error::FrameTooLarge(total));
		}

		let mut len_buf = [0u8; 4];
		BigEndian::write_u32(&mut len_buf, total as u32);
		out.extend_from_slice(&len_buf);
		out.extend_from_slice(&header);
		out.extend_from_slice(&self.payload);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(ftype: FrameType, payload: Vec<u8>) -> Frame {
		Frame {
			ftype,
			flags: FrameFlags::fin(),
			stream_id: 1,
			frame_id: 7,
			payload,
		}
	}

	#[test]
	fn round_trips_a_notify_frame() {
		let frame = sample(FrameType::HaproxyNotify, vec![0xDE, 0xAD, 0xBE, 0xEF]);
		let mut buf = Vec::new();
		frame.encode(&mut buf).unwrap();

		let (decoded, n) = Frame::decode(&buf).unwrap();
		assert_eq!(n, buf.len());
		assert_eq!(decoded, frame);
	}

	#[test]
	fn rejects_frames_over_the_size_limit() {
		let frame = sample(FrameType::AgentAck, vec![0u8; MAX_FRAME_SIZE]);
		let mut buf = Vec::new();
		assert!(matches!(frame.encode(&mut buf), Err(Error::FrameTooLarge(_))));
	}

	#[test]
	fn rejects_unknown_frame_types() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&[0, 0, 0, 9]);
		buf.push(0xFF);
		buf.extend_from_slice(&[0, 0, 0, 0]);
		buf.push(0);
		buf.push(0);
		assert!(matches!(Frame::decode(&buf), Err(Error::UnknownFrameType(0xFF))));
	}

	#[test]
	fn incomplete_frame_is_rejected() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&[0, 0, 0, 100]);
		buf.extend_from_slice(&[1, 2, 3]);
		assert!(matches!(
			Frame::decode(&buf),
			Err(Error::IncompleteFrame { declared: 100, available: 3 })
		));
	}
}
