//! The wire format.
//!
//! Every message starts with a 4-byte header `{ kind: u8, _pad: u8, size: u16 }`, all integers
//! little-endian, where `size` counts the whole message including the header. Three kinds are
//! carried on an established session:
//!
//! ```text
//! channel data     { header; channel: u32; payload: size - 8 bytes }
//! channel window   { header; channel: u32; window_delta: u32 }
//! channel close    { header; channel: u32 }
//! ```
//!
//! Layouts are packed; encoding and decoding go byte by byte rather than through struct casts so
//! the wire image is identical on every host.

use crate::{ringbuf::RingBuf, ProtocolError, Result};
use std::io::{ErrorKind, Read};

/// Payload bytes for a user channel.
pub const MSG_CHANNEL_DATA: u8 = 0x10;
/// Credit grant: the sender may emit `window_delta` more payload bytes on the channel.
pub const MSG_CHANNEL_WINDOW: u8 = 0x11;
/// End of stream for a channel, sent once its local fd is gone and its buffer drained.
pub const MSG_CHANNEL_CLOSE: u8 = 0x12;

/// Byte length of the fixed message header. Kind values below [`MSG_CHANNEL_DATA`] are reserved
/// for the session-establishment phase, which happens before the pump starts.
pub const MSG_HDR_SIZE: usize = 4;
/// Fixed part of a DATA message; the payload follows it.
pub const DATA_HDR_SIZE: usize = 8;
/// Total length of a WINDOW message.
pub const WINDOW_MSG_SIZE: usize = 12;
/// Total length of a CLOSE message.
pub const CLOSE_MSG_SIZE: usize = 8;

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
	pub kind: u8,
	/// Total message length in bytes, header included. Valid messages have `size >= 4`.
	pub size: u16,
}

impl MsgHdr {
	pub fn decode(raw: [u8; MSG_HDR_SIZE]) -> Self {
		Self { kind: raw[0], size: u16::from_le_bytes([raw[2], raw[3]]) }
	}

	pub fn encode(self) -> [u8; MSG_HDR_SIZE] {
		let [lo, hi] = self.size.to_le_bytes();
		[self.kind, 0, lo, hi]
	}
}

/// Look for a complete message at the head of the ingress ring.
///
/// Never consumes anything: the dispatcher consumes the header only once it has committed to
/// handling that kind. Returns `None` while bytes are still outstanding. A message that could not
/// fit the ring even fully drained will never complete, so it fails instead of stalling forever.
pub(crate) fn detect_message(rb: &RingBuf) -> Result<Option<MsgHdr>> {
	let avail = rb.len();
	if avail < MSG_HDR_SIZE {
		return Ok(None);
	}
	let mut raw = [0; MSG_HDR_SIZE];
	rb.peek(&mut raw);
	let header = MsgHdr::decode(raw);
	if avail < header.size as usize {
		let missing = header.size as usize - avail;
		if missing > rb.room() {
			return Err(ProtocolError::OversizedMessage { kind: header.kind, missing, room: rb.room() }.into());
		}
		return Ok(None);
	}
	Ok(Some(header))
}

/// Encode the fixed part of a DATA frame; `payload_len` payload bytes follow it on the wire.
pub fn channel_data_header(channel: u32, payload_len: usize) -> [u8; DATA_HDR_SIZE] {
	let mut m = [0; DATA_HDR_SIZE];
	m[..MSG_HDR_SIZE]
		.copy_from_slice(&MsgHdr { kind: MSG_CHANNEL_DATA, size: (DATA_HDR_SIZE + payload_len) as u16 }.encode());
	m[4..8].copy_from_slice(&channel.to_le_bytes());
	m
}

/// Encode a WINDOW frame granting `delta` more bytes of credit on `channel`.
pub fn channel_window(channel: u32, delta: u32) -> [u8; WINDOW_MSG_SIZE] {
	let mut m = [0; WINDOW_MSG_SIZE];
	m[..MSG_HDR_SIZE].copy_from_slice(&MsgHdr { kind: MSG_CHANNEL_WINDOW, size: WINDOW_MSG_SIZE as u16 }.encode());
	m[4..8].copy_from_slice(&channel.to_le_bytes());
	m[8..12].copy_from_slice(&delta.to_le_bytes());
	m
}

/// Encode a CLOSE frame for `channel`.
pub fn channel_close(channel: u32) -> [u8; CLOSE_MSG_SIZE] {
	let mut m = [0; CLOSE_MSG_SIZE];
	m[..MSG_HDR_SIZE].copy_from_slice(&MsgHdr { kind: MSG_CHANNEL_CLOSE, size: CLOSE_MSG_SIZE as u16 }.encode());
	m[4..8].copy_from_slice(&channel.to_le_bytes());
	m
}

/// Read one whole message from `reader`, blocking as the reader does.
///
/// This is the synchronous half of session establishment, before any ring buffer exists: read a
/// header, size-check it, read the rest. Hanging up mid-header is
/// [`Disconnected`](ProtocolError::Disconnected); mid-body is [`Truncated`](ProtocolError::Truncated).
pub fn read_message(reader: &mut impl Read) -> Result<Vec<u8>> {
	let mut raw = [0; MSG_HDR_SIZE];
	if read_full(reader, &mut raw)? < MSG_HDR_SIZE {
		return Err(ProtocolError::Disconnected.into());
	}
	let header = MsgHdr::decode(raw);
	if (header.size as usize) < MSG_HDR_SIZE {
		return Err(ProtocolError::ImpossibleSize { kind: header.kind, size: header.size }.into());
	}

	let mut message = vec![0; header.size as usize];
	message[..MSG_HDR_SIZE].copy_from_slice(&raw);
	let rest = header.size as usize - MSG_HDR_SIZE;
	if read_full(reader, &mut message[MSG_HDR_SIZE..])? < rest {
		return Err(ProtocolError::Truncated.into());
	}
	Ok(message)
}

/// Read until `buf` is full or the reader hits end-of-stream; returns the bytes filled.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		match reader.read(&mut buf[filled..]) {
			Ok(0) => break,
			Ok(n) => filled += n,
			Err(err) if err.kind() == ErrorKind::Interrupted => continue,
			Err(err) => return Err(err.into()),
		}
	}
	Ok(filled)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Error, ProtocolError};
	use std::io::Cursor;

	#[test]
	fn header_layout_is_little_endian() {
		let header = MsgHdr { kind: MSG_CHANNEL_WINDOW, size: 0x1234 };
		assert_eq!(header.encode(), [0x11, 0, 0x34, 0x12]);
		assert_eq!(MsgHdr::decode([0x11, 0, 0x34, 0x12]), header);
	}

	#[test]
	fn frame_layouts_are_byte_exact() {
		assert_eq!(channel_data_header(2, 4), [0x10, 0, 12, 0, 2, 0, 0, 0]);
		assert_eq!(channel_window(2, 7), [0x11, 0, 12, 0, 2, 0, 0, 0, 7, 0, 0, 0]);
		assert_eq!(channel_close(3), [0x12, 0, 8, 0, 3, 0, 0, 0]);
	}

	#[test]
	fn detect_waits_for_header_then_body() {
		let mut rb = RingBuf::with_capacity(16);
		assert_eq!(detect_message(&rb).unwrap(), None);
		rb.extend(&[0x12, 0, 8, 0]);
		assert_eq!(detect_message(&rb).unwrap(), None);
		rb.extend(&[9, 0, 0, 0]);
		assert_eq!(detect_message(&rb).unwrap(), Some(MsgHdr { kind: MSG_CHANNEL_CLOSE, size: 8 }));
		// never consumed by detection
		assert_eq!(rb.len(), 8);
	}

	#[test]
	fn detect_rejects_a_message_that_can_never_fit() {
		let mut rb = RingBuf::with_capacity(8);
		rb.extend(&[0x10, 0, 64, 0]);
		match detect_message(&rb) {
			Err(Error::Protocol(ProtocolError::OversizedMessage { kind: MSG_CHANNEL_DATA, .. })) => (),
			other => panic!("expected OversizedMessage, got {other:?}"),
		}
	}

	#[test]
	fn read_message_returns_the_whole_frame() {
		let frame = channel_window(2, 5);
		let mut reader = Cursor::new(frame.to_vec());
		assert_eq!(read_message(&mut reader).unwrap(), frame.to_vec());
	}

	#[test]
	fn short_header_is_a_disconnect() {
		let mut reader = Cursor::new(vec![0x10, 0]);
		match read_message(&mut reader) {
			Err(Error::Protocol(ProtocolError::Disconnected)) => (),
			other => panic!("expected Disconnected, got {other:?}"),
		}
	}

	#[test]
	fn short_body_is_truncated() {
		let mut reader = Cursor::new(vec![0x10, 0, 12, 0, 2, 0]);
		match read_message(&mut reader) {
			Err(Error::Protocol(ProtocolError::Truncated)) => (),
			other => panic!("expected Truncated, got {other:?}"),
		}
	}

	#[test]
	fn size_below_the_header_is_impossible() {
		let mut reader = Cursor::new(vec![0x10, 0, 3, 0]);
		match read_message(&mut reader) {
			Err(Error::Protocol(ProtocolError::ImpossibleSize { size: 3, .. })) => (),
			other => panic!("expected ImpossibleSize, got {other:?}"),
		}
	}
}
