//! Full-duplex, flow-controlled channel multiplexer.
//!
//! `fdmux` runs at both ends of a single reliable byte stream (a socketpair, a pair of pipes, a
//! connection bridged by some process-attachment tool) and carries any number of independent
//! bidirectional byte streams over it. Each stream ("channel") is bound to a local file
//! descriptor: a [`Direction::Source`] channel reads its fd and frames the bytes toward the peer,
//! a [`Direction::Sink`] channel receives frames from the peer and writes them to its fd.
//! Per-channel credit windows provide backpressure, and CLOSE frames carry end-of-stream.
//!
//! The whole session is one cooperative task: a pump ([`Session::pump`]) that moves frames
//! between ring buffers without ever blocking, alternated with a signal-mask-aware poll
//! ([`Session::wait_io`]) that is the only point the task suspends. A stuck descriptor can
//! therefore never wedge the session; it simply stops being polled until it has room or data.
//!
//! Session establishment (agreeing on the channel set and message size limit) happens before the
//! pump starts and is the embedding program's job; [`read_message`] and
//! [`Session::queue_message`] are the synchronous building blocks for it.

use std::{fmt, io};

pub mod channel;
pub mod fd;
mod ioloop;
mod logging;
pub mod msg;
pub mod ringbuf;
pub mod session;
pub mod signals;

pub use self::{
	channel::{Channel, Direction},
	msg::read_message,
	ringbuf::RingBuf,
	session::{Config, DefaultDispatch, Dispatch, Session, FIRST_USER_CHANNEL, PEER_RX, PEER_TX},
};

pub type Result<T> = std::result::Result<T, Error>;

/// The ways a session dies.
///
/// Peer-driven violations and transport failures are fatal to the whole session. A failure on a
/// single user fd is not an error at this level: the owning channel tears down, its CLOSE frame
/// goes out, and the session carries on.
#[derive(Debug)]
pub enum Error {
	/// The peer broke the protocol. Never recoverable per-channel.
	Protocol(ProtocolError),
	/// Polling failed or the transport fds did.
	Io(io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Protocol(err) => write!(f, "protocol error: {err}"),
			Self::Io(err) => write!(f, "i/o error: {err}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Protocol(_) => None,
			Self::Io(err) => Some(err),
		}
	}
}

impl From<ProtocolError> for Error {
	fn from(err: ProtocolError) -> Self {
		Self::Protocol(err)
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<nix::errno::Errno> for Error {
	fn from(err: nix::errno::Errno) -> Self {
		Self::Io(io::Error::from_raw_os_error(err as i32))
	}
}

/// Everything a misbehaving peer can be caught doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
	/// A frame longer than the ingress ring could hold even if fully drained.
	OversizedMessage { kind: u8, missing: usize, room: usize },
	/// A header whose size field cannot even cover the header itself.
	ImpossibleSize { kind: u8, size: u16 },
	/// A fixed-size message with the wrong length.
	WrongMsgSize { kind: u8, expected: u16, received: u16 },
	/// A frame naming a channel outside the user range.
	InvalidChannel { kind: u8, channel: u32 },
	/// DATA aimed at a source, or WINDOW aimed at a sink.
	WrongDirection { channel: u32 },
	/// Window grants summing past `u32::MAX`.
	WindowOverflow { channel: u32 },
	/// More payload than the credit we advertised.
	WindowDesync { channel: u32 },
	/// A message kind nothing in the dispatch chain understands.
	UnknownMsg { kind: u8, size: u16 },
	/// The peer hung up mid-header.
	Disconnected,
	/// The peer hung up mid-message.
	Truncated,
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Self::OversizedMessage { kind, missing, room } => {
				write!(f, "impossibly large message: kind:{kind} outstanding:{missing} room:{room}")
			},
			Self::ImpossibleSize { kind, size } => write!(f, "impossible message: kind:{kind} size:{size}"),
			Self::WrongMsgSize { kind, expected, received } => {
				write!(f, "wrong message size: kind:{kind} expected:{expected} received:{received}")
			},
			Self::InvalidChannel { kind, channel } => write!(f, "invalid channel {channel} (kind:{kind})"),
			Self::WrongDirection { channel } => write!(f, "wrong channel direction ch={channel}"),
			Self::WindowOverflow { channel } => write!(f, "window overflow on channel {channel}"),
			Self::WindowDesync { channel } => write!(f, "window desync on channel {channel}"),
			Self::UnknownMsg { kind, size } => write!(f, "unrecognized command {kind} (sz={size})"),
			Self::Disconnected => f.write_str("peer disconnected"),
			Self::Truncated => f.write_str("truncated message"),
		}
	}
}
