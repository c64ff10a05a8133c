use crate::{
	channel::{Channel, Direction},
	fd::set_nonblocking,
	logging,
	msg::{self, MsgHdr},
	ProtocolError, Result,
};
use log::debug;
use nix::sys::signal::SigSet;
use std::{
	fmt,
	os::unix::io::{AsRawFd, OwnedFd},
};

/// Index of the reserved transport ingress channel: bytes arriving from the peer.
pub const PEER_RX: usize = 0;
/// Index of the reserved transport egress channel: frames queued toward the peer.
pub const PEER_TX: usize = 1;
/// First index a user stream may occupy. Frames never address the reserved channels.
pub const FIRST_USER_CHANNEL: usize = 2;

/// Session construction parameters.
#[derive(Clone, Copy)]
pub struct Config {
	/// Ring capacity of the two transport channels, a power of two. Bounds all transport i/o.
	pub transport_capacity: usize,
	/// Largest frame we may emit, as the peer advertised it during establishment. Clamped to
	/// `u16::MAX` (the header's size field); a value below a WINDOW frame (12 bytes) would starve
	/// control traffic and is a configuration bug.
	pub max_outgoing_msg: u32,
	/// Signal mask installed for the duration of each poll, so pending signals are delivered only
	/// while the session is suspended. `None` leaves the caller's mask alone.
	pub poll_mask: Option<SigSet>,
}

impl Default for Config {
	fn default() -> Self {
		Self { transport_capacity: 4096, max_outgoing_msg: 4096, poll_mask: None }
	}
}

impl fmt::Debug for Config {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// SigSet carries no Debug impl; report only whether a mask is set
		f.debug_struct("Config")
			.field("transport_capacity", &self.transport_capacity)
			.field("max_outgoing_msg", &self.max_outgoing_msg)
			.field("poll_mask", &self.poll_mask.is_some())
			.finish()
	}
}

/// Message dispatch hook.
///
/// Session roles (client / server / stub) layer extra message kinds on top of the base protocol:
/// handle your own kinds first, delegate everything else to [`Session::handle_message`], which is
/// what the provided method body does.
pub trait Dispatch {
	fn dispatch(&mut self, session: &mut Session, header: MsgHdr) -> Result<()> {
		session.handle_message(header)
	}
}

/// The base protocol only: any kind beyond DATA/WINDOW/CLOSE is a protocol error.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDispatch;

impl Dispatch for DefaultDispatch {}

/// One multiplexer endpoint: the fixed channel array plus the state shared by the pump and the
/// poll loop.
///
/// The array is fixed at construction; channels are addressed by index both locally and in
/// frames. Indices [`PEER_RX`] and [`PEER_TX`] are the transport itself.
pub struct Session {
	pub(crate) ch: Vec<Channel>,
	pub(crate) max_outgoing_msg: u32,
	pub(crate) poll_mask: Option<SigSet>,
}

impl Session {
	/// Build a session over an established transport.
	///
	/// `transport_rx` and `transport_tx` are the peer byte stream (they may be duplicates of the
	/// same fd). `channels` is the fixed user channel set, bound to frame numbers in order
	/// starting at [`FIRST_USER_CHANNEL`]. Every fd is switched to nonblocking mode here; the
	/// loop depends on no read or write ever suspending.
	pub fn new(transport_rx: OwnedFd, transport_tx: OwnedFd, channels: Vec<Channel>, config: Config) -> Result<Self> {
		let mut ch = Vec::with_capacity(FIRST_USER_CHANNEL + channels.len());
		ch.push(Channel::peer_rx(transport_rx, config.transport_capacity));
		ch.push(Channel::peer_tx(transport_tx, config.transport_capacity));
		ch.extend(channels);
		for c in &ch {
			if let Some(fd) = &c.fd {
				set_nonblocking(fd.as_raw_fd(), true)?;
			}
		}
		Ok(Self {
			ch,
			max_outgoing_msg: config.max_outgoing_msg.min(u16::MAX as u32),
			poll_mask: config.poll_mask,
		})
	}

	/// Total number of channels, the reserved pair included.
	pub fn nrch(&self) -> usize {
		self.ch.len()
	}

	/// A channel, by index.
	pub fn channel(&self, chno: usize) -> &Channel {
		&self.ch[chno]
	}

	/// Close a user channel from the host side (its endpoint went away). A sink's buffered bytes
	/// still drain to the fd first; the CLOSE frame follows from the next pump once they have.
	pub fn close_channel(&mut self, chno: usize) {
		assert!((FIRST_USER_CHANNEL..self.ch.len()).contains(&chno), "no user channel {chno}");
		debug!("closing channel {chno} locally");
		self.ch[chno].close();
	}

	/// Base dispatch for the three established-session kinds. [`Dispatch`] impls delegate here
	/// for everything they do not intercept.
	pub fn handle_message(&mut self, header: MsgHdr) -> Result<()> {
		match header.kind {
			msg::MSG_CHANNEL_DATA => {
				if (header.size as usize) < msg::DATA_HDR_SIZE {
					return Err(ProtocolError::WrongMsgSize {
						kind: header.kind,
						expected: msg::DATA_HDR_SIZE as u16,
						received: header.size,
					}
					.into());
				}
				let mut fixed = [0; msg::DATA_HDR_SIZE];
				let rb = &mut self.ch[PEER_RX].buf;
				rb.peek(&mut fixed);
				rb.mark_consumed(msg::DATA_HDR_SIZE);
				let channel = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
				logging::frame("recv", header.kind, channel, header.size as usize);
				self.recv_data(channel, header.size as usize - msg::DATA_HDR_SIZE)
			},
			msg::MSG_CHANNEL_WINDOW => {
				let m: [u8; msg::WINDOW_MSG_SIZE] = self.read_cmdmsg(header)?;
				let channel = u32::from_le_bytes([m[4], m[5], m[6], m[7]]);
				let delta = u32::from_le_bytes([m[8], m[9], m[10], m[11]]);
				logging::frame("recv", header.kind, channel, header.size as usize);
				self.recv_window(channel, delta)
			},
			msg::MSG_CHANNEL_CLOSE => {
				let m: [u8; msg::CLOSE_MSG_SIZE] = self.read_cmdmsg(header)?;
				let channel = u32::from_le_bytes([m[4], m[5], m[6], m[7]]);
				logging::frame("recv", header.kind, channel, header.size as usize);
				self.recv_close(channel)
			},
			kind => {
				// consume the frame whole so the failure diagnostic is not a cascade of desyncs
				self.ch[PEER_RX].buf.mark_consumed(header.size as usize);
				Err(ProtocolError::UnknownMsg { kind, size: header.size }.into())
			},
		}
	}

	/// Copy out and consume a fixed-size command message, verifying the advertised size exactly.
	fn read_cmdmsg<const N: usize>(&mut self, header: MsgHdr) -> Result<[u8; N]> {
		if header.size as usize != N {
			return Err(ProtocolError::WrongMsgSize { kind: header.kind, expected: N as u16, received: header.size }
				.into());
		}
		let rb = &mut self.ch[PEER_RX].buf;
		let mut m = [0; N];
		rb.peek(&mut m);
		rb.mark_consumed(N);
		Ok(m)
	}

	fn is_user_channel(&self, channel: u32) -> bool {
		(FIRST_USER_CHANNEL..self.ch.len()).contains(&(channel as usize))
	}

	fn recv_data(&mut self, channel: u32, payload_len: usize) -> Result<()> {
		if !self.is_user_channel(channel) {
			return Err(ProtocolError::InvalidChannel { kind: msg::MSG_CHANNEL_DATA, channel }.into());
		}
		let (reserved, users) = self.ch.split_at_mut(FIRST_USER_CHANNEL);
		let ingress = &mut reserved[PEER_RX];
		let target = &mut users[channel as usize - FIRST_USER_CHANNEL];
		if target.dir != Direction::Sink {
			return Err(ProtocolError::WrongDirection { channel }.into());
		}
		if !target.is_open() {
			// channel already closed locally; drop the late write
			ingress.buf.mark_consumed(payload_len);
			return Ok(());
		}
		if target.buf.room() < payload_len {
			// the peer wrote past the credit we advertised
			return Err(ProtocolError::WindowDesync { channel }.into());
		}
		let [a, b] = ingress.buf.data_iov(payload_len);
		target.write(&[a, b]);
		ingress.buf.mark_consumed(payload_len);
		Ok(())
	}

	fn recv_window(&mut self, channel: u32, delta: u32) -> Result<()> {
		if !self.is_user_channel(channel) {
			return Err(ProtocolError::InvalidChannel { kind: msg::MSG_CHANNEL_WINDOW, channel }.into());
		}
		let c = &mut self.ch[channel as usize];
		if c.dir != Direction::Source {
			return Err(ProtocolError::WrongDirection { channel }.into());
		}
		if !c.is_open() {
			return Ok(()); // stale grant for a channel we already tore down
		}
		if let Some(window) = &mut c.window {
			*window = window.checked_add(delta).ok_or(ProtocolError::WindowOverflow { channel })?;
		}
		Ok(())
	}

	fn recv_close(&mut self, channel: u32) -> Result<()> {
		if !self.is_user_channel(channel) {
			return Ok(()); // a close racing a teardown we already finished
		}
		let c = &mut self.ch[channel as usize];
		c.sent_eof = true; // the peer already knows this stream is gone; suppress our own CLOSE
		if c.dir == Direction::Source {
			// bytes read but not yet framed have no audience anymore
			c.buf.clear();
		}
		c.close();
		Ok(())
	}
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("channels", &self.ch)
			.field("max_outgoing_msg", &self.max_outgoing_msg)
			.finish_non_exhaustive()
	}
}
