//! The nonblocking core: the frame pump and the poll-driven i/o pass.
//!
//! The two halves alternate. [`Session::wait_io`] is the only place the task suspends; it moves
//! bytes between fds and ring buffers. [`Session::pump`] never suspends; it moves whole frames
//! between ring buffers. Everything the pump wants to say goes through the egress ring, so when a
//! frame does not fit the current budget it is simply said on a later pass.

use crate::{
	channel::{Channel, Direction},
	logging,
	msg::{self, MsgHdr},
	session::{Dispatch, Session, FIRST_USER_CHANNEL, PEER_RX, PEER_TX},
	Error, ProtocolError, Result,
};
use log::{log_enabled, trace, warn, Level};
use nix::{
	errno::Errno,
	poll::{ppoll, PollFd, PollFlags},
};
use std::cmp;

impl Session {
	/// The budget for the next outgoing frame: the peer's advertised limit, capped by the room
	/// actually left in the egress ring.
	fn max_outmsg(&self) -> usize {
		cmp::min(self.max_outgoing_msg as usize, self.ch[PEER_TX].buf.room())
	}

	/// One nonblocking pass over the whole session.
	///
	/// First drains every complete frame from the ingress ring through `dispatch`, then walks the
	/// user channels in index order emitting what they owe the peer: WINDOW acks for all channels
	/// before any DATA (so the remote sender can keep draining), then per channel one DATA frame,
	/// the deferred fd release, and finally CLOSE once the stream is spent.
	pub fn pump(&mut self, dispatch: &mut impl Dispatch) -> Result<()> {
		loop {
			match msg::detect_message(&self.ch[PEER_RX].buf)? {
				Some(header) => dispatch.dispatch(self, header)?,
				None => break,
			}
		}

		let budget = self.max_outgoing_msg as usize;
		let (reserved, users) = self.ch.split_at_mut(FIRST_USER_CHANNEL);
		let egress = &mut reserved[PEER_TX];

		for (i, c) in users.iter_mut().enumerate() {
			emit_window_ack(c, (FIRST_USER_CHANNEL + i) as u32, egress, budget);
		}
		for (i, c) in users.iter_mut().enumerate() {
			let chno = (FIRST_USER_CHANNEL + i) as u32;
			emit_data(c, chno, egress, budget);
			finish_pending_close(c);
			emit_close(c, chno, egress, budget);
		}
		Ok(())
	}

	/// One poll pass: wait (with the session's signal mask installed) until some fd is ready,
	/// then service every ready channel.
	///
	/// Skips the wait entirely when no channel requests an event; the caller decides whether that
	/// means the session is done. `EINTR` just returns and the caller's loop comes back around.
	/// An fd failure on a user channel tears that channel down and the session continues; on a
	/// transport channel it is fatal.
	pub fn wait_io(&mut self) -> Result<()> {
		self.trace_channels("before wait_io");

		let mut polls = Vec::with_capacity(self.ch.len());
		let mut work = PollFlags::empty();
		for c in &self.ch {
			let (fd, events) = c.poll_request();
			work |= events;
			polls.push(PollFd::new(fd, events));
		}

		if !work.is_empty() {
			trace!("> ppoll(nfds={}, masked={})", polls.len(), self.poll_mask.is_some());
			match ppoll(&mut polls, None, self.poll_mask) {
				Ok(n) => trace!("< {n}"),
				Err(Errno::EINTR) => trace!("< EINTR"),
				Err(err) => return Err(err.into()),
			}
		}

		for (chno, poll) in polls.iter().enumerate() {
			let revents = poll.revents().unwrap_or_else(PollFlags::empty);
			if revents.is_empty() {
				continue;
			}
			if let Err(err) = self.ch[chno].tick() {
				if chno < FIRST_USER_CHANNEL {
					return Err(Error::Io(err)); // the transport itself failed
				}
				warn!("channel {chno} fd failed: {err}");
				self.ch[chno].fail();
			}
		}
		Ok(())
	}

	/// Queue a message that must reach the egress ring whole, pumping (and waiting for i/o when
	/// pumping alone frees no room) until it fits.
	///
	/// Establishment and control paths use this. The message is never split, and since the pump
	/// emits one frame at a time under the same budget it is never interleaved mid-way either.
	pub fn queue_message(&mut self, dispatch: &mut impl Dispatch, m: &[u8]) -> Result<()> {
		assert!(m.len() >= msg::MSG_HDR_SIZE, "message shorter than its header");
		let header = MsgHdr::decode([m[0], m[1], m[2], m[3]]);
		assert_eq!(header.size as usize, m.len(), "header size disagrees with the buffer");
		let limit = cmp::min(self.max_outgoing_msg as usize, self.ch[PEER_TX].buf.capacity());
		assert!(m.len() <= limit, "a {} byte message can never fit (limit {limit})", m.len());

		while self.max_outmsg() < m.len() {
			self.pump(dispatch)?;
			if self.max_outmsg() >= m.len() {
				break;
			}
			self.wait_io()?;
		}
		let channel =
			if m.len() >= msg::DATA_HDR_SIZE { u32::from_le_bytes([m[4], m[5], m[6], m[7]]) } else { 0 };
		logging::frame("send[synch]", header.kind, channel, m.len());
		self.ch[PEER_TX].write(&[m]);
		Ok(())
	}

	/// Whether the session has nothing left to do: every user stream fully shut down (CLOSE sent,
	/// fd released, buffer drained) and both transport rings empty.
	pub fn finished(&self) -> bool {
		self.ch[PEER_RX].buf.is_empty()
			&& self.ch[PEER_TX].buf.is_empty()
			&& self.ch[FIRST_USER_CHANNEL..].iter().all(|c| c.sent_eof && !c.is_open() && c.buf.is_empty())
	}

	/// Drive the session to completion: alternate [`pump`](Self::pump) and
	/// [`wait_io`](Self::wait_io) until [`finished`](Self::finished), or fail with
	/// [`Disconnected`](ProtocolError::Disconnected) when the peer drops the transport first.
	pub fn run(&mut self, dispatch: &mut impl Dispatch) -> Result<()> {
		loop {
			self.pump(dispatch)?;
			if self.finished() {
				return Ok(());
			}
			if !self.ch[PEER_RX].is_open() {
				return Err(ProtocolError::Disconnected.into());
			}
			self.wait_io()?;
		}
	}

	fn trace_channels(&self, label: &str) {
		if log_enabled!(Level::Trace) {
			for (chno, c) in self.ch.iter().enumerate() {
				trace!("{label}: ch[{chno}] {c:?}");
			}
		}
	}
}

fn frame_budget(egress: &Channel, budget: usize) -> usize {
	cmp::min(budget, egress.buf.room())
}

/// Advertise the credit freed by bytes this sink delivered since the last ack.
fn emit_window_ack(c: &mut Channel, chno: u32, egress: &mut Channel, budget: usize) {
	if c.bytes_written > 0 && frame_budget(egress, budget) >= msg::WINDOW_MSG_SIZE {
		let m = msg::channel_window(chno, c.bytes_written);
		logging::frame("send", msg::MSG_CHANNEL_WINDOW, chno, msg::WINDOW_MSG_SIZE);
		egress.write(&[&m]);
		c.bytes_written = 0;
	}
}

/// Frame one DATA message from a source channel's buffered bytes, as much as fits the budget.
fn emit_data(c: &mut Channel, chno: u32, egress: &mut Channel, budget: usize) {
	if c.dir != Direction::Source || c.sent_eof {
		return;
	}
	let maxout = frame_budget(egress, budget);
	let avail = c.buf.len();
	if maxout > msg::DATA_HDR_SIZE && avail > 0 {
		let payload_len = cmp::min(avail, maxout - msg::DATA_HDR_SIZE);
		let m = msg::channel_data_header(chno, payload_len);
		logging::frame("send", msg::MSG_CHANNEL_DATA, chno, msg::DATA_HDR_SIZE + payload_len);
		let [a, b] = c.buf.data_iov(payload_len);
		egress.write(&[&m, a, b]);
		c.buf.mark_consumed(payload_len);
	}
}

/// Release a sink fd whose close was deferred until its buffer drained.
fn finish_pending_close(c: &mut Channel) {
	if c.dir == Direction::Sink && c.is_open() && c.pending_close && c.buf.is_empty() {
		c.close();
	}
}

/// Tell the peer this stream is finished: fd gone, buffer drained, CLOSE not yet sent.
fn emit_close(c: &mut Channel, chno: u32, egress: &mut Channel, budget: usize) {
	if !c.is_open() && !c.sent_eof && c.buf.is_empty() && frame_budget(egress, budget) >= msg::CLOSE_MSG_SIZE {
		let m = msg::channel_close(chno);
		logging::frame("send", msg::MSG_CHANNEL_CLOSE, chno, msg::CLOSE_MSG_SIZE);
		egress.write(&[&m]);
		c.sent_eof = true;
	}
}

#[cfg(test)]
mod tests {
	use crate::{
		channel::Channel,
		msg,
		session::{Config, DefaultDispatch, Session, PEER_RX, PEER_TX},
		Error, ProtocolError,
	};
	use nix::unistd::pipe;
	use std::os::unix::io::{FromRawFd, OwnedFd};

	fn fd_pair() -> (OwnedFd, OwnedFd) {
		let (r, w) = pipe().unwrap();
		// Safety: pipe() returned two fresh fds that nothing else owns
		unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) }
	}

	/// A session over pipes, plus the far ends kept alive for the test's duration.
	fn session_with(channels: Vec<Channel>) -> (Session, OwnedFd, OwnedFd) {
		let (rx, peer_w) = fd_pair();
		let (peer_r, tx) = fd_pair();
		let session = Session::new(rx, tx, channels, Config::default()).unwrap();
		(session, peer_w, peer_r)
	}

	fn user_source(window: u32) -> (Channel, OwnedFd) {
		let (r, w) = fd_pair();
		(Channel::source(r, 64, window), w)
	}

	fn user_sink(capacity: usize) -> (Channel, OwnedFd) {
		let (r, w) = fd_pair();
		(Channel::sink(w, capacity), r)
	}

	fn inject(session: &mut Session, bytes: &[u8]) {
		session.ch[PEER_RX].buf.extend(bytes);
	}

	/// Take everything queued toward the peer.
	fn sent(session: &mut Session) -> Vec<u8> {
		let n = session.ch[PEER_TX].buf.len();
		let mut out = vec![0; n];
		session.ch[PEER_TX].buf.peek(&mut out);
		session.ch[PEER_TX].buf.mark_consumed(n);
		out
	}

	fn data_frame(channel: u32, payload: &[u8]) -> Vec<u8> {
		let mut m = msg::channel_data_header(channel, payload.len()).to_vec();
		m.extend_from_slice(payload);
		m
	}

	#[test]
	fn data_for_an_unknown_channel_is_fatal() {
		let (mut s, _w, _r) = session_with(vec![]);
		inject(&mut s, &data_frame(7, b"hi"));
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::InvalidChannel { channel: 7, .. })) => (),
			other => panic!("expected InvalidChannel, got {other:?}"),
		}
	}

	#[test]
	fn data_for_a_source_is_fatal() {
		let (c, _keep) = user_source(16);
		let (mut s, _w, _r) = session_with(vec![c]);
		inject(&mut s, &data_frame(2, b"hi"));
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::WrongDirection { channel: 2 })) => (),
			other => panic!("expected WrongDirection, got {other:?}"),
		}
	}

	#[test]
	fn data_for_a_closed_channel_is_consumed_silently() {
		let (c, _keep) = user_sink(64);
		let (mut s, _w, _r) = session_with(vec![c]);
		s.close_channel(2);
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(sent(&mut s), msg::channel_close(2).to_vec());
		inject(&mut s, &data_frame(2, b"late"));
		s.pump(&mut DefaultDispatch).unwrap();
		assert!(s.ch[PEER_RX].buf.is_empty());
		assert_eq!(sent(&mut s), Vec::<u8>::new());
	}

	#[test]
	fn payload_past_the_advertised_credit_is_fatal() {
		let (c, _keep) = user_sink(8);
		let (mut s, _w, _r) = session_with(vec![c]);
		inject(&mut s, &data_frame(2, &[0x5a; 16]));
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::WindowDesync { channel: 2 })) => (),
			other => panic!("expected WindowDesync, got {other:?}"),
		}
	}

	#[test]
	fn zero_length_data_is_a_noop_not_an_eof() {
		let (c, _keep) = user_sink(64);
		let (mut s, _w, _r) = session_with(vec![c]);
		inject(&mut s, &data_frame(2, b""));
		s.pump(&mut DefaultDispatch).unwrap();
		assert!(s.ch[2].is_open());
		assert!(!s.ch[2].sent_eof);
		assert_eq!(sent(&mut s), Vec::<u8>::new());
	}

	#[test]
	fn runt_data_frame_is_fatal() {
		let (mut s, _w, _r) = session_with(vec![]);
		inject(&mut s, &[msg::MSG_CHANNEL_DATA, 0, 3, 0]);
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::WrongMsgSize { received: 3, .. })) => (),
			other => panic!("expected WrongMsgSize, got {other:?}"),
		}
	}

	#[test]
	fn window_grants_accumulate_until_overflow() {
		let (c, _keep) = user_source(0);
		let (mut s, _w, _r) = session_with(vec![c]);
		inject(&mut s, &msg::channel_window(2, u32::MAX));
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(s.ch[2].window, Some(u32::MAX));
		inject(&mut s, &msg::channel_window(2, 1));
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::WindowOverflow { channel: 2 })) => (),
			other => panic!("expected WindowOverflow, got {other:?}"),
		}
	}

	#[test]
	fn window_for_a_closed_channel_is_ignored() {
		let (c, _keep) = user_source(4);
		let (mut s, _w, _r) = session_with(vec![c]);
		s.close_channel(2);
		inject(&mut s, &msg::channel_window(2, 16));
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(s.ch[2].window, Some(4));
	}

	#[test]
	fn close_from_the_peer_suppresses_our_close_frame() {
		let (c, _keep) = user_source(16);
		let (mut s, _w, _r) = session_with(vec![c]);
		inject(&mut s, &msg::channel_close(2));
		s.pump(&mut DefaultDispatch).unwrap();
		assert!(s.ch[2].sent_eof);
		assert!(!s.ch[2].is_open());
		assert_eq!(sent(&mut s), Vec::<u8>::new());
	}

	#[test]
	fn no_data_is_framed_after_the_peer_closed_the_stream() {
		let (c, _keep) = user_source(16);
		let (mut s, _w, _r) = session_with(vec![c]);
		s.ch[2].buf.extend(b"stale");
		inject(&mut s, &msg::channel_close(2));
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(sent(&mut s), Vec::<u8>::new());
		assert!(s.finished());
	}

	#[test]
	fn close_for_an_unknown_channel_is_ignored() {
		let (mut s, _w, _r) = session_with(vec![]);
		inject(&mut s, &msg::channel_close(9));
		s.pump(&mut DefaultDispatch).unwrap();
		assert!(s.ch[PEER_RX].buf.is_empty());
	}

	#[test]
	fn unknown_kind_is_consumed_whole_before_failing() {
		let (mut s, _w, _r) = session_with(vec![]);
		inject(&mut s, &[0xee, 0, 6, 0, 1, 2]);
		inject(&mut s, &msg::channel_close(9));
		match s.pump(&mut DefaultDispatch) {
			Err(Error::Protocol(ProtocolError::UnknownMsg { kind: 0xee, size: 6 })) => (),
			other => panic!("expected UnknownMsg, got {other:?}"),
		}
		// only the unknown frame was consumed; the next one is still intact
		assert_eq!(s.ch[PEER_RX].buf.len(), msg::CLOSE_MSG_SIZE);
	}

	#[test]
	fn acks_are_emitted_before_any_data() {
		let (src, _keep_src) = user_source(16);
		let (sink, _keep_sink) = user_sink(64);
		let (mut s, _w, _r) = session_with(vec![src, sink]);
		s.ch[2].buf.extend(b"payload");
		s.ch[3].bytes_written = 5;
		s.pump(&mut DefaultDispatch).unwrap();
		let mut expect = msg::channel_window(3, 5).to_vec();
		expect.extend_from_slice(&data_frame(2, b"payload"));
		assert_eq!(sent(&mut s), expect);
	}

	#[test]
	fn data_emission_respects_the_frame_budget() {
		let (c, _keep) = user_source(64);
		let (rx, _peer_w) = fd_pair();
		let (_peer_r, tx) = fd_pair();
		let config = Config { max_outgoing_msg: 16, ..Config::default() };
		let mut s = Session::new(rx, tx, vec![c], config).unwrap();
		s.ch[2].buf.extend(&[0x42; 20]);
		s.pump(&mut DefaultDispatch).unwrap();
		// one frame per channel per pump, payload capped at budget - header
		assert_eq!(sent(&mut s), data_frame(2, &[0x42; 8]));
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(sent(&mut s), data_frame(2, &[0x42; 8]));
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(sent(&mut s), data_frame(2, &[0x42; 4]));
	}

	#[test]
	fn source_eof_drains_buffered_bytes_before_close() {
		let (c, keep) = user_source(64);
		let (mut s, _w, _r) = session_with(vec![c]);
		drop(keep); // our end of the pipe goes away
		s.ch[2].buf.extend(b"tail");
		s.ch[2].fd = None; // as tick() would on reading EOF
		s.pump(&mut DefaultDispatch).unwrap();
		let mut expect = data_frame(2, b"tail");
		expect.extend_from_slice(&msg::channel_close(2));
		assert_eq!(sent(&mut s), expect);
		assert!(s.ch[2].sent_eof);
		// close is emitted exactly once
		s.pump(&mut DefaultDispatch).unwrap();
		assert_eq!(sent(&mut s), Vec::<u8>::new());
	}

	#[test]
	fn a_session_with_no_user_channels_is_immediately_finished() {
		let (mut s, _w, _r) = session_with(vec![]);
		assert!(s.finished());
		s.run(&mut DefaultDispatch).unwrap();
	}

	#[test]
	fn finished_requires_drained_rings_and_spent_streams() {
		let (c, _keep) = user_sink(64);
		let (mut s, _w, _r) = session_with(vec![c]);
		assert!(!s.finished());
		s.close_channel(2);
		assert!(!s.finished()); // CLOSE not yet emitted
		s.pump(&mut DefaultDispatch).unwrap();
		assert!(!s.finished()); // CLOSE still queued in the egress ring
		let _ = sent(&mut s);
		assert!(s.finished());
	}
}
