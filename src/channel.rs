use crate::ringbuf::RingBuf;
use log::trace;
use nix::{errno::Errno, poll::PollFlags, sys::uio};
use std::{
	cmp,
	io::{self, IoSlice, IoSliceMut},
	os::unix::io::{AsRawFd, OwnedFd, RawFd},
};

/// Which way bytes flow between the local fd and the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// Reads the local fd; buffered bytes are framed outward as DATA.
	Source,
	/// Receives DATA from the peer; buffered bytes are written to the local fd.
	Sink,
}

/// One endpoint of a multiplexed stream.
///
/// A channel owns its fd and its ring buffer; everything else in the session refers to it by
/// index. Dropping the fd (end-of-stream, local close, fd failure) leaves the buffer behind so
/// in-flight bytes still reach their destination before the CLOSE frame goes out.
#[derive(Debug)]
pub struct Channel {
	pub(crate) dir: Direction,
	/// Local fd; `None` once the endpoint is closed locally.
	pub(crate) fd: Option<OwnedFd>,
	pub(crate) buf: RingBuf,
	/// Credit the peer has granted (sources): bytes we may still read and frame. `None` on the
	/// transport ingress channel, which is not flow-controlled.
	pub(crate) window: Option<u32>,
	/// Bytes delivered to the fd since the last WINDOW frame we sent; the next ack's delta.
	pub(crate) bytes_written: u32,
	/// We have emitted (or been spared emitting) CLOSE for this channel.
	pub(crate) sent_eof: bool,
	/// Release the fd once the buffer drains.
	pub(crate) pending_close: bool,
	/// Only user sinks advertise credit; the transport egress ring must never generate acks.
	pub(crate) track_bytes_written: bool,
}

impl Channel {
	/// A channel that reads `fd` and streams its bytes to the peer, starting with `window` bytes
	/// of credit.
	pub fn source(fd: OwnedFd, capacity: usize, window: u32) -> Self {
		Self::new(Direction::Source, fd, capacity, Some(window), false)
	}

	/// A channel that writes bytes received from the peer out to `fd`.
	pub fn sink(fd: OwnedFd, capacity: usize) -> Self {
		Self::new(Direction::Sink, fd, capacity, None, true)
	}

	/// Transport ingress: the peer byte stream, read into the frame ring. Not flow-controlled.
	pub(crate) fn peer_rx(fd: OwnedFd, capacity: usize) -> Self {
		Self::new(Direction::Source, fd, capacity, None, false)
	}

	/// Transport egress: frames queued until the transport fd can take them.
	pub(crate) fn peer_tx(fd: OwnedFd, capacity: usize) -> Self {
		Self::new(Direction::Sink, fd, capacity, None, false)
	}

	fn new(dir: Direction, fd: OwnedFd, capacity: usize, window: Option<u32>, track_bytes_written: bool) -> Self {
		Self {
			dir,
			fd: Some(fd),
			buf: RingBuf::with_capacity(capacity),
			window,
			bytes_written: 0,
			sent_eof: false,
			pending_close: false,
			track_bytes_written,
		}
	}

	pub fn direction(&self) -> Direction {
		self.dir
	}

	/// Whether the local fd is still held.
	pub fn is_open(&self) -> bool {
		self.fd.is_some()
	}

	/// The fd and event set this channel wants from the next poll: readable while a source has
	/// both buffer room and credit, writable while a sink has bytes to deliver. Returns fd −1
	/// (ignored by poll(2)) when there is nothing to wait for, which also keeps idle channels from
	/// waking the loop with bare POLLHUPs they could do nothing about.
	pub(crate) fn poll_request(&self) -> (RawFd, PollFlags) {
		let fd = match &self.fd {
			Some(fd) => fd.as_raw_fd(),
			None => return (-1, PollFlags::empty()),
		};
		match self.dir {
			Direction::Source if self.buf.room() > 0 && self.window != Some(0) => (fd, PollFlags::POLLIN),
			Direction::Sink if !self.buf.is_empty() => (fd, PollFlags::POLLOUT),
			_ => (-1, PollFlags::empty()),
		}
	}

	/// Service the fd once: one nonblocking scatter read (source) or gather write (sink).
	///
	/// `EAGAIN` is a no-op and end-of-stream on a source releases the fd; any other failure
	/// propagates so the caller can apply its per-fd policy.
	pub(crate) fn tick(&mut self) -> io::Result<()> {
		match self.dir {
			Direction::Source => self.fill_from_fd(),
			Direction::Sink => self.drain_to_fd(),
		}
	}

	fn fill_from_fd(&mut self) -> io::Result<()> {
		let fd = match &self.fd {
			Some(fd) => fd.as_raw_fd(),
			None => return Ok(()),
		};
		let credit = self.window.map_or(usize::MAX, |w| w as usize);
		let limit = cmp::min(self.buf.room(), credit);
		if limit == 0 {
			return Ok(());
		}
		let [a, b] = self.buf.space_iov();
		let a_len = cmp::min(a.len(), limit);
		let b_len = cmp::min(b.len(), limit - a_len);
		let mut iov = [IoSliceMut::new(&mut a[..a_len]), IoSliceMut::new(&mut b[..b_len])];
		trace!("> readv(fd={fd}, iov=[{a_len}, {b_len}])");
		match uio::readv(fd, &mut iov) {
			Ok(0) => {
				trace!("< eof");
				self.fd = None;
			},
			Ok(n) => {
				trace!("< {n}");
				self.buf.mark_filled(n);
				if let Some(window) = &mut self.window {
					*window -= n as u32; // n <= limit <= window
				}
			},
			Err(Errno::EAGAIN) => trace!("< EAGAIN"),
			Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
		}
		Ok(())
	}

	fn drain_to_fd(&mut self) -> io::Result<()> {
		let fd = match &self.fd {
			Some(fd) => fd.as_raw_fd(),
			None => return Ok(()),
		};
		let avail = self.buf.len();
		if avail == 0 {
			return Ok(());
		}
		let [a, b] = self.buf.data_iov(avail);
		let iov = [IoSlice::new(a), IoSlice::new(b)];
		trace!("> writev(fd={fd}, iov=[{}, {}])", a.len(), b.len());
		match uio::writev(fd, &iov) {
			Ok(n) => {
				trace!("< {n}");
				self.buf.mark_consumed(n);
				if self.track_bytes_written {
					self.bytes_written += n as u32;
				}
			},
			Err(Errno::EAGAIN) => trace!("< EAGAIN"),
			Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
		}
		Ok(())
	}

	/// Append bytes for this endpoint, scattered across `parts`. Callers check room first; for
	/// peer payloads the window protocol guarantees it.
	pub(crate) fn write(&mut self, parts: &[&[u8]]) {
		let total: usize = parts.iter().map(|part| part.len()).sum();
		assert!(total <= self.buf.room(), "writing {total} bytes into {} free", self.buf.room());
		for part in parts {
			self.buf.extend(part);
		}
	}

	/// Close the local endpoint. A sink holding undelivered bytes keeps its fd until they drain;
	/// the pump releases it afterwards and then emits the CLOSE frame.
	pub(crate) fn close(&mut self) {
		self.pending_close = true;
		if self.dir == Direction::Source || self.buf.is_empty() {
			self.fd = None;
		}
	}

	/// Tear down after an fd error. A sink's buffer has nowhere left to drain and is dropped so
	/// the CLOSE frame is not withheld; a source's buffered bytes still reach the peer first.
	pub(crate) fn fail(&mut self) {
		self.fd = None;
		self.pending_close = true;
		if self.dir == Direction::Sink {
			self.buf.clear();
		}
	}
}
