use log::trace;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::os::unix::io::RawFd;

/// Switch an fd's `O_NONBLOCK` flag.
///
/// Every channel fd is put into nonblocking mode at session construction; the i/o loop depends on
/// reads and writes never suspending.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<()> {
	let bits = fcntl(fd, FcntlArg::F_GETFL)?;
	let mut flags = OFlag::from_bits_truncate(bits);
	flags.set(OFlag::O_NONBLOCK, nonblocking);
	trace!("fcntl(fd={fd}, F_SETFL, {flags:?})");
	fcntl(fd, FcntlArg::F_SETFL(flags))?;
	Ok(())
}
