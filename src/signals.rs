use nix::sys::signal::{pthread_sigmask, SigSet, Signal, SigmaskHow};

/// Block `signals` on the current thread and return the mask that was in effect before.
///
/// The returned set is what [`Config::poll_mask`](crate::Config::poll_mask) wants: with the
/// interesting signals blocked everywhere else, `ppoll` atomically swaps the old mask back in for
/// the duration of each wait, so a handler (say, one flipping a termination flag) only ever runs
/// while the session is suspended and its interruption is seen at the top of the loop.
pub fn block_for_poll(signals: &[Signal]) -> nix::Result<SigSet> {
	let mut block = SigSet::empty();
	for &signal in signals {
		block.add(signal);
	}
	let mut prior = SigSet::empty();
	pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut prior))?;
	Ok(prior)
}
