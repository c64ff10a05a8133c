//! Wire-frame tracing, separate from the `log` facade the rest of the crate uses: set
//! `FDMUX_DEBUG=1` to get one stderr line per frame crossing the transport boundary, whatever the
//! embedding program configured for logging.

use crate::msg;
use once_cell::sync::Lazy;
use std::{
	env,
	fmt::Write as _,
	io::{stderr, Write as _},
	time::SystemTime,
};

static FDMUX_DEBUG: Lazy<bool> = Lazy::new(|| matches!(env::var("FDMUX_DEBUG").as_deref(), Ok("1" | "frames")));

/// Emit one line describing a frame, e.g. `[  41523.118] send data@2 sz=12`.
pub(crate) fn frame(prefix: &str, kind: u8, channel: u32, size: usize) {
	if !*FDMUX_DEBUG {
		return;
	}
	let mut line = String::with_capacity(48);
	if let Ok(time) = SystemTime::UNIX_EPOCH.elapsed() {
		let micros = time.as_micros() as u32;
		let _ = write!(line, "[{:>7}.{:>03}]", micros / 1000, micros % 1000);
	} else {
		line.push_str("[???????.???]");
	}
	let _ = writeln!(line, " {prefix} {}@{channel} sz={size}", kind_name(kind));
	let _ = stderr().lock().write_all(line.as_bytes());
}

fn kind_name(kind: u8) -> &'static str {
	match kind {
		msg::MSG_CHANNEL_DATA => "data",
		msg::MSG_CHANNEL_WINDOW => "window",
		msg::MSG_CHANNEL_CLOSE => "close",
		_ => "unknown",
	}
}
