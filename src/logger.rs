//! `log::Log` backend for the kernel, writing through `serial::pmsg`.
//!
//! The teacher wires a `printf!`/`debug_log!` macro pair straight to
//! its console; this crate uses the `log` facade instead (already a
//! teacher dependency — see `Cargo.toml`) so trap classification,
//! scheduler transitions, and LAPIC calibration can log at the right
//! level without every call site hand-rolling a format string.

use core::fmt::Write;
use log::{Level, Metadata, Record};

use crate::serial;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = heapless_line::Line::new();
        let _ = write!(line, "[{:>5}] {}\n", record.level(), record.args());
        serial::pmsg(line.as_str());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Must run once during bootstrap, after
/// `serial::init`.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .expect("logger already installed");
}

/// A fixed-capacity line buffer so the logger never allocates — there
/// is no heap in this kernel. Long lines are truncated rather than
/// panicking.
mod heapless_line {
    use core::fmt;

    const CAP: usize = 256;

    pub struct Line {
        buf: [u8; CAP],
        len: usize,
    }

    impl Line {
        pub const fn new() -> Self {
            Line { buf: [0; CAP], len: 0 }
        }

        pub fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
        }
    }

    impl fmt::Write for Line {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let bytes = s.as_bytes();
            let room = CAP - self.len;
            let take = bytes.len().min(room);
            self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
            self.len += take;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::heapless_line::Line;
    use core::fmt::Write;

    #[test]
    fn truncates_rather_than_overflows() {
        let mut line = Line::new();
        let long = "x".repeat(1000);
        let _ = write!(line, "{}", long);
        assert_eq!(line.as_str().len(), 256);
    }
}
