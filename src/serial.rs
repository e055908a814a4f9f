//! 16550 UART console sink, used only for panic output and the `log`
//! backend (spec §6's `pmsg(a)` accessor). Grounded on the x86-64
//! reference crate's `serial.rs` and on the teacher's `Printer`
//! (`kernel/src/printf.rs`), which wraps its writer in a `Spinlock` so
//! concurrent `printf!`s from different CPUs don't interleave; the
//! same discipline is applied here via `PMSG_LOCK`.

use core::fmt::Write;
use uart_16550::SerialPort;

use crate::spinlock::Spinlock;

const COM1_PORT: u16 = 0x3f8;

static PMSG_LOCK: Spinlock = Spinlock::new("pmsg");
static mut SERIAL: Option<SerialPort> = None;

/// Bring up the COM1 UART. Must run once during bootstrap, before any
/// `pmsg`/log call.
pub fn init() {
    let mut port = unsafe { SerialPort::new(COM1_PORT) };
    port.init();
    unsafe {
        SERIAL = Some(port);
    }
}

/// Console write with attribute, spec §6's `pmsg(a)`. The "attribute"
/// here is the log level prefix baked in by `logger.rs`; the 16550
/// itself has no text attributes to carry.
pub fn pmsg(s: &str) {
    PMSG_LOCK.acquire();
    unsafe {
        if let Some(port) = SERIAL.as_mut() {
            let _ = port.write_str(s);
        }
    }
    PMSG_LOCK.release();
}
