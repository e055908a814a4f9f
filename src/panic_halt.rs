//! The fatal path: stack walk, frame dump, and the global halt flag a
//! kernel-mode exception or broken invariant raises (spec §7, §9).
//!
//! Grounded on the teacher's `#[panic_handler]` (`main.rs`) for the
//! "log then spin forever" shape; generalized into a reusable
//! `halt_all_cpus` so every CPU, not just the one that faulted, can
//! converge on the same frozen state once it observes [`HALT`].

use core::sync::atomic::{AtomicBool, Ordering};

/// Set by the first CPU to hit a fatal kernel-mode fault. Every other
/// CPU is expected to poll this on its idle/trap-return path and spin
/// once it observes `true` (spec §7: "other CPUs spin on it").
pub static HALT: AtomicBool = AtomicBool::new(false);

/// Walk an `rbp`-chain stack trace starting at `(rbp, rip)`, logging
/// each frame. Stops at a null or misaligned `rbp`, a null return
/// address, or after [`MAX_FRAMES`] — there is no guarantee the chain
/// is well-formed during a fault.
pub fn stack_dump(mut rbp: u64, rip: u64) {
    const MAX_FRAMES: usize = 32;

    log::error!("stack dump: rip={:#x}", rip);
    for depth in 0..MAX_FRAMES {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let ret_addr = unsafe { core::ptr::read((rbp + 8) as *const u64) };
        log::error!("  #{:<2} {:#x}", depth, ret_addr);
        if ret_addr == 0 {
            break;
        }
        rbp = unsafe { core::ptr::read(rbp as *const u64) };
    }
}

/// Set the global halt flag and spin forever with interrupts disabled.
/// Never returns.
pub fn halt_all_cpus() -> ! {
    HALT.store(true, Ordering::SeqCst);
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// True once some CPU has called [`halt_all_cpus`]; other CPUs check
/// this on paths that would otherwise keep scheduling.
pub fn halted() -> bool {
    HALT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_flag_starts_false() {
        assert!(!HALT.load(Ordering::Relaxed));
    }
}
