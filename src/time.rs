//! Monotonic nanosecond clock, built on the TSC and the calibration
//! ratio `apic::init` derives (spec §4.2's timekeeping accounting,
//! §8 scenario 1's absolute-deadline sleeps).
//!
//! Grounded on `apic.rs`'s own TSC use during calibration; `now_ns`
//! just turns a raw `_rdtsc()` delta into nanoseconds through the same
//! picoseconds-per-cycle ratio that calibration run already computed.

use core::sync::atomic::{AtomicU64, Ordering};

/// TSC value latched at [`init`], so `now_ns` reports time-since-boot
/// rather than a raw (and meaningless pre-calibration) TSC reading.
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Latch the TSC origin. Must run once, after `apic::init` has
/// calibrated `ps_per_cycle` on the bootstrap CPU.
///
/// # Safety
/// Must run exactly once, before any `now_ns` call.
pub unsafe fn init() {
    BOOT_TSC.store(core::arch::x86_64::_rdtsc(), Ordering::Relaxed);
}

fn ns_from_cycles(origin: u64, now: u64, ps_per_cycle: u64) -> u64 {
    let cycles = now.saturating_sub(origin);
    cycles.saturating_mul(ps_per_cycle) / 1000
}

/// Nanoseconds elapsed since [`init`].
pub fn now_ns() -> u64 {
    let origin = BOOT_TSC.load(Ordering::Relaxed);
    let now = unsafe { core::arch::x86_64::_rdtsc() };
    ns_from_cycles(origin, now, crate::apic::ps_per_cycle())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_elapsed_cycles_is_zero_ns() {
        assert_eq!(ns_from_cycles(1000, 1000, 833), 0);
    }

    #[test]
    fn converts_cycles_through_ps_per_cycle() {
        // 1000 cycles at 1000 ps/cycle is exactly 1 microsecond.
        assert_eq!(ns_from_cycles(0, 1000, 1000), 1_000);
    }

    #[test]
    fn never_goes_backwards_on_a_stale_origin() {
        assert_eq!(ns_from_cycles(500, 100, 833), 0);
    }
}
