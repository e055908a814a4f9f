//! Local APIC register file and one-time PIT calibration.
//!
//! Grounded on the enrichment source's `apic.rs`/`pit.rs` for the MMIO
//! register offsets and the PIT programming sequence, narrowed to
//! exactly the registers and the one calibration pass spec §2/§6/§9
//! call for: xAPIC mode only (no x2APIC path — the host this core
//! targets is always pre-x2APIC era hardware per `original_source`),
//! one-shot calibration against the PIT to derive `HZ`'s initial count
//! and a CPU-cycles-per-picosecond ratio for `proftick` accounting.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

use crate::param::HZ;

const LAPIC_BASE: u64 = 0xfee0_0000;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0b0;
const REG_SPURIOUS: u32 = 0x0f0;
const REG_LVT_CMCI: u32 = 0x2f0;
const REG_LVT_TIMER: u32 = 0x320;
const REG_LVT_THERMAL: u32 = 0x330;
const REG_LVT_PERF: u32 = 0x340;
const REG_LVT_LINT1: u32 = 0x360;
const REG_LVT_ERROR: u32 = 0x370;
const REG_TIMER_INIT: u32 = 0x380;
const REG_TIMER_CUR: u32 = 0x390;
const REG_TIMER_DIV: u32 = 0x3e0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_DEST_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

const LVT_MASKED: u32 = 1 << 16;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

const SPURIOUS_ENABLE: u32 = 1 << 8;
const TRAP_SPURIOUS: u32 = crate::param::TRAP_SPURIOUS as u32;
const TRAP_TIMER: u32 = crate::param::TRAP_TIMER as u32;
const TRAP_PERFMASK: u32 = crate::param::TRAP_PERFMASK as u32;

const PIT_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// CPU cycles per calibrated HZ timer tick, set once by [`init`].
static TIMER_INITIAL_COUNT: AtomicU64 = AtomicU64::new(0);
/// Picoseconds per TSC cycle, derived from the same calibration run
/// and consumed by `proc::proftick`'s `prof.totaltime` accounting.
static PS_PER_CYCLE: AtomicU64 = AtomicU64::new(0);
/// Last sampling PMC value the NMI handler read when a PMI fired.
static LAST_PMI_SAMPLE: AtomicU64 = AtomicU64::new(0);

unsafe fn read(reg: u32) -> u32 {
    read_volatile((LAPIC_BASE + reg as u64) as *const u32)
}

unsafe fn write(reg: u32, value: u32) {
    write_volatile((LAPIC_BASE + reg as u64) as *mut u32, value);
}

/// Local APIC id of the calling CPU, used to index the per-CPU table.
pub fn id() -> u32 {
    unsafe { read(REG_ID) >> 24 }
}

/// Send End of Interrupt. Idempotent: the register is write-only zero,
/// so issuing it twice in a row is observably identical to issuing it
/// once (spec §8, idempotence law).
pub fn eoi() {
    unsafe { write(REG_EOI, 0) };
}

/// Re-mask the performance-monitoring interrupt LVT entry after an NMI
/// or `TRAP_PERFMASK` trap has consumed the pending PMI.
pub fn mask_pmi() {
    unsafe { write(REG_LVT_PERF, LVT_MASKED) };
}

/// Read the sampling performance counter the PMI just latched and
/// record it, per spec §4.1's NMI row ("invoke perf gatherer"). Counter
/// 0 is the only one this core drives; whatever consumes profiling
/// data later reads it back through [`last_pmi_sample`].
pub fn gather_pmi_sample() -> u64 {
    let sample = unsafe { core::arch::x86_64::__rdpmc(0) };
    LAST_PMI_SAMPLE.store(sample, Ordering::Relaxed);
    sample
}

/// Most recent value [`gather_pmi_sample`] recorded.
pub fn last_pmi_sample() -> u64 {
    LAST_PMI_SAMPLE.load(Ordering::Relaxed)
}

/// Broadcast `vector` to every CPU but the sender (TLB shootdown's
/// delivery mechanism, spec §8 scenario 6). Spins until the APIC
/// reports the IPI accepted.
pub fn send_ipi_all_but_self(vector: u8) {
    unsafe {
        write(REG_ICR_HIGH, 0);
        write(REG_ICR_LOW, ICR_DEST_ALL_EXCLUDING_SELF | vector as u32);
        while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Bring up this CPU's Local APIC: software-enable it, mask every LVT
/// entry we don't drive, and calibrate the timer against the PIT.
///
/// # Safety
/// Must run once per CPU, after the IDT is loaded, with interrupts
/// disabled. Calibration runs only on the bootstrap CPU (LAPIC id 0);
/// application CPUs reuse the initial count it derives.
pub unsafe fn init(is_bootstrap: bool) {
    write(REG_SPURIOUS, SPURIOUS_ENABLE | TRAP_SPURIOUS);
    write(REG_LVT_CMCI, LVT_MASKED);
    write(REG_LVT_THERMAL, LVT_MASKED);
    write(REG_LVT_LINT1, LVT_MASKED);
    write(REG_LVT_ERROR, LVT_MASKED);
    write(REG_LVT_PERF, LVT_MASKED);

    let initial_count = if is_bootstrap {
        let count = calibrate();
        TIMER_INITIAL_COUNT.store(count as u64, Ordering::Relaxed);
        count
    } else {
        let count = TIMER_INITIAL_COUNT.load(Ordering::Relaxed);
        assert!(count != 0, "secondary CPU started timer before calibration ran");
        count as u32
    };

    write(REG_TIMER_DIV, 0x0b); // divide by 1
    write(REG_LVT_TIMER, TRAP_TIMER | LVT_TIMER_PERIODIC);
    write(REG_TIMER_INIT, initial_count);

    eoi();
}

/// Measure the LAPIC timer's countdown rate against the PIT's known
/// 1.193182 MHz oscillator and derive the initial-count value that
/// yields `HZ` ticks per second, plus picoseconds-per-TSC-cycle.
///
/// # Safety
/// Must run with interrupts disabled; busy-waits for roughly 10ms.
unsafe fn calibrate() -> u32 {
    const CALIBRATION_MS: u32 = 10;
    let pit_divisor = (PIT_FREQUENCY / (1000 / CALIBRATION_MS)).min(65535);
    assert!(pit_divisor != 0, "LAPIC calibration: PIT divisor underflowed");

    write(REG_TIMER_DIV, 0x0b);
    write(REG_TIMER_INIT, u32::MAX);

    let tsc_start = core::arch::x86_64::_rdtsc();

    Port::<u8>::new(PIT_COMMAND).write(0x30); // channel 0, lobyte/hibyte, mode 0
    Port::<u8>::new(PIT_CHANNEL0).write((pit_divisor & 0xff) as u8);
    Port::<u8>::new(PIT_CHANNEL0).write(((pit_divisor >> 8) & 0xff) as u8);
    loop {
        Port::<u8>::new(PIT_COMMAND).write(0xe2);
        let status = Port::<u8>::new(PIT_CHANNEL0).read();
        if status & 0x80 != 0 {
            break;
        }
        core::hint::spin_loop();
    }

    let tsc_end = core::arch::x86_64::_rdtsc();
    let lapic_elapsed = u32::MAX - read(REG_TIMER_CUR);
    assert!(lapic_elapsed != 0, "LAPIC calibration: timer did not advance");
    assert!(lapic_elapsed != u32::MAX, "LAPIC calibration: timer wrapped");

    let ticks_per_sec = lapic_elapsed as u64 * (1000 / CALIBRATION_MS as u64);
    let initial_count = (ticks_per_sec / HZ) as u32;

    let tsc_elapsed = tsc_end.saturating_sub(tsc_start);
    if tsc_elapsed != 0 {
        let ps_elapsed = CALIBRATION_MS as u64 * 1_000_000_000;
        PS_PER_CYCLE.store(ps_elapsed / tsc_elapsed, Ordering::Relaxed);
    }

    initial_count
}

/// Picoseconds elapsed per TSC cycle, for converting raw cycle deltas
/// into `prof.totaltime` nanosecond accounting.
pub fn ps_per_cycle() -> u64 {
    PS_PER_CYCLE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pit_divisor_for_10ms_window() {
        let divisor = PIT_FREQUENCY / 100;
        assert_eq!(divisor, 11931);
    }
}
