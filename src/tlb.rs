//! Cross-CPU TLB invalidation via an acknowledgement-counter IPI
//! protocol (spec §4.1's "TLB-shootdown IPI" row, §5 ordering
//! guarantee, §8 scenario 6).
//!
//! Grounded directly on spec §8 scenario 6's concrete walkthrough: one
//! initiating CPU publishes the target page-map and an acknowledgement
//! count, broadcasts IPI vector 70 through `apic::send_ipi_all_but_self`,
//! and spins on the count while every receiving CPU runs this module's
//! `tlb_shootdown` off the trap dispatcher and decrements it.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::apic;
use crate::cpu::mycpu;
use crate::param::TRAP_TLBSHOOT;
use crate::trap::TrapFrame;

/// Page-map root being shot down. Only meaningful while
/// [`TLBSHOOT_WAIT`] is nonzero.
static TLBSHOOT_PMAP: AtomicU64 = AtomicU64::new(0);
/// Acknowledgement counter the broadcaster spins on.
static TLBSHOOT_WAIT: AtomicUsize = AtomicUsize::new(0);

/// Invalidate `pmap` on every other online CPU and block until all of
/// them have acknowledged. Called by the CPU that just mutated a
/// page-map shared with other CPUs.
///
/// # Safety
/// Must run with `THREAD_LOCK` not held by the caller (receiving CPUs
/// may need it indirectly via `sched_run`/`sched_halt`) and with
/// `other_cpu_count` an accurate count of CPUs besides the caller.
pub unsafe fn shootdown(pmap: u64, other_cpu_count: usize) {
    TLBSHOOT_PMAP.store(pmap, Ordering::Release);
    TLBSHOOT_WAIT.store(other_cpu_count, Ordering::Release);
    apic::send_ipi_all_but_self(TRAP_TLBSHOOT as u8);
    while TLBSHOOT_WAIT.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
}

/// Receiving side, invoked by `trap_dispatch` for `TRAP_TLBSHOOT`:
/// invalidate this CPU's TLB entries for the published page-map,
/// acknowledge, and resume whatever this CPU was doing. Never returns.
///
/// # Safety
/// Must be called from the trap dispatcher with interrupts disabled
/// and `frame` pointing at this CPU's trap-entry staging slot.
/// Pure half of the receiving side's decision (spec §8 scenario 6):
/// only a CPU whose own page-map matches the one being shot down needs
/// to flush.
fn should_flush(my_pmap: u64, target_pmap: u64) -> bool {
    my_pmap == target_pmap
}

pub unsafe fn tlb_shootdown(frame: *mut TrapFrame) -> ! {
    let pmap = TLBSHOOT_PMAP.load(Ordering::Acquire);
    if should_flush(mycpu().pmap.load(Ordering::Relaxed), pmap) {
        x86_64::instructions::tlb::flush_all();
    }
    TLBSHOOT_WAIT.fetch_sub(1, Ordering::AcqRel);
    apic::eoi();

    match mycpu().cur_thread() {
        Some(idx) => crate::proc::sched_run(idx, frame),
        None => crate::proc::sched_halt(),
    }
}

// TLBSHOOT_WAIT/TLBSHOOT_PMAP are process-global, so these tests need
// `cargo test -- --test-threads=1` to avoid racing each other.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_counter_starts_idle() {
        assert_eq!(TLBSHOOT_WAIT.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shootdown_targets_only_matching_pmap() {
        assert!(should_flush(0x1000, 0x1000));
        assert!(!should_flush(0x1000, 0x2000));
    }

    /// Spec §8 scenario 6: the broadcaster sets the counter to the
    /// number of target CPUs and each acknowledgement decrements it;
    /// the broadcaster observes zero once all three have responded.
    #[test]
    fn acknowledgement_counter_reaches_zero_after_three_acks() {
        TLBSHOOT_WAIT.store(3, Ordering::Relaxed);
        for _ in 0..3 {
            TLBSHOOT_WAIT.fetch_sub(1, Ordering::AcqRel);
        }
        assert_eq!(TLBSHOOT_WAIT.load(Ordering::Relaxed), 0);
        TLBSHOOT_WAIT.store(0, Ordering::Relaxed);
    }
}
