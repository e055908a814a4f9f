//! Per-CPU descriptor table.
//!
//! Grounded on the teacher's `Cpu<'a>` (`kernel/src/proc.rs`) for the
//! field set (`noff`/`intena` interrupt-stacking, current-thread
//! pointer) and on the x86-64 reference crate's `percpu.rs` for the
//! GS-base-as-self-pointer technique spec §3/§9 calls for: each CPU's
//! `IA32_GS_BASE` MSR is loaded with the address of its own `Cpu`
//! entry, so `curcpu()` is a single indirect load through `gs:[0]`
//! rather than a lookup keyed by APIC id on every call.
//!
//! `cpu.mythread` and the thread's "currently scheduled on" relation
//! form a logical cycle (spec §9); we resolve it the way spec says to:
//! the thread never owns a `Cpu` pointer, so there's no back-pointer
//! to keep in sync.

use core::sync::atomic::{AtomicU64, Ordering};
use raw_cpuid::CpuId;
use x86_64::registers::model_specific::Msr;

use crate::param::MAXCPUS;

/// Verify the CPU features the core assumes without ever probing for
/// (FXSAVE/FXRSTOR, an onboard Local APIC) are present. An "unexpected
/// base address" or similarly absent piece of required hardware is a
/// fatal inconsistent invariant (spec §7), not something to work around.
pub fn assert_required_features() {
    let features = CpuId::new().get_feature_info().expect("CPUID leaf 1 unavailable");
    assert!(features.has_fxsave_fxstor(), "CPU lacks FXSAVE/FXRSTOR");
    assert!(features.has_sse2(), "CPU lacks SSE2");
    assert!(features.has_apic(), "CPU lacks an onboard Local APIC");
}

const IA32_GS_BASE: u32 = 0xc000_0101;

/// `curthread` sentinel meaning "no thread running on this CPU".
pub const NO_THREAD: usize = usize::MAX;

#[repr(C)]
pub struct Cpu {
    /// Must be the first field: installed as this CPU's GS base so
    /// that reading `gs:[0]` yields a pointer back to this struct.
    self_ptr: *mut Cpu,
    /// Index into the thread table of the thread currently `RUNNING`
    /// on this CPU, or `NO_THREAD` if the CPU is idle.
    cur_thread: AtomicU64,
    /// Kernel RSP saved across a switch into `Userrun`/back.
    pub kernel_rsp: AtomicU64,
    /// Logical CPU ordinal (also its LAPIC id, spec keys the per-CPU
    /// table by LAPIC id and MAXCPUS bounds that key).
    pub ordinal: usize,
    /// Physical address of the page directory currently loaded via CR3.
    pub pmap: AtomicU64,
    /// Depth of `push_cli` nesting.
    noff: core::cell::Cell<u8>,
    /// Interrupt-enable flag saved by the outermost `push_cli`.
    intena: core::cell::Cell<bool>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new(ordinal: usize) -> Self {
        Cpu {
            self_ptr: core::ptr::null_mut(),
            cur_thread: AtomicU64::new(NO_THREAD as u64),
            kernel_rsp: AtomicU64::new(0),
            ordinal,
            pmap: AtomicU64::new(0),
            noff: core::cell::Cell::new(0),
            intena: core::cell::Cell::new(false),
        }
    }

    pub fn cur_thread(&self) -> Option<usize> {
        let v = self.cur_thread.load(Ordering::Acquire);
        if v == NO_THREAD as u64 {
            None
        } else {
            Some(v as usize)
        }
    }

    pub fn set_cur_thread(&self, idx: Option<usize>) {
        let v = idx.map(|i| i as u64).unwrap_or(NO_THREAD as u64);
        self.cur_thread.store(v, Ordering::Release);
    }

    pub fn noff(&self) -> u8 {
        self.noff.get()
    }

    pub fn inc_noff(&self) {
        self.noff.set(self.noff.get() + 1);
    }

    pub fn dec_noff(&self) {
        self.noff.set(self.noff.get() - 1);
    }

    pub fn intena(&self) -> bool {
        self.intena.get()
    }

    pub fn set_intena(&self, v: bool) {
        self.intena.set(v);
    }
}

static mut CPUS: [Cpu; MAXCPUS] = {
    // Array-of-const-fn-calls has to be written out; MAXCPUS is small
    // and fixed, so an explicit repeat via a helper const is simplest.
    const C: Cpu = Cpu::new(0);
    let mut arr = [C; MAXCPUS];
    let mut i = 0;
    while i < MAXCPUS {
        arr[i] = Cpu::new(i);
        i += 1;
    }
    arr
};

/// Install this CPU's GS base to point at its `Cpu` descriptor. Must be
/// called exactly once per CPU during bootstrap, before any code reads
/// `curcpu()`/`mycpu()`.
///
/// # Safety
/// Must run with interrupts disabled and `lapic_id` must be this CPU's
/// true LAPIC id (spec keys the per-CPU table by it).
pub unsafe fn init_this_cpu(lapic_id: u32) {
    let idx = lapic_id as usize;
    assert!(idx < MAXCPUS, "LAPIC id {} exceeds MAXCPUS", idx);
    let cpu_ptr = core::ptr::addr_of_mut!(CPUS[idx]);
    (*cpu_ptr).self_ptr = cpu_ptr;
    let mut msr = Msr::new(IA32_GS_BASE);
    msr.write(cpu_ptr as u64);
}

/// The index into the per-CPU table for the CPU executing this code.
/// Interrupts must be disabled by the caller (spec: "must be called
/// with interrupts disabled to prevent a race with the CPU changing").
pub fn cpuid() -> usize {
    mycpu().ordinal
}

/// Return this CPU's descriptor via a single indirect load through the
/// GS-base self-pointer.
#[cfg(not(test))]
pub fn mycpu() -> &'static Cpu {
    let ptr: *mut Cpu;
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(nostack, preserves_flags));
        assert!(!ptr.is_null(), "curcpu: GS base not installed on this CPU");
        &*ptr
    }
}

// Reading GS base requires a real GS segment installed by `init_this_cpu`,
// which never runs under a hosted test binary; stand in with a per-thread
// fake `Cpu` so pure-logic tests elsewhere in the crate can still call
// through `mycpu()` without touching hardware.
#[cfg(test)]
std::thread_local! {
    static TEST_CPU: Cpu = Cpu::new(0);
}

#[cfg(test)]
pub fn mycpu() -> &'static Cpu {
    TEST_CPU.with(|c| unsafe { &*(c as *const Cpu) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_starts_idle() {
        let c = Cpu::new(3);
        assert_eq!(c.cur_thread(), None);
        assert_eq!(c.ordinal, 3);
    }

    #[test]
    fn noff_tracks_nesting() {
        let c = Cpu::new(0);
        assert_eq!(c.noff(), 0);
        c.inc_noff();
        c.inc_noff();
        assert_eq!(c.noff(), 2);
        c.dec_noff();
        assert_eq!(c.noff(), 1);
    }
}
