//! The trap dispatcher: single entry point for every CPU exception,
//! maskable IRQ, and software trap (`trapasm::common_trap_entry` calls
//! straight into [`trap_dispatch`]).
//!
//! Grounded on the teacher's `trap.rs` for the overall shape (one
//! function consulted by a trampoline, a lock-guarded ticks counter)
//! generalized from RISC-V's `scause`/`stval` classification to the
//! vector-number classification this core uses, per spec §4.1.

use core::sync::atomic::Ordering;
use x86_64::registers::control::Cr2;

use crate::apic;
use crate::cpu::{self, mycpu};
use crate::gdt;
use crate::param::*;
use crate::proc::{self, ThreadStatus};
use crate::signal;
use crate::spinlock::Spinlock;

pub static TICKS_LOCK: Spinlock = Spinlock::new("time");

/// Spec §4.1's classification table, factored out of [`trap_dispatch`]
/// so the mapping from trap number to handling category is checkable
/// without any hardware state (spec §8's six end-to-end scenarios each
/// name a concrete trap number and expect a specific row of this table).
#[derive(Debug, PartialEq, Eq)]
pub enum TrapKind {
    Spurious,
    Nmi,
    TlbShootdown,
    TimerOrYield,
    SigRet,
    PerfMask,
    /// Also covers `TRAP_SYSCALL`: spec §4.1's table has no dedicated
    /// syscall row, and the syscall surface proper is out of scope, so
    /// it's handled identically to any other user-mode CPU exception.
    Exception,
    OtherIrq,
}

pub fn classify(trapno: u64) -> TrapKind {
    match trapno {
        TRAP_SPURIOUS => TrapKind::Spurious,
        TRAP_NMI => TrapKind::Nmi,
        TRAP_TLBSHOOT => TrapKind::TlbShootdown,
        TRAP_TIMER | TRAP_YIELD => TrapKind::TimerOrYield,
        TRAP_SIGRET => TrapKind::SigRet,
        TRAP_PERFMASK => TrapKind::PerfMask,
        TRAP_SYSCALL => TrapKind::Exception,
        trapno if trapno < CPU_EXCEPTION_END => TrapKind::Exception,
        trapno if trapno > IRQ_START && trapno <= IRQ_END => TrapKind::OtherIrq,
        other => panic!("classify: unexpected trap number {}", other),
    }
}

/// 512-byte FXSAVE/FXRSTOR image. Hard invariant: 16-byte aligned,
/// verified at bootstrap (spec §3).
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FxArea(pub [u8; 512]);

impl FxArea {
    pub const fn zeroed() -> Self {
        FxArea([0; 512])
    }
}

/// Fixed 24-slot register frame the trap trampoline builds on the
/// kernel stack: 15 GPRs, trap number, hardware error code, then the
/// 7 hardware/iretq-managed slots (spec §3).
///
/// Field order mirrors `trapasm.rs`'s push/pop sequence exactly — this
/// is laid directly over the live stack slot the trampoline is about
/// to `iretq` from, so reordering fields here without reordering the
/// assembly silently corrupts every trap return.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub reserved0: u64,
    pub reserved1: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            trapno: 0, err: 0, rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0,
            reserved0: 0, reserved1: 0,
        }
    }

    /// CS's RPL bits; 0 means the trap came from kernel mode.
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0b11 != 0
    }
}

pub unsafe fn fxsave(area: *mut FxArea) {
    core::arch::asm!("fxsave64 [{0}]", in(reg) area, options(nostack));
}

pub unsafe fn fxrstor(area: *const FxArea) {
    core::arch::asm!("fxrstor64 [{0}]", in(reg) area, options(nostack));
}

/// Called by every trap vector's trampoline stub with `frame` pointing
/// at the on-stack `TrapFrame` it just built. Never returns through
/// the ordinary call mechanism (spec §4.1 contract (a)) except on the
/// NMI and `TRAP_PERFMASK` fast paths, which fall back into
/// `trapasm::common_trap_return` directly.
///
/// # Safety
/// Interrupts must be disabled on entry (enforced by hardware for
/// every vector that reaches this function) and this invariant must
/// hold until a resume primitive transfers control away.
#[no_mangle]
pub unsafe extern "C" fn trap_dispatch(frame: *mut TrapFrame) -> ! {
    assert!(
        !x86_64::instructions::interrupts::are_enabled(),
        "trap entered with interrupts enabled"
    );

    let f = &mut *frame;

    match classify(f.trapno) {
        TrapKind::Spurious => {
            // Architectural: the Local APIC raises this vector when it
            // can't resolve a real interrupt source. No EOI is sent
            // for it and scheduler state is untouched.
            crate::trapasm::common_trap_return();
        }

        TrapKind::Nmi => {
            // Perf-counter overflow NMI: gather the sample the PMI
            // latched, re-mask, and return to the exact interrupted
            // context without touching scheduler state at all.
            apic::gather_pmi_sample();
            apic::mask_pmi();
            crate::trapasm::common_trap_return();
        }

        TrapKind::TlbShootdown => {
            crate::tlb::tlb_shootdown(frame);
        }

        TrapKind::TimerOrYield => {
            handle_timer_or_yield(f);
        }

        TrapKind::SigRet => {
            signal::sigret(frame);
        }

        TrapKind::PerfMask => {
            apic::eoi();
            apic::mask_pmi();
            crate::trapasm::common_trap_return();
        }

        TrapKind::Exception => {
            handle_exception(f);
        }

        TrapKind::OtherIrq => {
            handle_other_irq(frame);
        }
    }
}

unsafe fn handle_exception(f: &mut TrapFrame) -> ! {
    if !f.from_user_mode() {
        kernel_fault(f);
    }

    let cur = mycpu().cur_thread().expect("user-mode exception with no current thread");
    let t = proc::thread(cur);
    let cr2 = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);

    save_context_for_userint(t, f, f.trapno, cr2);
    proc::sched_run(cur, f as *mut TrapFrame);
}

unsafe fn kernel_fault(f: &TrapFrame) -> ! {
    log::error!(
        "kernel fault: trapno={} err={:#x} rip={:#x} cs={:#x} rflags={:#x} rsp={:#x} cr2={:#x}",
        f.trapno,
        f.err,
        f.rip,
        f.cs,
        f.rflags,
        f.rsp,
        Cr2::read().map(|a| a.as_u64()).unwrap_or(0),
    );
    crate::panic_halt::stack_dump(f.rbp, f.rip);
    crate::panic_halt::halt_all_cpus();
}

unsafe fn handle_timer_or_yield(f: &mut TrapFrame) -> ! {
    let skip_eoi = f.trapno == TRAP_YIELD;
    f.trapno = TRAP_TIMER;

    let now = crate::time::now_ns();
    let cur = mycpu().cur_thread();

    if let Some(idx) = cur {
        let t = proc::thread(idx);
        let stampstart = t.prof.stampstart.load(Ordering::Relaxed);
        let _ = t.prof.totaltime.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
            Some(proc::accumulate_totaltime(total, stampstart, now))
        });
        t.prof.stampstart.store(0, Ordering::Relaxed);
    }

    proc::THREAD_LOCK.acquire();
    if let Some(idx) = cur {
        let t = proc::thread(idx);
        if t.status.load() == ThreadStatus::WillSleep {
            t.status.store(ThreadStatus::Sleeping);
            proc::FUTEX_LOCK.release();
        } else if t.status.load() == ThreadStatus::Running {
            t.status.store(ThreadStatus::Runnable);
        }
        core::ptr::write(t.tf.get(), *f);
        fxsave(t.fx.get());
    }
    proc::THREAD_LOCK.release();

    if !skip_eoi {
        apic::eoi();
    }

    if cpu::cpuid() == 0 {
        proc::wakeup(now);
        proc::proftick(now);
    }

    proc::yieldy(f as *mut TrapFrame);
}

unsafe fn handle_other_irq(frame: *mut TrapFrame) -> ! {
    crate::hooks::newtrap(frame);
    match mycpu().cur_thread() {
        Some(idx) => proc::sched_run(idx, frame),
        None => proc::sched_halt(),
    }
}

/// Implements spec §4.1's FPU-save policy: save into the caller's
/// user-visible buffers if this thread is mid-`userrun`, otherwise
/// into the descriptor's own buffers, then fabricate the synthetic
/// `_userint` return.
unsafe fn save_context_for_userint(t: &proc::Thread, f: &mut TrapFrame, trapno: u64, cr2: u64) {
    let user_tf = t.user_tf.load(Ordering::Acquire) as *mut TrapFrame;
    let user_fx = t.user_fx.load(Ordering::Acquire) as *mut FxArea;

    if !user_tf.is_null() {
        core::ptr::write(user_tf, *f);
        fxsave(user_fx);
        t.user_tf.store(0, Ordering::Release);
        t.user_fx.store(0, Ordering::Release);
    } else {
        core::ptr::write(t.tf.get(), *f);
        fxsave(t.fx.get());
    }

    let sys_rsp = t.saved_krsp.load(Ordering::Relaxed);
    // Overwrite the frame in place: this is the same memory
    // `sched_run` will later hand to `common_trap_return`.
    f.rax = trapno;
    f.rbx = cr2;
    f.rip = crate::trapasm::userint as usize as u64;
    f.rsp = sys_rsp;
    f.cs = gdt::kernel_code_selector().0 as u64;
    f.ss = gdt::kernel_data_selector().0 as u64;
    f.rflags |= 0x200; // IF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_rpl_detected() {
        let mut f = TrapFrame::zeroed();
        f.cs = 0x1b; // user code selector, RPL 3
        assert!(f.from_user_mode());
        f.cs = 0x08; // kernel code selector, RPL 0
        assert!(!f.from_user_mode());
    }

    /// Spec §4.1's classification table, one case per row.
    #[test]
    fn classification_table_matches_spec() {
        assert_eq!(classify(TRAP_NMI), TrapKind::Nmi);
        assert_eq!(classify(TRAP_TLBSHOOT), TrapKind::TlbShootdown);
        assert_eq!(classify(TRAP_TIMER), TrapKind::TimerOrYield);
        assert_eq!(classify(TRAP_YIELD), TrapKind::TimerOrYield);
        assert_eq!(classify(TRAP_SIGRET), TrapKind::SigRet);
        assert_eq!(classify(TRAP_PERFMASK), TrapKind::PerfMask);
        assert_eq!(classify(TRAP_SYSCALL), TrapKind::Exception);
        assert_eq!(classify(TRAP_SPURIOUS), TrapKind::Spurious);
        assert_eq!(classify(TRAP_DISK), TrapKind::OtherIrq);
    }

    #[test]
    #[should_panic(expected = "unexpected trap number")]
    fn classify_panics_on_unassigned_vector() {
        classify(49_152);
    }

    /// Spec §8 scenario 2: a user-mode page fault classifies as an
    /// exception and is recognized as having come from user mode.
    #[test]
    fn user_page_fault_scenario() {
        assert_eq!(classify(TRAP_PAGE_FAULT), TrapKind::Exception);
        let mut f = TrapFrame::zeroed();
        f.cs = 0x1b;
        assert!(f.from_user_mode());
    }

    /// Spec §8 scenario 4: a kernel-mode page fault (NULL deref)
    /// classifies the same way, but is recognized as kernel-mode so it
    /// takes the fatal path instead of the synthetic `_userint` return.
    #[test]
    fn kernel_null_deref_scenario() {
        assert_eq!(classify(TRAP_PAGE_FAULT), TrapKind::Exception);
        let mut f = TrapFrame::zeroed();
        f.cs = 0x08;
        assert!(!f.from_user_mode());
    }
}
