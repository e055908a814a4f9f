//! In-kernel signal simulation: hijack a thread's register state,
//! synthesize a user-visible `ucontext_t` frame on its signal stack,
//! and redirect it into a handler; later restore through a dedicated
//! software trap (spec §4.3).
//!
//! Grounded on `original_source/src/runtime/os_linux.c`'s
//! `sigtramp`/`sigaltstack` lineage for the general shape of "deliver
//! a signal by rewriting a goroutine's saved context and pointing it
//! at a trampoline on its own signal stack" — this core reimplements
//! that idea entirely in terms of the thread table instead of a `g`
//! struct, since fork/exit and the user-visible handler dispatch table
//! live in the (out-of-scope) syscall surface.

use core::mem::size_of;
use core::sync::atomic::Ordering;

use crate::cpu::mycpu;
use crate::proc::{self, ThreadStatus};
use crate::trap::TrapFrame;

const REG_RSP: usize = 15;
const REG_RIP: usize = 16;

/// Laid out bit-identically to the host ABI's `ucontext_t` for
/// x86-64 Linux (spec §9): only `gregs[REG_RIP]`/`gregs[REG_RSP]` are
/// meaningfully populated, everything else is zeroed. A profiler
/// reading this structure at the well-known offsets must see the same
/// layout it would on the host OS.
#[repr(C)]
struct UContext {
    uc_flags: u64,
    uc_link: u64,
    uc_stack_sp: u64,
    uc_stack_flags: i32,
    _pad0: i32,
    uc_stack_size: u64,
    gregs: [u64; 23],
    fpregs: u64,
    reserved1: [u64; 8],
    uc_sigmask: [u64; 16],
}

core::arch::global_asm!(
    r#"
.global sigsim
sigsim:
    add rsp, 8
    pop rdi
    pop rsi
    pop rdx
    int $71
    ud2
"#
);

extern "C" {
    /// Trampoline address installed as a thread's RIP by `mksig`. Pops
    /// the synthetic 3-argument call frame into the SysV argument
    /// registers and issues `TRAP_SIGRET`. Dispatching to the
    /// thread's actual registered handler is the (out-of-scope)
    /// syscall surface's job; this core only has to guarantee the
    /// round trip back through `sigret`.
    fn sigsim();
}

/// Inject `signo` into thread `idx`. Must be called with `THREAD_LOCK`
/// held (spec §4.3's precondition).
///
/// # Safety
/// `idx` must name a thread not already mid-signal (`doingsig`), with
/// a configured `sigstack`.
pub unsafe fn mksig(idx: usize, signo: u32) {
    let t = proc::thread(idx);

    let stack_top = t.sigstack.load(Ordering::Relaxed);
    assert!(stack_top != 0, "mksig: thread {} has no signal stack", idx);

    if t.status.load() == ThreadStatus::WillSleep {
        (*t.tf.get()).rflags |= 0x200; // force IF on for the post-handler resume
    }

    *t.sigtf.get() = *t.tf.get();
    *t.sigfx.get() = *t.fx.get();
    t.sigsleepfor.store(t.sleepfor.load(Ordering::Relaxed), Ordering::Relaxed);
    t.sigstatus.store(t.status.load());

    t.status.store(ThreadStatus::Runnable);
    t.doingsig.store(true, Ordering::Relaxed);

    let ctx_addr = (stack_top - size_of::<UContext>() as u64) & !0xf;
    let ctx_ptr = ctx_addr as *mut UContext;
    core::ptr::write_bytes(ctx_ptr as *mut u8, 0, size_of::<UContext>());
    (*ctx_ptr).gregs[REG_RSP] = (*t.tf.get()).rsp;
    (*ctx_ptr).gregs[REG_RIP] = (*t.tf.get()).rip;

    // Call frame, low to high address: [sentinel=0][signo][nil
    // siginfo][&ucontext], with the ucontext immediately above it.
    let frame_base = ctx_addr - 32;
    let words = frame_base as *mut u64;
    core::ptr::write(words, 0);
    core::ptr::write(words.add(1), signo as u64);
    core::ptr::write(words.add(2), 0);
    core::ptr::write(words.add(3), ctx_addr);

    let tf = &mut *t.tf.get();
    tf.rsp = frame_base;
    tf.rip = sigsim as usize as u64;
}

/// Non-diverging half of `sigret`: copy the pre-signal register/FPU
/// state back, clear `doingsig`, and return the shadow status the
/// thread had when the signal was injected, without taking
/// `THREAD_LOCK` or handing control to the scheduler. Split out so this
/// part — the actual injection/restore round trip spec §4.3 describes —
/// is callable from a hosted test, which cannot take a CLI-disabling
/// lock or resume a trap frame.
///
/// # Safety
/// Caller must hold `THREAD_LOCK` (or, in a test, nothing else be
/// concurrently touching thread `idx`) and `idx` must name a thread
/// that is mid-signal (`doingsig`).
pub unsafe fn restore_from_shadow(idx: usize) -> ThreadStatus {
    let t = proc::thread(idx);
    assert!(t.doingsig.load(Ordering::Relaxed), "restore_from_shadow: thread was not doing a signal");

    *t.tf.get() = *t.sigtf.get();
    *t.fx.get() = *t.sigfx.get();

    let shadow = t.sigstatus.load();
    assert!(
        shadow == ThreadStatus::Runnable || shadow == ThreadStatus::Sleeping,
        "restore_from_shadow: shadow status {:?} outside {{RUNNABLE, SLEEPING}}",
        shadow
    );
    t.doingsig.store(false, Ordering::Relaxed);
    shadow
}

/// Handle `TRAP_SIGRET`: restore the pre-signal register/FPU state and
/// resume the thread (spec §4.3). Never returns.
///
/// # Safety
/// Must be called from `trap_dispatch` for a thread that is
/// `RUNNING` and mid-signal.
pub unsafe fn sigret(frame: *mut TrapFrame) -> ! {
    let idx = mycpu().cur_thread().expect("TRAP_SIGRET with no current thread");
    let t = proc::thread(idx);
    assert!(t.status.load() == ThreadStatus::Running, "sigret: thread not RUNNING");

    proc::THREAD_LOCK.acquire();
    let shadow = restore_from_shadow(idx);

    if shadow == ThreadStatus::Waiting {
        // Unreachable given the assertion in restore_from_shadow; the
        // source this core models branches on it anyway (spec §9 open
        // question).
        t.sleepfor.store(t.sigsleepfor.load(Ordering::Relaxed), Ordering::Relaxed);
        t.status.store(ThreadStatus::Runnable);
        proc::THREAD_LOCK.release();
        proc::yieldy(frame);
    } else {
        t.status.store(ThreadStatus::Running);
        proc::THREAD_LOCK.release();
        proc::sched_run(idx, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::NTHREAD;

    #[test]
    fn ucontext_rip_rsp_offsets_are_stable() {
        let base = core::mem::size_of::<u64>() * 2 + 8 + 4 + 4 + 8;
        assert_eq!(base, 32);
        assert_eq!(REG_RSP, 15);
        assert_eq!(REG_RIP, 16);
    }

    /// `mksig` never touches `mycpu()`/`THREAD_LOCK`, so this runs as a
    /// real (non-helper-extracted) hosted call: inject a signal into a
    /// fabricated thread with a heap-backed signal stack, then restore
    /// through `restore_from_shadow` and check the round trip lands back
    /// on the pre-signal register state and shadow status. Uses the last
    /// thread-table slot so it can't collide with slot 0 (bootstrap) or
    /// with other tests touching low indices.
    #[test]
    fn signal_injection_and_restore_round_trip() {
        let idx = NTHREAD - 1;
        let t = proc::thread(idx);

        let stack = std::boxed::Box::new([0u8; 4096]);
        let stack_top = stack.as_ptr() as u64 + 4096;
        // Leaked deliberately: mksig writes through this pointer for the
        // life of the test and the allocation doesn't need to outlive it.
        std::mem::forget(stack);

        let orig_rip = 0x1000_dead_beefu64;
        let orig_rsp = stack_top - 512;
        unsafe {
            (*t.tf.get()).rip = orig_rip;
            (*t.tf.get()).rsp = orig_rsp;
        }
        t.sigstack.store(stack_top, Ordering::Relaxed);
        t.status.store(ThreadStatus::Runnable);
        t.doingsig.store(false, Ordering::Relaxed);

        unsafe { mksig(idx, 27) };

        assert!(t.doingsig.load(Ordering::Relaxed));
        assert_eq!(t.status.load(), ThreadStatus::Runnable);
        assert_eq!(t.sigstatus.load(), ThreadStatus::Runnable);
        unsafe {
            assert_eq!((*t.tf.get()).rip, sigsim as usize as u64);
            assert_ne!((*t.tf.get()).rsp, orig_rsp);
        }

        let shadow = unsafe { restore_from_shadow(idx) };

        assert_eq!(shadow, ThreadStatus::Runnable);
        assert!(!t.doingsig.load(Ordering::Relaxed));
        unsafe {
            assert_eq!((*t.tf.get()).rip, orig_rip);
            assert_eq!((*t.tf.get()).rsp, orig_rsp);
        }
    }
}
