//! The per-CPU thread table and cooperative scheduler core: a fixed
//! array of thread descriptors, the `RUNNABLE`/`RUNNING`/`WAITING`/
//! `SLEEPING`/`WILLSLEEP` state machine, and the scheduling primitives
//! (`yieldy`, `sched_run`, `sched_halt`, `wakeup`) that move threads
//! between states (spec §3, §4.2).
//!
//! Grounded on the teacher's `proc.rs` for the overall table/lock
//! shape (a fixed `PROCS`/`THREADS` array, a dedicated lock protecting
//! it, `allocproc`-style slot scanning) generalized from xv6's
//! preemptive multi-state process model to this core's simpler
//! cooperative one: there is no fork/exit inside the core, only the
//! six states spec §4.2 names.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};

use crate::cpu::mycpu;
use crate::param::{ETIMEDOUT, NTHREAD, PROF_INTERVAL_NS, SIGPROF};
use crate::spinlock::Spinlock;
use crate::trap::{FxArea, TrapFrame};

/// Protects the thread table and every `status` transition (spec §5).
pub static THREAD_LOCK: Spinlock = Spinlock::new("thread");

/// Acquired by the (out-of-core) futex layer before it commits a
/// thread to `WILLSLEEP`; released by the scheduler at the
/// `WILLSLEEP -> SLEEPING` commit point (spec §4.2, §9).
pub static FUTEX_LOCK: Spinlock = Spinlock::new("futex");

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadStatus {
    Invalid = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Sleeping = 4,
    WillSleep = 5,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadStatus::Invalid,
            1 => ThreadStatus::Runnable,
            2 => ThreadStatus::Running,
            3 => ThreadStatus::Waiting,
            4 => ThreadStatus::Sleeping,
            5 => ThreadStatus::WillSleep,
            _ => unreachable!("corrupt thread status byte {}", v),
        }
    }
}

pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    const fn new(s: ThreadStatus) -> Self {
        AtomicStatus(AtomicU8::new(s as u8))
    }

    pub fn load(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, s: ThreadStatus) {
        self.0.store(s as u8, Ordering::Release)
    }
}

pub struct Prof {
    pub enabled: AtomicBool,
    pub totaltime: AtomicU64,
    pub stampstart: AtomicU64,
}

/// One slot in the fixed thread table (spec §3).
pub struct Thread {
    pub status: AtomicStatus,

    /// The thread's saved register frame when it isn't mid-`userrun`.
    pub tf: UnsafeCell<TrapFrame>,
    pub fx: UnsafeCell<FxArea>,

    /// Non-null (as a raw address) iff this thread is currently
    /// executing in user mode via `userrun`; the trap dispatcher then
    /// saves into these caller-owned buffers instead of `tf`/`fx`.
    pub user_tf: AtomicU64,
    pub user_fx: AtomicU64,
    /// Kernel RSP captured by `userrun` at the moment it entered user
    /// mode, consumed by the synthetic `_userint` return.
    pub saved_krsp: AtomicU64,

    pub sigtf: UnsafeCell<TrapFrame>,
    pub sigfx: UnsafeCell<FxArea>,
    pub sigstatus: AtomicStatus,
    pub sigsleepfor: AtomicU64,
    pub doingsig: AtomicBool,
    /// Top-of-stack address for synthetic signal frames; zero means
    /// "no signal stack configured for this thread yet" (spec §4.3).
    pub sigstack: AtomicU64,

    pub prof: Prof,

    pub sleepfor: AtomicU64,
    pub sleepret: AtomicI32,
    pub futaddr: AtomicU64,

    pub p_pmap: AtomicU64,

    /// Last CPU ordinal this thread ran on. Cosmetic debug-logging aid
    /// only (grounded on the Go-runtime ancestor's `g->m` pointer,
    /// `original_source/src/runtime/os_linux.c`) — never read by
    /// scheduling logic, so it carries no invariant of its own.
    pub cpu_hint: AtomicU64,
}

unsafe impl Sync for Thread {}

impl Thread {
    const fn new() -> Self {
        Thread {
            status: AtomicStatus::new(ThreadStatus::Invalid),
            tf: UnsafeCell::new(TrapFrame::zeroed()),
            fx: UnsafeCell::new(FxArea::zeroed()),
            user_tf: AtomicU64::new(0),
            user_fx: AtomicU64::new(0),
            saved_krsp: AtomicU64::new(0),
            sigtf: UnsafeCell::new(TrapFrame::zeroed()),
            sigfx: UnsafeCell::new(FxArea::zeroed()),
            sigstatus: AtomicStatus::new(ThreadStatus::Invalid),
            sigsleepfor: AtomicU64::new(0),
            doingsig: AtomicBool::new(false),
            sigstack: AtomicU64::new(0),
            prof: Prof {
                enabled: AtomicBool::new(false),
                totaltime: AtomicU64::new(0),
                stampstart: AtomicU64::new(0),
            },
            sleepfor: AtomicU64::new(0),
            sleepret: AtomicI32::new(0),
            futaddr: AtomicU64::new(0),
            p_pmap: AtomicU64::new(0),
            cpu_hint: AtomicU64::new(0),
        }
    }
}

static THREADS: [Thread; NTHREAD] = {
    const T: Thread = Thread::new();
    [T; NTHREAD]
};

/// Borrow a thread table slot by index.
pub fn thread(idx: usize) -> &'static Thread {
    &THREADS[idx]
}

/// Initialize the thread table: verify the FPU-save-area alignment
/// invariant (spec §3's hard, bootstrap-panic invariant) and seed slot
/// 0 as the running bootstrap thread under the kernel page-map.
///
/// # Safety
/// Must run exactly once, on the bootstrap CPU, before any other CPU
/// reads the thread table.
pub unsafe fn init(kernel_pmap: u64) {
    for t in THREADS.iter() {
        let addr = t.fx.get() as usize;
        assert!(addr % 16 == 0, "FPU save area not 16-byte aligned");
    }

    THREADS[0].status.store(ThreadStatus::Running);
    THREADS[0].p_pmap.store(kernel_pmap, Ordering::Relaxed);
    mycpu().set_cur_thread(Some(0));
    mycpu().pmap.store(kernel_pmap, Ordering::Relaxed);
}

/// Pure half of `yieldy`'s selection policy (spec §4.2): scan starting
/// at `start`, wrapping once around the table, for the first
/// `RUNNABLE` slot. Factored out so the search order is checkable
/// without the thread lock or a real table (spec §8 scenario 3).
fn pick_runnable(statuses: &[ThreadStatus; NTHREAD], start: usize) -> Option<usize> {
    for i in 0..NTHREAD {
        let idx = (start + i) % NTHREAD;
        if statuses[idx] == ThreadStatus::Runnable {
            return Some(idx);
        }
    }
    None
}

/// Pure half of `wakeup`'s per-thread decision (spec §4.2, §8 scenario
/// 1): a `SLEEPING` thread whose deadline has passed wakes up.
fn sleep_has_expired(status: ThreadStatus, sleepfor: u64, now_ns: u64) -> bool {
    status == ThreadStatus::Sleeping && sleepfor <= now_ns
}

/// Pure half of `proftick`'s per-thread decision (spec §4.2, §8
/// scenario 5): only a `RUNNABLE` thread with profiling enabled and no
/// signal already in flight gets a synthetic SIGPROF.
fn wants_sigprof(status: ThreadStatus, prof_enabled: bool, doingsig: bool) -> bool {
    status == ThreadStatus::Runnable && prof_enabled && !doingsig
}

/// Pure half of the per-trap CPU-time accounting `trap::
/// handle_timer_or_yield` performs (spec §4.2 "Timekeeping accounting",
/// §8's `prof.totaltime` monotonicity law): elapsed time since
/// `stampstart` is always added, never subtracted.
pub fn accumulate_totaltime(total: u64, stampstart: u64, now_ns: u64) -> u64 {
    total.saturating_add(now_ns.saturating_sub(stampstart))
}

/// Pick any `RUNNABLE` thread, install it as `curthread`, and resume it
/// via [`sched_run`]; if none is runnable, fall into [`sched_halt`]
/// (spec §4.2). Runs under `THREAD_LOCK` with interrupts disabled;
/// never returns.
///
/// # Safety
/// `frame` must point at the current CPU's trap-entry staging slot —
/// the same memory `trapasm::common_trap_return` is about to pop from.
pub unsafe fn yieldy(frame: *mut TrapFrame) -> ! {
    if crate::panic_halt::halted() {
        crate::panic_halt::halt_all_cpus();
    }

    THREAD_LOCK.acquire();

    let statuses: [ThreadStatus; NTHREAD] = core::array::from_fn(|i| THREADS[i].status.load());
    let start = crate::cpu::cpuid() % NTHREAD;
    let chosen = pick_runnable(&statuses, start);

    match chosen {
        Some(idx) => {
            THREADS[idx].status.store(ThreadStatus::Running);
            mycpu().set_cur_thread(Some(idx));
            mycpu().pmap.store(THREADS[idx].p_pmap.load(Ordering::Relaxed), Ordering::Relaxed);
            THREAD_LOCK.release();
            sched_run(idx, frame);
        }
        None => {
            THREAD_LOCK.release();
            sched_halt();
        }
    }
}

/// Restore thread `idx`'s saved FPU and register state onto the
/// current CPU's trap-entry staging slot and fall into
/// `trapasm::common_trap_return`'s pop/`iretq` sequence. Never returns.
///
/// # Safety
/// `frame` must alias the CPU's trap-entry staging slot, exactly as in
/// [`yieldy`]. The caller must already have installed `idx` as
/// `curthread` if it wants `curcpu()` to agree with what's resuming.
pub unsafe fn sched_run(idx: usize, frame: *mut TrapFrame) -> ! {
    let t = &THREADS[idx];
    t.prof.stampstart.store(crate::time::now_ns(), Ordering::Relaxed);
    t.cpu_hint.store(crate::cpu::cpuid() as u64, Ordering::Relaxed);
    core::ptr::write(frame, *t.tf.get());
    crate::trap::fxrstor(t.fx.get());
    crate::trapasm::common_trap_return();
}

/// Drop the thread lock and halt with interrupts enabled until the
/// next interrupt wakes this CPU to try scheduling again.
///
/// # Safety
/// Must be called with `THREAD_LOCK` already released and no thread
/// installed as `curthread` on this CPU.
pub unsafe fn sched_halt() -> ! {
    mycpu().set_cur_thread(None);
    loop {
        if crate::panic_halt::halted() {
            crate::panic_halt::halt_all_cpus();
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// CPU-0-only, once per timer tick: move every `SLEEPING` thread whose
/// deadline has passed to `RUNNABLE` with `sleepret = ETIMEDOUT`
/// (spec §4.2).
pub fn wakeup(now_ns: u64) {
    THREAD_LOCK.acquire();
    for t in THREADS.iter() {
        if sleep_has_expired(t.status.load(), t.sleepfor.load(Ordering::Relaxed), now_ns) {
            t.sleepret.store(ETIMEDOUT, Ordering::Relaxed);
            t.status.store(ThreadStatus::Runnable);
        }
    }
    THREAD_LOCK.release();
}

/// No more often than every [`PROF_INTERVAL_NS`]: inject a synthetic
/// `SIGPROF` into every `RUNNABLE` thread with profiling enabled and no
/// signal already in flight (spec §4.2).
pub fn proftick(now_ns: u64) {
    static LAST_TICK: AtomicU64 = AtomicU64::new(0);
    let last = LAST_TICK.load(Ordering::Relaxed);
    if now_ns.saturating_sub(last) < PROF_INTERVAL_NS {
        return;
    }
    LAST_TICK.store(now_ns, Ordering::Relaxed);

    THREAD_LOCK.acquire();
    for (idx, t) in THREADS.iter().enumerate() {
        if wants_sigprof(t.status.load(), t.prof.enabled.load(Ordering::Relaxed), t.doingsig.load(Ordering::Relaxed)) {
            unsafe { crate::signal::mksig(idx, SIGPROF) };
        }
    }
    THREAD_LOCK.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_atomic() {
        let s = AtomicStatus::new(ThreadStatus::Invalid);
        s.store(ThreadStatus::Sleeping);
        assert_eq!(s.load(), ThreadStatus::Sleeping);
    }

    #[test]
    fn every_slot_is_16_byte_aligned() {
        for t in THREADS.iter() {
            assert_eq!(t.fx.get() as usize % 16, 0);
        }
    }

    /// Spec §8 scenario 1, concrete values: sleeping past 5ms wakes at
    /// 6ms but not at 1ms.
    #[test]
    fn sleep_expiry_scenario() {
        assert!(!sleep_has_expired(ThreadStatus::Sleeping, 5_000_000, 1_000_000));
        assert!(sleep_has_expired(ThreadStatus::Sleeping, 5_000_000, 6_000_000));
        assert!(!sleep_has_expired(ThreadStatus::Runnable, 0, 6_000_000));
    }

    /// Spec §8 scenario 5's precondition for injecting SIGPROF.
    #[test]
    fn proftick_precondition_scenario() {
        assert!(wants_sigprof(ThreadStatus::Runnable, true, false));
        assert!(!wants_sigprof(ThreadStatus::Runnable, false, false));
        assert!(!wants_sigprof(ThreadStatus::Runnable, true, true));
        assert!(!wants_sigprof(ThreadStatus::Sleeping, true, false));
    }

    /// Spec §8 scenario 3: thread 3 yields back to RUNNABLE; scanning
    /// from just past its slot finds thread 5.
    #[test]
    fn voluntary_yield_selects_another_runnable_thread() {
        let mut statuses = [ThreadStatus::Invalid; NTHREAD];
        statuses[3] = ThreadStatus::Runnable;
        statuses[5] = ThreadStatus::Runnable;
        assert_eq!(pick_runnable(&statuses, 4), Some(5));
    }

    #[test]
    fn pick_runnable_wraps_and_returns_none_when_idle() {
        let statuses = [ThreadStatus::Waiting; NTHREAD];
        assert_eq!(pick_runnable(&statuses, 10), None);
    }

    /// Spec §8's `prof.totaltime` monotonicity law.
    #[test]
    fn totaltime_accumulation_is_monotonic() {
        let mut total = 0u64;
        for (stampstart, now) in [(0, 1_000), (1_000, 2_500), (2_500, 2_500), (2_500, 9_000)] {
            let next = accumulate_totaltime(total, stampstart, now);
            assert!(next >= total);
            total = next;
        }
        assert_eq!(total, 9_000);
    }
}
