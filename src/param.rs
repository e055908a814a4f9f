//! Compile-time configuration constants.
//!
//! No runtime configuration surface exists in this kernel; every knob
//! here is a `const` fixed at build time, the way the teacher repo's
//! (absent but referenced) `param` module is used for `NCPU`/`NPROC`.

/// Size of the fixed thread table. The core never grows it.
pub const NTHREAD: usize = 64;

/// Size of the per-CPU table, indexed by LAPIC id.
pub const MAXCPUS: usize = 32;

/// Timer tick rate in Hz, established by the LAPIC/PIT calibration path.
pub const HZ: u64 = 100;

/// Minimum spacing between SIGPROF deliveries to a single thread, in ns.
pub const PROF_INTERVAL_NS: u64 = 10_000_000;

/// `ETIMEDOUT`, carried for ABI compatibility with the host OS's errno
/// numbering (spec §7).
pub const ETIMEDOUT: i32 = 110;

/// Fixed, bit-exact trap numbers (spec §6).
pub const TRAP_NMI: u64 = 2;
pub const TRAP_PAGE_FAULT: u64 = 14;
pub const TRAP_TIMER: u64 = 32;
pub const TRAP_DISK: u64 = 46;
pub const TRAP_SPURIOUS: u64 = 48;
pub const TRAP_YIELD: u64 = 49;
pub const TRAP_SYSCALL: u64 = 64;
pub const TRAP_TLBSHOOT: u64 = 70;
pub const TRAP_SIGRET: u64 = 71;
pub const TRAP_PERFMASK: u64 = 72;

/// CPU-exception trap numbers fall in `[0, CPU_EXCEPTION_END)`.
pub const CPU_EXCEPTION_END: u64 = 32;

/// Maskable IRQs fall in `(IRQ_START, IRQ_END]`.
pub const IRQ_START: u64 = 32;
pub const IRQ_END: u64 = 47;

/// SIGPROF, in the host OS's signal numbering, used by `proftick`.
pub const SIGPROF: u32 = 27;
