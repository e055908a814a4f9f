//! Task State Segment.
//!
//! Grounded on the x86-64 reference crate's `tss.rs`: dedicated IST
//! stacks for double-fault and NMI so those handlers can always run
//! even if the interrupted thread's kernel stack is corrupt, plus
//! `RSP0` for privilege-level transitions.

use lazy_static::lazy_static;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

const IST_STACK_SIZE: usize = 16 * 1024;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;

#[repr(align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);
static mut NMI_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);

lazy_static! {
    // TODO: one TSS per CPU once sched_run starts juggling real
    // per-thread kernel stacks across more than one core; today RSP0
    // is updated in place by whichever CPU calls sched_run, which is
    // correct only because CPUs don't context-switch concurrently
    // while holding threadlock.
    pub static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = unsafe {
            let start = VirtAddr::from_ptr(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
            start + IST_STACK_SIZE as u64
        };
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] = unsafe {
            let start = VirtAddr::from_ptr(core::ptr::addr_of!(NMI_STACK));
            start + IST_STACK_SIZE as u64
        };
        tss
    };
}

/// Force TSS initialization; call once during bootstrap after the GDT
/// is loaded.
pub fn init() {
    let _ = &*TSS;
}
