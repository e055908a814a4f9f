//! Global Descriptor Table.
//!
//! Grounded on the x86-64 reference crate's `gdt.rs`: kernel code/data,
//! user data/code (in that order, which SYSRET requires), and a TSS
//! descriptor. Segmentation is otherwise flat in long mode; this
//! exists purely so privilege transitions and `SYSENTER`/`SYSRET` have
//! valid selectors to load (spec §9, "Bootstrap glue").

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

use crate::tss::TSS;

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        // User data must precede user code for SYSRET's selector math.
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors { kernel_code, kernel_data, user_data, user_code, tss },
        )
    };
}

/// Load the GDT and set every segment register. Must be called once
/// per CPU during bootstrap, with interrupts disabled.
///
/// # Safety
/// Must run before any user-mode transition and before the TSS is
/// used for an interrupt stack switch.
pub unsafe fn init() {
    GDT.0.load();
    CS::set_reg(GDT.1.kernel_code);
    DS::set_reg(GDT.1.kernel_data);
    ES::set_reg(GDT.1.kernel_data);
    SS::set_reg(GDT.1.kernel_data);
    load_tss(GDT.1.tss);
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_segments_ordered_for_sysret() {
        // SYSRET computes CS from SS + 16; user_data must sit directly
        // below user_code in the table for that math to land on a
        // valid, matching pair of descriptors.
        assert_eq!(user_code_selector().index(), user_data_selector().index() + 1);
    }

    #[test]
    fn kernel_segments_are_ring0() {
        assert_eq!(kernel_code_selector().rpl(), 0);
    }
}
