//! Interrupt Descriptor Table.
//!
//! Grounded on the x86-64 reference crate's `idt.rs` for the general
//! shape (one `lazy_static` table, installed once per CPU) but every
//! vector's handler address is set to the matching entry in
//! `trapasm::VEC_STUB_TABLE` instead of a typed `extern "x86-interrupt"`
//! function — see `trapasm.rs` for why.

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

use crate::trapasm::VEC_STUB_TABLE;
use crate::tss::{DOUBLE_FAULT_IST_INDEX, NMI_IST_INDEX};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        for vector in 0u16..256 {
            let addr = VirtAddr::new(unsafe { VEC_STUB_TABLE[vector as usize] });
            unsafe {
                let entry = idt_entry_mut(&mut idt, vector);
                entry.set_handler_addr(addr);
                if vector as u64 == 8 {
                    // Double fault always runs on its own stack so a
                    // corrupted kernel stack can't turn it into a
                    // triple fault.
                    entry.set_stack_index(DOUBLE_FAULT_IST_INDEX);
                } else if vector as u64 == 2 {
                    // NMI can land while the kernel stack is in an
                    // arbitrary state (mid push_cli, mid trap entry);
                    // give it a dedicated stack too.
                    entry.set_stack_index(NMI_IST_INDEX);
                }
            }
        }
        idt
    };
}

/// `InterruptDescriptorTable` indexes its named exception slots and
/// its `interrupts` array through different accessors in the `x86_64`
/// crate; this unifies them since every slot here gets the same
/// raw-address treatment regardless of which table it lives in.
unsafe fn idt_entry_mut(
    idt: &mut InterruptDescriptorTable,
    vector: u16,
) -> &mut x86_64::structures::idt::Entry<extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame)> {
    core::mem::transmute(&mut idt[vector])
}

/// Load the IDT on the calling CPU. Must run once per CPU during
/// bootstrap, after the GDT/TSS are loaded (so the double-fault IST
/// index is valid).
///
/// # Safety
/// Must run with interrupts disabled; every entry points at a trap
/// trampoline stub that assumes the full software GPR save sequence in
/// `trapasm.rs`.
pub unsafe fn init() {
    IDT.load();
}

#[cfg(test)]
mod tests {
    #[test]
    fn exception_range_matches_spec() {
        assert_eq!(crate::param::CPU_EXCEPTION_END, 32);
    }

    #[test]
    fn nmi_and_double_fault_use_distinct_ist_slots() {
        assert_ne!(crate::tss::NMI_IST_INDEX, crate::tss::DOUBLE_FAULT_IST_INDEX);
    }
}
