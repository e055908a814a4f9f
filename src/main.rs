#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

//! Entry point and boot sequence.
//!
//! Grounded on the enrichment source's `arch/x86_64/boot.rs` for the
//! ordering (GDT, TSS, IDT, CPU feature checks, console, then timer
//! calibration) and on the teacher's `kmain` for the "CPU 0 does the
//! one-time setup, everyone else just joins the scheduler" split —
//! generalized here to a single bootstrap CPU, since bringing up
//! application processors (sending INIT/SIPI) is external to this
//! core (spec §1's out-of-scope list covers everything above the
//! LAPIC/PIT calibration boundary; AP bring-up lives below it, in the
//! loader).

mod apic;
mod cpu;
mod gdt;
mod hooks;
mod idt;
mod logger;
mod panic_halt;
mod param;
mod proc;
mod serial;
mod signal;
mod spinlock;
mod time;
mod tlb;
mod trap;
mod trapasm;
mod tss;

use bootloader_api::{entry_point, BootInfo};
use x86_64::registers::control::Cr3;

#[cfg(not(test))]
entry_point!(kmain);

#[cfg_attr(test, allow(dead_code))]
fn kmain(_boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init();
    cpu::assert_required_features();

    unsafe {
        gdt::init();
        tss::init();
        idt::init();

        let lapic_id = apic::id();
        cpu::init_this_cpu(lapic_id);
        apic::init(lapic_id == 0);
        time::init();

        let (frame, _) = Cr3::read();
        let kernel_pmap = frame.start_address().as_u64();
        proc::init(kernel_pmap);

        log::info!("boot complete on cpu {}", lapic_id);
        x86_64::instructions::interrupts::enable();
    }

    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {}", info);
    panic_halt::halt_all_cpus();
}
