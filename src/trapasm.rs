//! The trap trampoline: 256 tiny per-vector stubs that normalize the
//! hardware-pushed frame (pushing a dummy error code where the CPU
//! doesn't), push the real vector number, and fall into one shared
//! body that saves the remaining general-purpose registers and calls
//! `trap::trap_dispatch` with a pointer to the resulting `TrapFrame`.
//!
//! This is the x86-64 analogue of the teacher's separate assembly
//! trampolines (`kernelvec.S`, `trampoline.S`): the spec treats "a
//! pointer to a fixed-layout register frame placed on the kernel stack
//! by the trap trampoline" as a given (spec §4.1), and a Rust kernel
//! has to provide that trampoline itself rather than linking an
//! existing `.S` file. `extern "x86-interrupt"` functions were
//! deliberately avoided here: the compiler decides what they save, and
//! spec §4.1's FPU-save-before-classification policy and the synthetic
//! `_userint` return (which overwrites RIP/RSP/RAX/RBX directly)
//! require full, addressable control over every GPR slot.
//!
//! `VEC_STUB_TABLE` exports the 256 stub addresses as a flat array so
//! `idt.rs` can install them in a loop instead of hand-listing 256
//! `extern "C"` symbols.

use core::arch::global_asm;

global_asm!(
    r#"
.altmacro

.macro has_errcode vec
    .if (\vec == 8) || (\vec == 10) || (\vec == 11) || (\vec == 12) || (\vec == 13) || (\vec == 14) || (\vec == 17) || (\vec == 21)
        .byte 1
    .else
        .byte 0
    .endif
.endm

.macro vec_stub vec
.align 8
vec_stub_\vec:
    .if (\vec == 8) || (\vec == 10) || (\vec == 11) || (\vec == 12) || (\vec == 13) || (\vec == 14) || (\vec == 17) || (\vec == 21)
        // hardware already pushed an error code
    .else
        push 0
    .endif
    push \vec
    jmp common_trap_entry
.endm

.irp n,0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48,49,50,51,52,53,54,55,56,57,58,59,60,61,62,63,64,65,66,67,68,69,70,71,72,73,74,75,76,77,78,79,80,81,82,83,84,85,86,87,88,89,90,91,92,93,94,95,96,97,98,99,100,101,102,103,104,105,106,107,108,109,110,111,112,113,114,115,116,117,118,119,120,121,122,123,124,125,126,127,128,129,130,131,132,133,134,135,136,137,138,139,140,141,142,143,144,145,146,147,148,149,150,151,152,153,154,155,156,157,158,159,160,161,162,163,164,165,166,167,168,169,170,171,172,173,174,175,176,177,178,179,180,181,182,183,184,185,186,187,188,189,190,191,192,193,194,195,196,197,198,199,200,201,202,203,204,205,206,207,208,209,210,211,212,213,214,215,216,217,218,219,220,221,222,223,224,225,226,227,228,229,230,231,232,233,234,235,236,237,238,239,240,241,242,243,244,245,246,247,248,249,250,251,252,253,254,255
    vec_stub %n
.endr

common_trap_entry:
    // Build the 24-slot TrapFrame: 15 GPRs + trapno + err (17
    // software-pushed slots) sit below the 7 hardware/iretq slots
    // (err, rip, cs, rflags, rsp, ss, plus one reserved for 16-byte
    // stack alignment) already on the stack.
    push r15
    push r14
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push rbp
    push rdi
    push rsi
    push rdx
    push rcx
    push rbx
    push rax

    mov rdi, rsp
    cld
    call trap_dispatch

    // trap_dispatch does not return through the ordinary call
    // mechanism on any live path (spec §4.1); this label exists only
    // so the fast NMI/perfmask return path has somewhere to land.
common_trap_return:
    pop rax
    pop rbx
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    pop rbp
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    add rsp, 16
    iretq

// Enter user mode running the register/FPU state pointed to by
// rdi/rsi, recording the entry RSP at [rdx] so a later trap can
// fabricate a return straight back to our caller (spec §4.1's
// "_userint" path, §6's `Userrun`). rdx points at the calling
// thread's `saved_krsp` slot.
//
// Field offsets below mirror `TrapFrame`'s layout in trap.rs exactly.
.global userrun
userrun:
    mov [rdx], rsp
    fxrstor64 [rsi]

    mov rax, [rdi + 168]
    push rax                // ss
    mov rax, [rdi + 160]
    push rax                // rsp
    mov rax, [rdi + 152]
    push rax                // rflags
    mov rax, [rdi + 144]
    push rax                // cs
    mov rax, [rdi + 136]
    push rax                // rip

    mov rbx, [rdi + 8]
    mov rcx, [rdi + 16]
    mov rsi, [rdi + 32]
    mov rbp, [rdi + 48]
    mov r8,  [rdi + 56]
    mov r9,  [rdi + 64]
    mov r10, [rdi + 72]
    mov r11, [rdi + 80]
    mov r12, [rdi + 88]
    mov r13, [rdi + 96]
    mov r14, [rdi + 104]
    mov r15, [rdi + 112]
    mov rdx, [rdi + 24]
    mov rax, [rdi + 0]
    mov rdi, [rdi + 40]
    iretq

// Landing pad for the synthetic return the trap dispatcher fabricates
// on a user-mode exception: RSP has been restored to the value
// `userrun` recorded, so the only thing left on the stack is the
// return address `userrun`'s caller pushed with its original `call`.
// RBX carries CR2 across that `ret`, mirrored into RDX so the two
// values come back as a normal SysV two-word (RAX, RDX) return.
.global userint
userint:
    mov rdx, rbx
    ret

.section .rodata
.align 8
.global VEC_STUB_TABLE
VEC_STUB_TABLE:
.irp n,0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48,49,50,51,52,53,54,55,56,57,58,59,60,61,62,63,64,65,66,67,68,69,70,71,72,73,74,75,76,77,78,79,80,81,82,83,84,85,86,87,88,89,90,91,92,93,94,95,96,97,98,99,100,101,102,103,104,105,106,107,108,109,110,111,112,113,114,115,116,117,118,119,120,121,122,123,124,125,126,127,128,129,130,131,132,133,134,135,136,137,138,139,140,141,142,143,144,145,146,147,148,149,150,151,152,153,154,155,156,157,158,159,160,161,162,163,164,165,166,167,168,169,170,171,172,173,174,175,176,177,178,179,180,181,182,183,184,185,186,187,188,189,190,191,192,193,194,195,196,197,198,199,200,201,202,203,204,205,206,207,208,209,210,211,212,213,214,215,216,217,218,219,220,221,222,223,224,225,226,227,228,229,230,231,232,233,234,235,236,237,238,239,240,241,242,243,244,245,246,247,248,249,250,251,252,253,254,255
    .quad vec_stub_\n
.endr
"#
);

extern "C" {
    /// 256 entries, one stub address per IDT vector.
    pub static VEC_STUB_TABLE: [u64; 256];
}

extern "C" {
    /// Exposed so `signal.rs`/`trap.rs` can resume through the same
    /// GPR-restore path a normal trap return uses.
    pub fn common_trap_return();

    /// Enter user mode; see the `userrun` assembly above for the
    /// calling convention. Returns once the thread naturally re-enters
    /// the kernel and the trap dispatcher fabricates the `_userint`
    /// return (spec §4.1, §6).
    pub fn userrun(tf: *mut crate::trap::TrapFrame, fx: *mut crate::trap::FxArea, sys_rsp_slot: *mut u64) -> UserrunResult;

    /// Address-only symbol: the trap dispatcher writes this into a
    /// synthetic frame's RIP field, never calls it directly.
    pub fn userint();
}

#[repr(C)]
pub struct UserrunResult {
    pub trapno: u64,
    pub cr2: u64,
}
