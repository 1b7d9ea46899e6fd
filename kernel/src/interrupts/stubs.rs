//! Assembly entry points for every armed vector.
//!
//! Each stub leaves a [`TrapFrame`](super::dispatch::TrapFrame) on the
//! interrupted stack: a dummy error code where the CPU pushes none, the
//! vector, then the general-purpose registers. `trap_common` hands the frame
//! to `trap_dispatch` and returns with `iretq`, so any change the dispatcher
//! makes to the frame (including `rip`/`rsp` during a task switch) takes
//! effect on return.
//!
//! 5 CPU words + error code + vector + 15 registers keeps `rsp` 16-byte
//! aligned at the `call`.

use x86_64::{structures::idt::InterruptDescriptorTable, VirtAddr};

use crate::interrupts::idt;

core::arch::global_asm!(
    r#"
.section .text

.macro TRAP_STUB_NO_ERROR vector
.global trap_stub_\vector
trap_stub_\vector:
    push 0
    push \vector
    jmp trap_common
.endm

.macro TRAP_STUB_ERROR vector
.global trap_stub_\vector
trap_stub_\vector:
    push \vector
    jmp trap_common
.endm

.irp v, 0, 1, 2, 3, 4, 5, 6, 7, 9, 16, 18, 19, 20, 28, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 255
    TRAP_STUB_NO_ERROR \v
.endr

.irp v, 8, 10, 11, 12, 13, 14, 17, 21, 29, 30
    TRAP_STUB_ERROR \v
.endr

trap_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    cld
    mov rdi, rsp
    call trap_dispatch

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax

    add rsp, 16
    iretq
"#
);

macro_rules! stub_table {
    ($($vector:literal => $stub:ident,)*) => {
        extern "C" {
            $(fn $stub();)*
        }

        /// Address of the entry stub for `vector`.
        pub fn stub_address(vector: u8) -> Option<u64> {
            match vector {
                $($vector => Some($stub as usize as u64),)*
                _ => None,
            }
        }
    };
}

stub_table! {
    0 => trap_stub_0,
    1 => trap_stub_1,
    2 => trap_stub_2,
    3 => trap_stub_3,
    4 => trap_stub_4,
    5 => trap_stub_5,
    6 => trap_stub_6,
    7 => trap_stub_7,
    8 => trap_stub_8,
    9 => trap_stub_9,
    10 => trap_stub_10,
    11 => trap_stub_11,
    12 => trap_stub_12,
    13 => trap_stub_13,
    14 => trap_stub_14,
    16 => trap_stub_16,
    17 => trap_stub_17,
    18 => trap_stub_18,
    19 => trap_stub_19,
    20 => trap_stub_20,
    21 => trap_stub_21,
    28 => trap_stub_28,
    29 => trap_stub_29,
    30 => trap_stub_30,
    32 => trap_stub_32,
    33 => trap_stub_33,
    34 => trap_stub_34,
    35 => trap_stub_35,
    36 => trap_stub_36,
    37 => trap_stub_37,
    38 => trap_stub_38,
    39 => trap_stub_39,
    40 => trap_stub_40,
    41 => trap_stub_41,
    42 => trap_stub_42,
    43 => trap_stub_43,
    44 => trap_stub_44,
    45 => trap_stub_45,
    46 => trap_stub_46,
    47 => trap_stub_47,
    255 => trap_stub_255,
}

/// A table with every exception, IRQ and the spurious vector armed.
pub fn build_interrupt_table() -> InterruptDescriptorTable {
    idt::build_table(|vector| stub_address(vector).map(VirtAddr::new))
}
