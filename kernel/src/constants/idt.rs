//! Interrupt Descriptor Table configuration.

pub const IDT_ENTRIES: usize = 256;

/// Vectors 0..32 are reserved for CPU exceptions.
pub const EXCEPTION_COUNT: u8 = 32;

/// Legacy IRQ lines are remapped to 32..48.
pub const IRQ_BASE: u8 = 32;
pub const IRQ_COUNT: u8 = 16;

/// Vector number assigned to the timer interrupt.
pub const TIMER_VECTOR: u8 = IRQ_BASE;
pub const TIMER_IRQ: u8 = TIMER_VECTOR - IRQ_BASE;

/// Local APIC error interrupts arrive on the line after the timer.
pub const APIC_ERROR_VECTOR: u8 = IRQ_BASE + 1;

pub const SPURIOUS_VECTOR: u8 = 0xFF;

pub const DIVIDE_ERROR_VECTOR: u8 = 0;
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
pub const GENERAL_PROTECTION_VECTOR: u8 = 13;
pub const PAGE_FAULT_VECTOR: u8 = 14;
