//! Interrupt Descriptor Table setup
//!
//! This module provides:
//! - the table every trap stub is installed into
//! - functions to enable/disable interrupts

use core::mem::size_of;

use x86_64::{instructions::interrupts, structures::idt::InterruptDescriptorTable, VirtAddr};

use crate::constants::{
    gdt::DOUBLE_FAULT_IST_INDEX,
    idt::{DOUBLE_FAULT_VECTOR, IRQ_BASE},
};

/// Limit loaded into the IDT register alongside the table base.
pub const IDT_LIMIT: u16 = (size_of::<InterruptDescriptorTable>() - 1) as u16;

/// Builds a table that sends every vector to the entry point `stub` returns
/// for it. Vectors without one stay not-present. The double fault runs on
/// its own IST stack.
pub fn build_table(stub: impl Fn(u8) -> Option<VirtAddr>) -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();

    macro_rules! arm {
        ($($field:ident = $vector:literal),* $(,)?) => {
            $(
                if let Some(addr) = stub($vector) {
                    unsafe { idt.$field.set_handler_addr(addr) };
                }
            )*
        };
    }

    arm!(
        divide_error = 0,
        debug = 1,
        non_maskable_interrupt = 2,
        breakpoint = 3,
        overflow = 4,
        bound_range_exceeded = 5,
        invalid_opcode = 6,
        device_not_available = 7,
        invalid_tss = 10,
        segment_not_present = 11,
        stack_segment_fault = 12,
        general_protection_fault = 13,
        page_fault = 14,
        x87_floating_point = 16,
        alignment_check = 17,
        machine_check = 18,
        simd_floating_point = 19,
        virtualization = 20,
        cp_protection_exception = 21,
        hv_injection_exception = 28,
        vmm_communication_exception = 29,
        security_exception = 30,
    );

    // `coprocessor_segment_overrun` is private; indexing reaches the same entry.
    if let Some(addr) = stub(9) {
        unsafe { idt[9u8].set_handler_addr(addr) };
    }

    if let Some(addr) = stub(DOUBLE_FAULT_VECTOR) {
        unsafe {
            idt.double_fault
                .set_handler_addr(addr)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
    }

    for vector in IRQ_BASE..=u8::MAX {
        if let Some(addr) = stub(vector) {
            unsafe { idt[vector].set_handler_addr(addr) };
        }
    }
    idt
}

/// Enables interrupts on the current CPU.
pub fn enable() {
    interrupts::enable();
}

/// Disables interrupts on the current CPU.
pub fn disable() {
    interrupts::disable();
}

/// Executes a closure with interrupts disabled.
///
/// # Arguments
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_stub(vector: u8) -> Option<VirtAddr> {
        (vector != 40).then(|| VirtAddr::new(0xFFFF_FFFF_8010_0000 + u64::from(vector) * 0x10))
    }

    #[test]
    fn table_spans_one_page() {
        assert_eq!(size_of::<InterruptDescriptorTable>(), 4096);
        assert_eq!(IDT_LIMIT, 4095);
    }

    #[test]
    fn exceptions_point_at_their_stubs() {
        let idt = build_table(fake_stub);
        assert_eq!(idt.divide_error.handler_addr(), fake_stub(0).unwrap());
        assert_eq!(idt.double_fault.handler_addr(), fake_stub(8).unwrap());
        assert_eq!(idt.general_protection_fault.handler_addr(), fake_stub(13).unwrap());
        assert_eq!(idt.page_fault.handler_addr(), fake_stub(14).unwrap());
    }

    #[test]
    fn irqs_and_spurious_vector_are_armed() {
        let idt = build_table(fake_stub);
        assert_eq!(idt[32].handler_addr(), fake_stub(32).unwrap());
        assert_eq!(idt[47].handler_addr(), fake_stub(47).unwrap());
        assert_eq!(idt[0xFF].handler_addr(), fake_stub(0xFF).unwrap());
    }

    #[test]
    fn vectors_without_a_stub_stay_empty() {
        let idt = build_table(fake_stub);
        assert_eq!(idt[40].handler_addr(), VirtAddr::zero());

        let empty = build_table(|_| None);
        assert_eq!(empty.page_fault.handler_addr(), VirtAddr::zero());
    }
}
