//! Hardware seam for everything the core cannot do in plain memory.
//!
//! The memory, dispatch and scheduling code only reaches the CPU through
//! [`Hal`], so it runs unchanged against the recording mock in tests.

use x86_64::{structures::paging::PhysFrame, VirtAddr};

pub trait Hal {
    /// Root of the currently loaded page-table hierarchy (CR3).
    fn read_root(&self) -> PhysFrame;

    /// Loads a new page-table root.
    ///
    /// # Safety
    /// The new hierarchy must map the currently executing code and stack.
    unsafe fn write_root(&mut self, root: PhysFrame);

    /// Drops any TLB entry for `page`.
    fn invalidate_page(&mut self, page: VirtAddr);

    /// Loads the interrupt descriptor table register.
    ///
    /// # Safety
    /// `base` must point to a valid table of `limit + 1` bytes that stays
    /// mapped for as long as it is loaded.
    unsafe fn load_interrupt_table(&mut self, base: VirtAddr, limit: u16);

    /// Acknowledges the interrupt in service at the local APIC.
    fn end_of_interrupt(&mut self);
}

#[cfg(target_os = "none")]
pub use self::x86::X86Hal;

#[cfg(target_os = "none")]
mod x86 {
    use super::Hal;
    use crate::interrupts::x2apic::LocalApic;
    use x86_64::{
        instructions::{tables::lidt, tlb},
        registers::control::{Cr3, Cr3Flags},
        structures::{paging::PhysFrame, DescriptorTablePointer},
        VirtAddr,
    };

    /// The real CPU plus its local APIC.
    pub struct X86Hal {
        apic: Option<LocalApic>,
    }

    impl X86Hal {
        pub const fn new() -> Self {
            Self { apic: None }
        }

        /// EOIs are dropped until an APIC is attached.
        pub fn attach_apic(&mut self, apic: LocalApic) {
            self.apic = Some(apic);
        }

        pub fn apic_mut(&mut self) -> Option<&mut LocalApic> {
            self.apic.as_mut()
        }
    }

    impl Default for X86Hal {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Hal for X86Hal {
        fn read_root(&self) -> PhysFrame {
            Cr3::read().0
        }

        unsafe fn write_root(&mut self, root: PhysFrame) {
            Cr3::write(root, Cr3Flags::empty());
        }

        fn invalidate_page(&mut self, page: VirtAddr) {
            tlb::flush(page);
        }

        unsafe fn load_interrupt_table(&mut self, base: VirtAddr, limit: u16) {
            lidt(&DescriptorTablePointer { limit, base });
        }

        fn end_of_interrupt(&mut self) {
            if let Some(apic) = self.apic.as_mut() {
                apic.end_of_interrupt();
            }
        }
    }
}
