//! Higher-half direct map: every usable physical page `p` is visible at
//! `p + offset`.

use x86_64::{
    structures::paging::{PageTable, PhysFrame},
    PhysAddr, VirtAddr,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Raw alias address for `phys`. Wrapping so that host-side simulated
    /// memory can use an arbitrary offset.
    pub const fn alias(&self, phys: PhysAddr) -> u64 {
        phys.as_u64().wrapping_add(self.offset)
    }

    /// Alias of `phys` as a canonical virtual address.
    pub fn virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.alias(phys))
    }

    pub fn ptr<T>(&self, phys: PhysAddr) -> *mut T {
        self.alias(phys) as *mut T
    }

    /// Physical address behind a direct-map alias.
    pub fn phys(&self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new(virt.as_u64().wrapping_sub(self.offset))
    }

    /// Views a page-table frame through the direct map.
    ///
    /// # Safety
    /// `frame` must hold a page table that is reachable through this map and
    /// not aliased by another live reference.
    pub unsafe fn table_mut<'a>(&self, frame: PhysFrame) -> &'a mut PageTable {
        &mut *self.ptr::<PageTable>(frame.start_address())
    }

    /// Fills the frame with zeroes through its alias.
    ///
    /// # Safety
    /// `frame` must be reachable through this map and owned by the caller.
    pub unsafe fn zero_frame(&self, frame: PhysFrame) {
        core::ptr::write_bytes(
            self.ptr::<u8>(frame.start_address()),
            0,
            frame.size() as usize,
        );
    }
}
