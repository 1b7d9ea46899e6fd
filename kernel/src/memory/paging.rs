//! Four-level page tables walked and edited through the direct map.

use log::warn;
use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{constants::memory::PAGE_SIZE, hal::Hal, memory::direct_map::DirectMap};

/// Flags for freshly installed intermediate tables. Leaves carry the real
/// restrictions.
pub const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

const HUGE_1G: u64 = 1 << 30;
const HUGE_2M: u64 = 1 << 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
    #[error("no frame available for an intermediate page table")]
    FrameAllocationFailed,
    #[error("a huge page already covers {0:#x}")]
    HugePageInPath(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("address {0:#x} is not mapped")]
pub struct NotMapped(pub u64);

/// A changed leaf whose stale TLB entry still has to be dropped.
#[must_use = "page table changes must be flushed or ignored"]
#[derive(Debug)]
pub struct PageFlush(VirtAddr);

impl PageFlush {
    pub fn flush(self, hal: &mut impl Hal) {
        hal.invalidate_page(self.0);
    }

    /// For address spaces that are not loaded.
    pub fn ignore(self) {}

    pub fn page(&self) -> VirtAddr {
        self.0
    }
}

/// One page-table hierarchy, identified by its root (PML4) frame.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
    map: DirectMap,
}

impl AddressSpace {
    /// Allocates an empty hierarchy.
    pub fn new(
        map: DirectMap,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, MapError> {
        let root = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        unsafe { map.zero_frame(root) };
        Ok(Self { root, map })
    }

    /// Adopts an existing hierarchy, such as the one the bootloader left in CR3.
    ///
    /// # Safety
    /// `root` must be a valid PML4 whose tables are all reachable through `map`.
    pub unsafe fn from_root(root: PhysFrame, map: DirectMap) -> Self {
        Self { root, map }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn direct_map(&self) -> DirectMap {
        self.map
    }

    /// Maps one 4 KiB page, creating intermediate tables as needed.
    ///
    /// An existing leaf is overwritten. `PRESENT` is always added.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<PageFlush, MapError> {
        if !virt.is_aligned(PAGE_SIZE) {
            warn!("map_page: virtual address {:#x} is not page aligned", virt.as_u64());
            return Err(MapError::Misaligned(virt.as_u64()));
        }
        if !phys.is_aligned(PAGE_SIZE) {
            warn!("map_page: physical address {:#x} is not page aligned", phys.as_u64());
            return Err(MapError::Misaligned(phys.as_u64()));
        }

        let mut table = self.root;
        for index in [
            usize::from(virt.p4_index()),
            usize::from(virt.p3_index()),
            usize::from(virt.p2_index()),
        ] {
            let entry = unsafe { &mut self.map.table_mut(table)[index] };
            table = self.next_table_or_create(entry, virt, frames)?;
        }

        let leaf = unsafe { &mut self.map.table_mut(table)[virt.p1_index()] };
        leaf.set_addr(phys, flags | PageTableFlags::PRESENT);
        Ok(PageFlush(virt))
    }

    /// Maps `len` bytes page by page. Used while building a hierarchy that is
    /// not loaded yet, so no flushes are produced.
    pub fn map_range(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        len: u64,
        flags: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), MapError> {
        let mut offset = 0;
        while offset < len {
            self.map_page(virt + offset, phys + offset, flags, frames)?
                .ignore();
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Clears the leaf for `virt` and returns the frame it pointed to.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<(PhysFrame, PageFlush), NotMapped> {
        let page = virt.align_down(PAGE_SIZE);
        let leaf = self.leaf_mut(page)?;
        let frame = PhysFrame::containing_address(leaf.addr());
        leaf.set_unused();
        Ok((frame, PageFlush(page)))
    }

    /// Physical address `virt` resolves to. 2 MiB and 1 GiB leaves are
    /// honoured so bootloader tables can be walked too.
    pub fn translate(&self, virt: VirtAddr) -> Result<PhysAddr, NotMapped> {
        let missing = NotMapped(virt.as_u64());

        let p4 = unsafe { self.map.table_mut(self.root) };
        let entry = present(&p4[virt.p4_index()]).ok_or(missing)?;

        let p3 = unsafe { self.map.table_mut(frame_of(entry)) };
        let entry = present(&p3[virt.p3_index()]).ok_or(missing)?;
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(huge_base(entry, HUGE_1G) + (virt.as_u64() & (HUGE_1G - 1)));
        }

        let p2 = unsafe { self.map.table_mut(frame_of(entry)) };
        let entry = present(&p2[virt.p2_index()]).ok_or(missing)?;
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(huge_base(entry, HUGE_2M) + (virt.as_u64() & (HUGE_2M - 1)));
        }

        let p1 = unsafe { self.map.table_mut(frame_of(entry)) };
        let entry = present(&p1[virt.p1_index()]).ok_or(missing)?;
        Ok(entry.addr() + u64::from(virt.page_offset()))
    }

    /// Leaf flags of a 4 KiB mapping.
    pub fn flags(&self, virt: VirtAddr) -> Result<PageTableFlags, NotMapped> {
        let leaf = unsafe { &*(self.leaf_ptr(virt.align_down(PAGE_SIZE))?) };
        Ok(leaf.flags())
    }

    /// Rewrites the flags of an existing 4 KiB mapping in place.
    pub fn update_flags(
        &mut self,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<PageFlush, NotMapped> {
        let page = virt.align_down(PAGE_SIZE);
        let leaf = self.leaf_mut(page)?;
        leaf.set_flags(flags | PageTableFlags::PRESENT);
        Ok(PageFlush(page))
    }

    fn next_table_or_create(
        &self,
        entry: &mut PageTableEntry,
        virt: VirtAddr,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<PhysFrame, MapError> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) {
            let frame = frames
                .allocate_frame()
                .ok_or(MapError::FrameAllocationFailed)?;
            unsafe { self.map.zero_frame(frame) };
            entry.set_frame(frame, TABLE_FLAGS);
            return Ok(frame);
        }
        if flags.contains(PageTableFlags::HUGE_PAGE) {
            return Err(MapError::HugePageInPath(virt.as_u64()));
        }
        Ok(frame_of(entry))
    }

    fn leaf_mut(&mut self, page: VirtAddr) -> Result<&mut PageTableEntry, NotMapped> {
        let leaf = self.leaf_ptr(page)?;
        Ok(unsafe { &mut *leaf })
    }

    /// Walks to the present 4 KiB leaf for `page`; huge mappings count as
    /// not mapped here.
    fn leaf_ptr(&self, page: VirtAddr) -> Result<*mut PageTableEntry, NotMapped> {
        let missing = NotMapped(page.as_u64());
        let mut table = self.root;
        for index in [page.p4_index(), page.p3_index(), page.p2_index()] {
            let entry = unsafe { &self.map.table_mut(table)[index] };
            let entry = present(entry).ok_or(missing)?;
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(missing);
            }
            table = frame_of(entry);
        }
        let leaf = unsafe { &mut self.map.table_mut(table)[page.p1_index()] };
        if !leaf.flags().contains(PageTableFlags::PRESENT) {
            return Err(missing);
        }
        Ok(leaf as *mut PageTableEntry)
    }
}

fn present(entry: &PageTableEntry) -> Option<&PageTableEntry> {
    entry
        .flags()
        .contains(PageTableFlags::PRESENT)
        .then_some(entry)
}

fn frame_of(entry: &PageTableEntry) -> PhysFrame {
    PhysFrame::containing_address(entry.addr())
}

/// Huge leaves reuse bit 12 for PAT, so mask down to the page size.
fn huge_base(entry: &PageTableEntry, size: u64) -> PhysAddr {
    PhysAddr::new(entry.addr().as_u64() & !(size - 1))
}
