//! Physical page allocator.
//!
//! Free frames are tracked by a chain of *stack pages*: each one is itself a
//! free physical page holding the address of the next stack page followed by
//! up to 511 free frame addresses. Only the head of the chain is partially
//! filled; every page behind it is full. Both operations are O(1) and the
//! registry needs no storage beyond the memory it manages.

use log::{debug, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    constants::memory::{PAGE_SIZE, PAGE_TABLE_ENTRIES},
    memory::{
        direct_map::DirectMap,
        layout::{MemoryRegion, RegionKind},
    },
};

/// Free addresses one stack page can hold after its link word.
pub const STACK_PAGE_CAPACITY: usize = PAGE_TABLE_ENTRIES - 1;

#[repr(C)]
struct StackPage {
    next: u64,
    entries: [u64; STACK_PAGE_CAPACITY],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("physical address {0:#x} is not a usable page address")]
    Misaligned(u64),
}

pub struct StackFrameAllocator {
    map: DirectMap,
    head: Option<PhysFrame>,
    /// Number of valid entries in the head stack page.
    fill: usize,
    free: u64,
    total: u64,
}

impl StackFrameAllocator {
    /// An allocator with nothing to hand out.
    pub const fn empty(map: DirectMap) -> Self {
        Self {
            map,
            head: None,
            fill: 0,
            free: 0,
            total: 0,
        }
    }

    /// Builds the registry from every usable region of the memory map.
    ///
    /// # Safety
    /// Every usable region must be unused RAM reachable through `map`.
    pub unsafe fn from_memory_map(regions: &[MemoryRegion], map: DirectMap) -> Self {
        let mut allocator = Self::empty(map);
        for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
            allocator.add_region(region.base, region.length);
        }
        debug!(
            "frame allocator: {} pages ({} KiB) free",
            allocator.free,
            allocator.free * PAGE_SIZE / 1024
        );
        allocator
    }

    /// Hands every whole page of `[base, base + length)` to the registry.
    /// Physical page 0 is skipped since 0 terminates the chain.
    ///
    /// # Safety
    /// The range must be unused RAM reachable through the direct map.
    pub unsafe fn add_region(&mut self, base: PhysAddr, length: u64) {
        let start = base.align_up(PAGE_SIZE).as_u64().max(PAGE_SIZE);
        let end = (base.as_u64() + length) & !(PAGE_SIZE - 1);

        let mut addr = start;
        while addr < end {
            if self.push(addr).is_ok() {
                self.total += 1;
            }
            addr += PAGE_SIZE;
        }
    }

    /// Pops the most recently freed page.
    ///
    /// When the head stack page has no entries left, the head page itself is
    /// handed out and its successor becomes the new head.
    pub fn allocate_page(&mut self) -> Result<PhysFrame, FrameError> {
        let head = self.head.ok_or(FrameError::OutOfMemory)?;
        let page = unsafe { self.stack_page(head) };

        let addr = if self.fill > 0 {
            self.fill -= 1;
            page.entries[self.fill]
        } else {
            let next = page.next;
            self.head = (next != 0).then(|| PhysFrame::containing_address(PhysAddr::new(next)));
            self.fill = if self.head.is_some() {
                STACK_PAGE_CAPACITY
            } else {
                0
            };
            head.start_address().as_u64()
        };

        self.free -= 1;
        Ok(PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    /// Returns a page to the registry.
    ///
    /// Misaligned addresses and address 0 are logged and ignored.
    ///
    /// # Safety
    /// The page must not be mapped or otherwise in use, and must not already
    /// be in the registry.
    pub unsafe fn free_page(&mut self, addr: PhysAddr) -> Result<(), FrameError> {
        self.push(addr.as_u64()).inspect_err(|_| {
            warn!("ignoring free of invalid page address {:#x}", addr.as_u64());
        })
    }

    unsafe fn push(&mut self, addr: u64) -> Result<(), FrameError> {
        if addr == 0 || addr % PAGE_SIZE != 0 {
            return Err(FrameError::Misaligned(addr));
        }

        match self.head {
            Some(head) if self.fill < STACK_PAGE_CAPACITY => {
                let page = self.stack_page(head);
                page.entries[self.fill] = addr;
                self.fill += 1;
            }
            _ => {
                let frame = PhysFrame::containing_address(PhysAddr::new(addr));
                self.map.zero_frame(frame);
                let page = self.stack_page(frame);
                page.next = self.head.map_or(0, |h| h.start_address().as_u64());
                self.head = Some(frame);
                self.fill = 0;
            }
        }

        self.free += 1;
        Ok(())
    }

    unsafe fn stack_page<'a>(&self, frame: PhysFrame) -> &'a mut StackPage {
        &mut *self.map.ptr::<StackPage>(frame.start_address())
    }

    pub fn free_pages(&self) -> u64 {
        self.free
    }

    /// Pages ever added from the memory map.
    pub fn total_pages(&self) -> u64 {
        self.total
    }

    pub fn direct_map(&self) -> DirectMap {
        self.map
    }
}

unsafe impl FrameAllocator<Size4KiB> for StackFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate_page().ok()
    }
}

impl FrameDeallocator<Size4KiB> for StackFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.free_page(frame.start_address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMemory;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::collections::HashSet;

    fn allocator(memory: &SimulatedMemory, pages: u64) -> StackFrameAllocator {
        let mut frames = StackFrameAllocator::empty(memory.direct_map());
        unsafe { frames.add_region(PhysAddr::new(PAGE_SIZE), pages * PAGE_SIZE) };
        frames
    }

    #[test]
    fn allocated_pages_are_aligned() {
        let memory = SimulatedMemory::new(64);
        let mut frames = allocator(&memory, 63);
        while let Ok(frame) = frames.allocate_page() {
            assert_eq!(frame.start_address().as_u64() % PAGE_SIZE, 0);
        }
    }

    #[test]
    fn free_then_allocate_returns_same_page() {
        let memory = SimulatedMemory::new(64);
        let mut frames = allocator(&memory, 63);

        let a = frames.allocate_page().unwrap();
        let b = frames.allocate_page().unwrap();
        unsafe { frames.free_page(a.start_address()).unwrap() };
        assert_eq!(frames.allocate_page().unwrap(), a);
        unsafe { frames.free_page(b.start_address()).unwrap() };
        assert_eq!(frames.allocate_page().unwrap(), b);
    }

    #[test]
    fn page_freed_onto_a_full_head_is_allocated_next() {
        let memory = SimulatedMemory::new(1024);
        // One head page plus a full set of entries.
        let mut frames = allocator(&memory, 1 + STACK_PAGE_CAPACITY as u64);
        let freed = PhysAddr::new(0x25_8000);

        for _ in 0..2 {
            unsafe { frames.free_page(freed).unwrap() };
            assert_eq!(frames.free_pages(), 2 + STACK_PAGE_CAPACITY as u64);
            assert_eq!(frames.allocate_page().unwrap().start_address(), freed);
        }

        let mut drained = 0;
        while frames.allocate_page().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 1 + STACK_PAGE_CAPACITY);
        assert_eq!(frames.free_pages(), 0);
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        // Enough pages to need several stack pages in the chain.
        let memory = SimulatedMemory::new(1200);
        let mut frames = allocator(&memory, 1199);
        let total = frames.total_pages();
        assert_eq!(total, 1199);

        let mut seen = HashSet::new();
        for _ in 0..total {
            let frame = frames.allocate_page().expect("page available");
            assert!(seen.insert(frame), "page handed out twice");
        }
        assert_eq!(frames.allocate_page(), Err(FrameError::OutOfMemory));
        assert_eq!(frames.free_pages(), 0);
    }

    #[test]
    fn page_zero_is_never_handed_out() {
        let memory = SimulatedMemory::new(8);
        let mut frames = StackFrameAllocator::empty(memory.direct_map());
        unsafe { frames.add_region(PhysAddr::new(0), 8 * PAGE_SIZE) };
        assert_eq!(frames.total_pages(), 7);
        while let Ok(frame) = frames.allocate_page() {
            assert_ne!(frame.start_address().as_u64(), 0);
        }
    }

    #[test]
    fn misaligned_free_is_ignored() {
        let memory = SimulatedMemory::new(16);
        let mut frames = allocator(&memory, 15);
        let before = frames.free_pages();

        let result = unsafe { frames.free_page(PhysAddr::new(0x2010)) };
        assert_eq!(result, Err(FrameError::Misaligned(0x2010)));
        assert_eq!(unsafe { frames.free_page(PhysAddr::new(0)) }, Err(FrameError::Misaligned(0)));
        assert_eq!(frames.free_pages(), before);
    }

    #[test]
    fn region_bounds_are_trimmed_to_whole_pages() {
        let memory = SimulatedMemory::new(16);
        let mut frames = StackFrameAllocator::empty(memory.direct_map());
        unsafe { frames.add_region(PhysAddr::new(0x1800), 4 * PAGE_SIZE) };
        // [0x1800, 0x5800) holds the whole pages 0x2000..0x5000.
        assert_eq!(frames.total_pages(), 3);
    }

    #[test]
    fn random_churn_keeps_allocated_and_free_disjoint() {
        let memory = SimulatedMemory::new(2048);
        let mut frames = allocator(&memory, 2047);
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut held: Vec<PhysFrame> = Vec::new();

        for _ in 0..10_000 {
            if held.is_empty() || rng.gen_bool(0.55) {
                match frames.allocate_page() {
                    Ok(frame) => {
                        assert!(!held.contains(&frame), "allocated page still held");
                        held.push(frame);
                    }
                    Err(FrameError::OutOfMemory) => assert_eq!(held.len(), 2047),
                    Err(e) => panic!("unexpected error {e}"),
                }
            } else {
                let frame = held.swap_remove(rng.gen_range(0..held.len()));
                unsafe { frames.free_page(frame.start_address()).unwrap() };
            }
            assert_eq!(frames.free_pages() + held.len() as u64, 2047);
        }

        // Drain what is left; nothing handed out may already be held.
        let held: HashSet<_> = held.into_iter().collect();
        while let Ok(frame) = frames.allocate_page() {
            assert!(!held.contains(&frame));
        }
    }
}
