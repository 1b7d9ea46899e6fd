//! Host-side stand-ins for physical RAM and the CPU.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::vec::Vec;

use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::{constants::memory::PAGE_SIZE, hal::Hal, memory::direct_map::DirectMap};

/// Zeroed, page-aligned heap block standing in for physical memory
/// `[0, pages * 4096)`. Its direct map offset is the block's address.
pub struct SimulatedMemory {
    base: *mut u8,
    layout: Layout,
}

impl SimulatedMemory {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .expect("valid layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "simulated memory allocation failed");
        Self { base, layout }
    }

    pub fn direct_map(&self) -> DirectMap {
        DirectMap::new(self.base as u64)
    }
}

impl Drop for SimulatedMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Records every hardware request instead of performing it.
#[derive(Debug)]
pub struct MockHal {
    pub root: PhysFrame,
    pub root_writes: Vec<PhysFrame>,
    pub invalidated: Vec<VirtAddr>,
    pub tables_loaded: Vec<(VirtAddr, u16)>,
    pub eois: usize,
}

impl MockHal {
    pub fn new(root: PhysFrame) -> Self {
        Self {
            root,
            root_writes: Vec::new(),
            invalidated: Vec::new(),
            tables_loaded: Vec::new(),
            eois: 0,
        }
    }
}

impl Hal for MockHal {
    fn read_root(&self) -> PhysFrame {
        self.root
    }

    unsafe fn write_root(&mut self, root: PhysFrame) {
        self.root = root;
        self.root_writes.push(root);
    }

    fn invalidate_page(&mut self, page: VirtAddr) {
        self.invalidated.push(page);
    }

    unsafe fn load_interrupt_table(&mut self, base: VirtAddr, limit: u16) {
        self.tables_loaded.push((base, limit));
    }

    fn end_of_interrupt(&mut self) {
        self.eois += 1;
    }
}
