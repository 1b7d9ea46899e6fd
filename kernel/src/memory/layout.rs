//! Boot-time description of physical memory and the kernel image, copied out
//! of the bootloader responses before their memory goes away.

use arrayvec::ArrayVec;
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

use crate::{constants::memory::MAX_MEMORY_REGIONS, memory::direct_map::DirectMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self {
            base: PhysAddr::new_truncate(base),
            length,
            kind,
        }
    }

    pub fn end(&self) -> PhysAddr {
        self.base + self.length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Rodata,
    Data,
}

impl SectionKind {
    /// Executable code is read-only, everything else is non-executable.
    pub fn flags(self) -> PageTableFlags {
        match self {
            SectionKind::Text => PageTableFlags::PRESENT,
            SectionKind::Rodata => PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
            SectionKind::Data => {
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
            }
        }
    }
}

/// A page-aligned range of the linked kernel image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelSection {
    pub kind: SectionKind,
    pub start: VirtAddr,
    pub end: VirtAddr,
}

/// Where the kernel was linked and where the bootloader placed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelImage {
    pub phys_base: PhysAddr,
    pub virt_base: VirtAddr,
    pub sections: [KernelSection; 3],
}

impl KernelImage {
    /// Physical address backing a virtual address inside the image.
    pub fn phys_of(&self, virt: VirtAddr) -> PhysAddr {
        self.phys_base + (virt - self.virt_base)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub phys: PhysAddr,
    pub pitch: u64,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
}

impl FramebufferInfo {
    pub fn size(&self) -> u64 {
        self.pitch * self.height
    }
}

/// Everything the higher-half transition needs, held in kernel-owned storage.
#[derive(Clone, Debug)]
pub struct BootInfo {
    pub direct_map: DirectMap,
    pub regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    pub kernel: KernelImage,
    pub framebuffer: Option<FramebufferInfo>,
    /// xAPIC register window, absent when the APIC runs in x2APIC mode.
    pub lapic_mmio: Option<PhysAddr>,
}

impl BootInfo {
    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.regions.iter().filter(|r| r.kind == RegionKind::Usable)
    }
}
