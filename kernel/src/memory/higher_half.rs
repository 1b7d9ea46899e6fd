//! Construction of the kernel-owned address space and the one-time switch
//! away from the bootloader's page tables.
//!
//! [`build_kernel_space`] only edits memory, so the whole layout can be
//! checked before anything depends on it. [`enter`] is the single step that
//! touches the CPU.

use log::{debug, info};
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

use crate::{
    constants::memory::{KERNEL_STACK_BASE, KERNEL_STACK_SIZE, PAGE_SIZE},
    memory::{
        frame_allocator::{FrameError, StackFrameAllocator},
        layout::BootInfo,
        paging::{AddressSpace, MapError},
    },
};

pub const DIRECT_MAP_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::NO_EXECUTE);

pub const FRAMEBUFFER_FLAGS: PageTableFlags = DIRECT_MAP_FLAGS.union(PageTableFlags::WRITE_THROUGH);

pub const MMIO_FLAGS: PageTableFlags = DIRECT_MAP_FLAGS.union(PageTableFlags::NO_CACHE);

pub const IDT_ALIAS_FLAGS: PageTableFlags =
    PageTableFlags::PRESENT.union(PageTableFlags::NO_EXECUTE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("no frame left for the kernel stack")]
    Stack(#[from] FrameError),
    #[error("interrupt table at {0:#x} is not mapped by the active page tables")]
    IdtNotMapped(u64),
}

/// A fully populated address space, ready to be loaded.
#[derive(Debug)]
pub struct HigherHalfPlan {
    pub space: AddressSpace,
    pub stack_top: VirtAddr,
    /// The interrupt table as seen through the direct map.
    pub idt_alias: VirtAddr,
}

/// Builds the kernel address space: kernel image sections, direct map of
/// usable memory, framebuffer and local APIC windows, a fresh kernel stack
/// and an alias of the interrupt table.
///
/// `active` is the hierarchy currently loaded; it is only read, to find the
/// physical pages behind the interrupt table.
pub fn build_kernel_space(
    boot: &BootInfo,
    active: &AddressSpace,
    idt: VirtAddr,
    idt_len: u64,
    frames: &mut StackFrameAllocator,
) -> Result<HigherHalfPlan, TransitionError> {
    let map = boot.direct_map;
    let mut space = AddressSpace::new(map, frames)?;

    for section in &boot.kernel.sections {
        let mut virt = section.start.align_down(PAGE_SIZE);
        while virt < section.end {
            space
                .map_page(virt, boot.kernel.phys_of(virt), section.kind.flags(), frames)?
                .ignore();
            virt += PAGE_SIZE;
        }
        debug!(
            "mapped {:?} {:#x}..{:#x}",
            section.kind,
            section.start.as_u64(),
            section.end.as_u64()
        );
    }

    let mut direct_pages = 0;
    for region in boot.usable_regions() {
        let start = region.base.align_down(PAGE_SIZE);
        let end = region.end().align_up(PAGE_SIZE);
        space.map_range(map.virt(start), start, end - start, DIRECT_MAP_FLAGS, frames)?;
        direct_pages += (end - start) / PAGE_SIZE;
    }
    debug!("direct map covers {} pages at offset {:#x}", direct_pages, map.offset());

    if let Some(fb) = boot.framebuffer {
        let start = fb.phys.align_down(PAGE_SIZE);
        let end = (fb.phys + fb.size()).align_up(PAGE_SIZE);
        space.map_range(map.virt(start), start, end - start, FRAMEBUFFER_FLAGS, frames)?;
    }

    if let Some(mmio) = boot.lapic_mmio {
        let page = mmio.align_down(PAGE_SIZE);
        space.map_page(map.virt(page), page, MMIO_FLAGS, frames)?.ignore();
    }

    // The page at KERNEL_STACK_BASE stays unmapped as a guard.
    let stack_bottom = VirtAddr::new(KERNEL_STACK_BASE + PAGE_SIZE);
    for offset in (0..KERNEL_STACK_SIZE).step_by(PAGE_SIZE as usize) {
        let frame = frames.allocate_page()?;
        space
            .map_page(stack_bottom + offset, frame.start_address(), DIRECT_MAP_FLAGS, frames)?
            .ignore();
    }
    let stack_top = stack_bottom + KERNEL_STACK_SIZE;

    let idt_alias = alias_interrupt_table(&mut space, active, idt, idt_len, frames)?;

    info!(
        "kernel address space ready: root {:#x}, stack top {:#x}, {} pages free",
        space.root().start_address().as_u64(),
        stack_top.as_u64(),
        frames.free_pages()
    );

    Ok(HigherHalfPlan {
        space,
        stack_top,
        idt_alias,
    })
}

fn alias_interrupt_table(
    space: &mut AddressSpace,
    active: &AddressSpace,
    idt: VirtAddr,
    idt_len: u64,
    frames: &mut StackFrameAllocator,
) -> Result<VirtAddr, TransitionError> {
    let map = space.direct_map();
    let first = idt.align_down(PAGE_SIZE);
    let last = (idt + (idt_len - 1)).align_down(PAGE_SIZE);

    let mut page = first;
    loop {
        let phys = active
            .translate(page)
            .map_err(|_| TransitionError::IdtNotMapped(idt.as_u64()))?;
        space.map_page(map.virt(phys), phys, IDT_ALIAS_FLAGS, frames)?.ignore();
        if page == last {
            break;
        }
        page += PAGE_SIZE;
    }

    let phys: PhysAddr = active
        .translate(idt)
        .map_err(|_| TransitionError::IdtNotMapped(idt.as_u64()))?;
    Ok(map.virt(phys))
}

/// Turns on no-execute support and supervisor write protection, both of
/// which the new mappings rely on.
#[cfg(target_os = "none")]
pub fn enable_protection() {
    use x86_64::registers::{
        control::{Cr0, Cr0Flags},
        model_specific::{Efer, EferFlags},
    };

    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
        Cr0::update(|flags| flags.insert(Cr0Flags::WRITE_PROTECT));
    }
}

/// Loads `root`, moves onto `stack_top` and calls `entry`. Never returns.
///
/// # Safety
/// `root` must map the currently executing code, `entry`, and the stack.
/// Nothing on the old stack may be used afterwards.
#[cfg(target_os = "none")]
pub unsafe fn enter(
    root: x86_64::structures::paging::PhysFrame,
    stack_top: VirtAddr,
    entry: extern "C" fn() -> !,
) -> ! {
    core::arch::asm!(
        "mov cr3, {root}",
        "mov rsp, {stack}",
        "xor ebp, ebp",
        "call {entry}",
        "ud2",
        root = in(reg) root.start_address().as_u64(),
        stack = in(reg) stack_top.as_u64(),
        entry = in(reg) entry as usize,
        options(noreturn),
    )
}
