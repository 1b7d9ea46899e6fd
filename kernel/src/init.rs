//! Boot path: from the bootloader hand-off to the first timer tick.
//!
//! Runs on the bootloader's page tables until [`boot`] has built the kernel
//! address space, then continues in [`higher_half_main`] on the kernel stack.

use core::{
    hint::spin_loop,
    mem::size_of,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use limine::{
    memory_map::EntryType,
    request::{
        FramebufferRequest, HhdmRequest, KernelAddressRequest, MemoryMapRequest,
        RequestsEndMarker, RequestsStartMarker,
    },
    BaseRevision,
};
use log::{error, info, warn};
use spin::{Mutex, Once};
use x86_64::{
    instructions::hlt,
    structures::{idt::InterruptDescriptorTable, paging::PageTableFlags},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::{
        memory::{MAX_MEMORY_REGIONS, PAGE_SIZE},
        processes::DEFAULT_STACK_SIZE,
        x2apic::CPU_FREQUENCY,
    },
    halt,
    hal::{Hal, X86Hal},
    idle_loop,
    interrupts::{
        gdt, idt,
        idt::IDT_LIMIT,
        stubs,
        x2apic::{mask_legacy_pic, LocalApic},
        TrapAction, TrapFrame,
    },
    kernel::Kernel,
    logging,
    memory::{
        higher_half::{build_kernel_space, enable_protection, enter},
        layout::{
            BootInfo, FramebufferInfo, KernelImage, KernelSection, MemoryRegion, RegionKind,
            SectionKind,
        },
        AddressSpace, DirectMap, StackFrameAllocator,
    },
    processes::{TaskEntry, TaskId, TaskState},
    serial_println,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = stubs::build_interrupt_table();
}

fn idt_base() -> VirtAddr {
    VirtAddr::from_ptr(&*IDT as *const InterruptDescriptorTable)
}

/// Kernel state shared by thread code and the trap path. Thread code only
/// locks it with interrupts disabled.
pub static KERNEL: Mutex<Option<Kernel<X86Hal>>> = Mutex::new(None);

static IDT_ALIAS: AtomicU64 = AtomicU64::new(0);
/// Id of the demo task woken by the counters; 0 until it is spawned.
static WAITER: AtomicU32 = AtomicU32::new(0);
static FRAMEBUFFER: Once<FramebufferInfo> = Once::new();

/// Entered from `kmain` on the bootloader's stack and page tables.
pub fn boot() -> ! {
    assert!(BASE_REVISION.is_supported());
    logging::init();
    info!("Booting kestrel...");

    gdt::init();
    let mut hal = X86Hal::new();
    unsafe { hal.load_interrupt_table(idt_base(), IDT_LIMIT) };

    let mut boot = collect_boot_info();
    let map = boot.direct_map;
    info!("direct map offset {:#x}, {} memory regions", map.offset(), boot.regions.len());

    let apic = match LocalApic::new(map) {
        Ok(apic) => apic,
        Err(e) => {
            error!("{}", e);
            halt();
        }
    };
    boot.lapic_mmio = apic.mmio_window();
    info!("local APIC in {:?} mode", apic.mode());

    let mut frames = unsafe { StackFrameAllocator::from_memory_map(&boot.regions, map) };
    info!("{} free pages ({} KiB)", frames.free_pages(), frames.free_pages() * PAGE_SIZE / 1024);

    let active = unsafe { AddressSpace::from_root(hal.read_root(), map) };
    let idt_len = size_of::<InterruptDescriptorTable>() as u64;
    let plan = match build_kernel_space(&boot, &active, idt_base(), idt_len, &mut frames) {
        Ok(plan) => plan,
        Err(e) => {
            error!("cannot build kernel address space: {}", e);
            halt();
        }
    };

    if let Some(framebuffer) = boot.framebuffer {
        FRAMEBUFFER.call_once(|| framebuffer);
    }
    IDT_ALIAS.store(plan.idt_alias.as_u64(), Ordering::SeqCst);
    hal.attach_apic(apic);

    let root = plan.space.root();
    let stack_top = plan.stack_top;
    *KERNEL.lock() = Some(Kernel::new(frames, plan.space, hal));

    enable_protection();
    info!("switching to kernel page tables at {:#x}", root.start_address().as_u64());
    unsafe { enter(root, stack_top, higher_half_main) }
}

extern "C" fn higher_half_main() -> ! {
    let alias = VirtAddr::new(IDT_ALIAS.load(Ordering::SeqCst));

    with_kernel(|kernel| {
        unsafe { kernel.load_interrupt_table(alias) };
        info!("running on kernel page tables, IDT at {:#x}", alias.as_u64());

        check_direct_map(kernel);
        paint_framebuffer(kernel.address_space().direct_map());

        if let Err(e) = kernel.install_default_handlers() {
            error!("cannot install trap handlers: {}", e);
            halt();
        }

        mask_legacy_pic();
        let count = match kernel.hal_mut().apic_mut() {
            Some(apic) => {
                apic.enable();
                info!("local APIC {} enabled", unsafe { apic.id() });
                apic.timer_count_for(CPU_FREQUENCY)
            }
            None => {
                error!("no local APIC attached");
                halt();
            }
        };

        match kernel.spawn("waiter", waiter_task, DEFAULT_STACK_SIZE) {
            Ok(id) => WAITER.store(id.0, Ordering::SeqCst),
            Err(e) => warn!("cannot spawn waiter: {}", e),
        }
        for (name, entry) in [
            ("counter-a", counter_task as TaskEntry),
            ("counter-b", counter_task),
            ("short-lived", short_lived_task),
        ] {
            if let Err(e) = kernel.spawn(name, entry, DEFAULT_STACK_SIZE) {
                warn!("cannot spawn {}: {}", name, e);
            }
        }

        if let Some(apic) = kernel.hal_mut().apic_mut() {
            apic.start_periodic_timer(count);
        }
        info!("timer running at {} Hz, initial count {}", CPU_FREQUENCY, count);
    });

    idt::enable();
    idle_loop()
}

/// Entry point for every trap stub, with `frame` on the interrupted stack.
#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let action = match KERNEL.try_lock() {
        Some(mut guard) => match guard.as_mut() {
            Some(kernel) => kernel.handle_trap(frame),
            None => {
                serial_println!("trap {} before the kernel is up\n{:#?}", frame.vector, frame);
                TrapAction::Halt
            }
        },
        // Thread code holds the lock only with interrupts off, so this is a
        // fault inside kernel code.
        None => {
            serial_println!("trap {} with kernel state locked\n{:#?}", frame.vector, frame);
            TrapAction::Halt
        }
    };

    if action == TrapAction::Halt {
        serial_println!("halting at rip {:#x}", frame.rip);
        halt();
    }
}

/// Runs `f` on the kernel state with interrupts disabled.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<X86Hal>) -> R) -> R {
    idt::without_interrupts(|| {
        let mut guard = KERNEL.lock();
        match guard.as_mut() {
            Some(kernel) => f(kernel),
            None => panic!("kernel state used before boot"),
        }
    })
}

/// Terminates the calling task and waits for the next tick to switch away.
pub fn exit() -> ! {
    with_kernel(|kernel| kernel.exit_current());
    idle_loop()
}

fn current_task() -> Option<TaskId> {
    with_kernel(|kernel| kernel.scheduler().current())
}

extern "C" fn counter_task() -> ! {
    let id = current_task();
    let mut count: u64 = 0;
    loop {
        count += 1;
        if count % 20_000_000 == 0 {
            info!("task {:?} at {}", id.map(|id| id.0), count);
            wake_waiter();
        }
        spin_loop();
    }
}

extern "C" fn short_lived_task() -> ! {
    let id = current_task();
    info!("task {:?} started", id.map(|id| id.0));
    for _ in 0..50_000_000 {
        spin_loop();
    }
    info!("task {:?} exiting", id.map(|id| id.0));
    exit()
}

extern "C" fn waiter_task() -> ! {
    let mut wakeups: u64 = 0;
    loop {
        block_current();
        wakeups += 1;
        info!("waiter woken ({} times)", wakeups);
    }
}

fn wake_waiter() {
    let id = WAITER.load(Ordering::SeqCst);
    if id != 0 {
        with_kernel(|kernel| kernel.wake(TaskId(id)));
    }
}

/// Parks the calling task until another task wakes it. The task keeps its
/// slot until the next tick switches away.
fn block_current() {
    let Some(id) = current_task() else {
        return;
    };
    with_kernel(|kernel| kernel.block(id));
    while with_kernel(|kernel| {
        kernel
            .scheduler()
            .task(id)
            .is_some_and(|task| task.state == TaskState::Waiting)
    }) {
        hlt();
    }
}

/// Maps a scratch page, writes a sentinel through it and reads it back
/// through the direct map. The page is then made read-only and unmapped.
fn check_direct_map(kernel: &mut Kernel<X86Hal>) {
    const SENTINEL: u64 = 0x6b65_7374_7265_6c21;
    const SCRATCH: u64 = 0x40_0000;

    let frame = kernel.allocate_page();
    let virt = VirtAddr::new(SCRATCH);
    kernel.map_page(
        virt,
        frame.start_address(),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
    );

    let alias = kernel.address_space().direct_map().ptr::<u64>(frame.start_address());
    let read = unsafe {
        virt.as_mut_ptr::<u64>().write_volatile(SENTINEL);
        alias.read_volatile()
    };
    if read == SENTINEL {
        info!("direct map verified at {:#x}", frame.start_address().as_u64());
    } else {
        error!("direct map readback {:#x} != {:#x}", read, SENTINEL);
    }

    if let Err(e) = kernel.update_flags(virt, PageTableFlags::NO_EXECUTE) {
        warn!("scratch page lost: {}", e);
    }
    match kernel.unmap_page(virt) {
        Ok(frame) => unsafe { kernel.free_page(frame.start_address()) },
        Err(e) => warn!("scratch page lost: {}", e),
    }
}

/// Draws a short diagonal through the remapped framebuffer.
fn paint_framebuffer(map: DirectMap) {
    let Some(framebuffer) = FRAMEBUFFER.get() else {
        return;
    };
    let bytes_per_pixel = u64::from(framebuffer.bpp / 8);
    for i in 0..framebuffer.width.min(framebuffer.height).min(100) {
        let offset = i * framebuffer.pitch + i * bytes_per_pixel;
        unsafe {
            map.ptr::<u32>(framebuffer.phys + offset).write_volatile(0xFFFF_FFFF);
        }
    }
}

/// Copies the bootloader responses into kernel-owned storage.
fn collect_boot_info() -> BootInfo {
    let offset = HHDM_REQUEST.get_response().expect("HHDM request failed").offset();
    let direct_map = DirectMap::new(offset);

    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let mut regions = ArrayVec::<MemoryRegion, MAX_MEMORY_REGIONS>::new();
    for entry in memory_map.entries() {
        let region = MemoryRegion::new(entry.base, entry.length, region_kind(entry.entry_type));
        if regions.try_push(region).is_err() {
            warn!("memory map truncated at {} regions", MAX_MEMORY_REGIONS);
            break;
        }
    }

    let kernel_address = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Kernel Address request failed");
    let kernel = KernelImage {
        phys_base: PhysAddr::new(kernel_address.physical_base()),
        virt_base: VirtAddr::new(kernel_address.virtual_base()),
        sections: unsafe {
            [
                section(SectionKind::Text, &raw const __text_start, &raw const __text_end),
                section(SectionKind::Rodata, &raw const __rodata_start, &raw const __rodata_end),
                section(SectionKind::Data, &raw const __data_start, &raw const __data_end),
            ]
        },
    };

    let framebuffer = FRAMEBUFFER_REQUEST
        .get_response()
        .and_then(|response| response.framebuffers().next())
        .map(|fb| FramebufferInfo {
            phys: direct_map.phys(VirtAddr::from_ptr(fb.addr())),
            pitch: fb.pitch(),
            width: fb.width(),
            height: fb.height(),
            bpp: fb.bpp(),
        });

    BootInfo {
        direct_map,
        regions,
        kernel,
        framebuffer,
        lapic_mmio: None,
    }
}

fn section(kind: SectionKind, start: *const u8, end: *const u8) -> KernelSection {
    KernelSection {
        kind,
        start: VirtAddr::from_ptr(start),
        end: VirtAddr::from_ptr(end),
    }
}

fn region_kind(entry_type: EntryType) -> RegionKind {
    if entry_type == EntryType::USABLE {
        RegionKind::Usable
    } else if entry_type == EntryType::ACPI_RECLAIMABLE {
        RegionKind::AcpiReclaimable
    } else if entry_type == EntryType::ACPI_NVS {
        RegionKind::AcpiNvs
    } else if entry_type == EntryType::BAD_MEMORY {
        RegionKind::BadMemory
    } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
        RegionKind::BootloaderReclaimable
    } else if entry_type == EntryType::KERNEL_AND_MODULES {
        RegionKind::KernelAndModules
    } else if entry_type == EntryType::FRAMEBUFFER {
        RegionKind::Framebuffer
    } else {
        RegionKind::Reserved
    }
}
