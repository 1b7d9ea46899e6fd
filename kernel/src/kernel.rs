//! The kernel context: one object owning the page allocator, the kernel
//! address space, the trap registry, the scheduler and the hardware.
//!
//! Library types report errors; this is the layer that decides which of them
//! are fatal. Running out of frames or failing to map is unrecoverable and
//! panics, malformed requests are logged and ignored.

use log::{debug, info};
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::{
        idt::{
            DIVIDE_ERROR_VECTOR, DOUBLE_FAULT_VECTOR, GENERAL_PROTECTION_VECTOR,
            PAGE_FAULT_VECTOR, TIMER_IRQ,
        },
        memory::{MAX_TASK_STACK_SIZE, PAGE_SIZE},
    },
    hal::Hal,
    interrupts::{
        exceptions, idt::IDT_LIMIT, Dispatcher, RegisterError, TrapAction, TrapFrame,
        TrapHandler,
    },
    memory::{AddressSpace, MapError, NotMapped, StackFrameAllocator},
    processes::{task::TaskStack, Scheduler, SpawnError, Task, TaskEntry, TaskId},
};

pub const STACK_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::NO_EXECUTE);

pub struct Kernel<H: Hal> {
    frames: StackFrameAllocator,
    space: AddressSpace,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    hal: H,
}

impl<H: Hal> Kernel<H> {
    pub fn new(frames: StackFrameAllocator, space: AddressSpace, hal: H) -> Self {
        Self {
            frames,
            space,
            dispatcher: Dispatcher::new(),
            scheduler: Scheduler::new(),
            hal,
        }
    }

    /// Diagnostics for the fatal exceptions and the scheduling timer tick.
    pub fn install_default_handlers(&mut self) -> Result<(), RegisterError> {
        let defaults: [(u8, TrapHandler); 4] = [
            (DIVIDE_ERROR_VECTOR, exceptions::divide_error),
            (DOUBLE_FAULT_VECTOR, exceptions::double_fault),
            (GENERAL_PROTECTION_VECTOR, exceptions::general_protection),
            (PAGE_FAULT_VECTOR, exceptions::page_fault),
        ];
        for (vector, handler) in defaults {
            self.dispatcher.register_exception_handler(vector, handler)?;
        }
        self.dispatcher.register_irq_handler(TIMER_IRQ, exceptions::timer)
    }

    /// Loads the interrupt table register with `base`.
    ///
    /// # Safety
    /// `base` must address an interrupt descriptor table mapped in the active
    /// address space.
    pub unsafe fn load_interrupt_table(&mut self, base: VirtAddr) {
        self.hal.load_interrupt_table(base, IDT_LIMIT);
    }

    pub fn allocate_page(&mut self) -> PhysFrame {
        match self.frames.allocate_page() {
            Ok(frame) => frame,
            Err(e) => panic!("allocate_page: {}", e),
        }
    }

    /// # Safety
    /// The page must be unused and unmapped.
    pub unsafe fn free_page(&mut self, addr: PhysAddr) {
        // Rejections are already logged by the allocator.
        let _ = self.frames.free_page(addr);
    }

    pub fn map_page(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) {
        match self.space.map_page(virt, phys, flags, &mut self.frames) {
            Ok(flush) => flush.flush(&mut self.hal),
            Err(MapError::Misaligned(_)) => {}
            Err(e) => panic!("map_page {:#x} -> {:#x}: {}", virt.as_u64(), phys.as_u64(), e),
        }
    }

    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysFrame, NotMapped> {
        let (frame, flush) = self.space.unmap_page(virt)?;
        flush.flush(&mut self.hal);
        Ok(frame)
    }

    pub fn translate(&self, virt: VirtAddr) -> Result<PhysAddr, NotMapped> {
        self.space.translate(virt)
    }

    pub fn update_flags(&mut self, virt: VirtAddr, flags: PageTableFlags) -> Result<(), NotMapped> {
        self.space.update_flags(virt, flags)?.flush(&mut self.hal);
        Ok(())
    }

    pub fn register_exception_handler(
        &mut self,
        vector: u8,
        handler: TrapHandler,
    ) -> Result<(), RegisterError> {
        self.dispatcher.register_exception_handler(vector, handler)
    }

    pub fn register_irq_handler(&mut self, irq: u8, handler: TrapHandler) -> Result<(), RegisterError> {
        self.dispatcher.register_irq_handler(irq, handler)
    }

    /// Creates a task running `entry` on a freshly mapped stack of at least
    /// `stack_size` bytes and appends it to the ready queue.
    pub fn spawn(
        &mut self,
        name: &str,
        entry: TaskEntry,
        stack_size: u64,
    ) -> Result<TaskId, SpawnError> {
        if stack_size == 0 || stack_size > MAX_TASK_STACK_SIZE {
            return Err(SpawnError::StackTooLarge(stack_size));
        }
        let slot = self.scheduler.vacant_slot().ok_or(SpawnError::TableFull)?;
        let id = self.scheduler.allocate_id()?;
        let stack = TaskStack::for_slot(slot, stack_size.div_ceil(PAGE_SIZE));
        self.map_stack(&stack)?;

        let task = Task::new(id, name, entry as usize as u64, stack, self.space.root());
        let id = self.scheduler.admit(slot, task)?;
        info!("spawned task {} ({}), stack top {:#x}", id, name, stack.top().as_u64());
        Ok(id)
    }

    /// Terminates the running task. Its stack is released on a later tick,
    /// once execution has left it.
    pub fn exit_current(&mut self) -> Option<TaskId> {
        let id = self.scheduler.exit_current()?;
        debug!("task {} exited", id);
        Some(id)
    }

    pub fn block(&mut self, id: TaskId) -> bool {
        self.scheduler.block(id)
    }

    pub fn wake(&mut self, id: TaskId) -> bool {
        self.scheduler.wake(id)
    }

    /// Routes one trap. Rescheduling happens before the end-of-interrupt so
    /// the next tick cannot arrive mid-switch.
    pub fn handle_trap(&mut self, frame: &mut TrapFrame) -> TrapAction {
        let dispatched = self.dispatcher.dispatch(frame);

        if dispatched.action == TrapAction::Reschedule {
            self.reap();
            self.scheduler.on_tick(frame, &mut self.hal);
        }
        if dispatched.needs_eoi {
            self.hal.end_of_interrupt();
        }
        dispatched.action
    }

    fn map_stack(&mut self, stack: &TaskStack) -> Result<(), SpawnError> {
        for (mapped, page) in stack.pages().enumerate() {
            if let Err(e) = self.map_stack_page(page) {
                self.release_pages(stack.pages().take(mapped));
                return Err(e);
            }
        }
        Ok(())
    }

    fn map_stack_page(&mut self, page: VirtAddr) -> Result<(), SpawnError> {
        let frame = self.frames.allocate_page()?;
        match self
            .space
            .map_page(page, frame.start_address(), STACK_FLAGS, &mut self.frames)
        {
            Ok(flush) => {
                flush.flush(&mut self.hal);
                Ok(())
            }
            Err(e) => {
                unsafe { self.free_page(frame.start_address()) };
                Err(e.into())
            }
        }
    }

    fn release_pages(&mut self, pages: impl Iterator<Item = VirtAddr>) {
        for page in pages {
            if let Ok(frame) = self.unmap_page(page) {
                unsafe { self.free_page(frame.start_address()) };
            }
        }
    }

    fn reap(&mut self) {
        while let Some(task) = self.scheduler.take_terminated() {
            self.release_pages(task.stack.pages());
            debug!("reaped task {} ({})", task.id, task.name);
        }
    }

    pub fn frames(&self) -> &StackFrameAllocator {
        &self.frames
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }
}
