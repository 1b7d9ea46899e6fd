//! Physical and virtual memory layout.

pub const PAGE_SIZE: u64 = 4096;

/// Entries per page table at every paging level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Upper bound on memory-map entries copied out of the bootloader response.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// Lowest address of the boot kernel stack window. The first page stays
/// unmapped as a guard.
pub const KERNEL_STACK_BASE: u64 = 0xFFFF_FE80_0000_0000;
pub const KERNEL_STACK_SIZE: u64 = 16 * PAGE_SIZE;

/// Task stacks live in fixed windows, one per task slot, each led by an
/// unmapped guard page.
pub const TASK_STACK_REGION: u64 = 0xFFFF_FE00_0000_0000;
pub const MAX_TASK_STACK_SIZE: u64 = 64 * PAGE_SIZE;
pub const TASK_STACK_STRIDE: u64 = MAX_TASK_STACK_SIZE + PAGE_SIZE;
