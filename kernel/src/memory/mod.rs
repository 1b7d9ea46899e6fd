//! Physical page allocation, page tables and the higher-half layout.

pub mod direct_map;
pub mod frame_allocator;
pub mod higher_half;
pub mod layout;
pub mod paging;

pub use direct_map::DirectMap;
pub use frame_allocator::{FrameError, StackFrameAllocator};
pub use paging::{AddressSpace, MapError, NotMapped, PageFlush};
