//! Descriptor tables, trap dispatch and the local APIC.

pub mod dispatch;
pub mod exceptions;
pub mod gdt;
pub mod idt;
#[cfg(target_os = "none")]
pub mod stubs;
pub mod x2apic;

pub use dispatch::{Dispatcher, RegisterError, TrapAction, TrapFrame, TrapHandler};
