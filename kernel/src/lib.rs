#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod hal;
#[cfg(target_os = "none")]
pub mod init;
pub mod interrupts;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;

#[cfg(test)]
mod testing;

pub use devices::serial;

/// Sleeps between interrupts forever.
pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

/// Stops the CPU for good.
pub fn halt() -> ! {
    interrupts::idt::disable();
    loop {
        hlt();
    }
}
