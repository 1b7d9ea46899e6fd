#![cfg_attr(target_os = "none", no_std, no_main)]
#![cfg_attr(feature = "strict", deny(warnings))]

#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn kmain() -> ! {
    kestrel::init::boot()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    kestrel::serial_println!("Kernel panic: {}", info);
    kestrel::halt();
}

// The kernel only runs on bare metal; host builds exist for unit tests.
#[cfg(not(target_os = "none"))]
fn main() {}
