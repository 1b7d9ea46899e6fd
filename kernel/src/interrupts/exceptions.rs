//! Default handlers: diagnostics for the fatal exceptions and the timer tick.
//!
//! None of the exceptions are recovered from; each one prints what it can
//! and asks the dispatcher to halt.

use log::error;
use x86_64::{registers::control::Cr2, structures::idt::PageFaultErrorCode};

use crate::interrupts::dispatch::{TrapAction, TrapFrame};

pub fn divide_error(frame: &TrapFrame) -> TrapAction {
    error!("EXCEPTION: DIVIDE ERROR\n{:#?}", frame);
    TrapAction::Halt
}

pub fn double_fault(frame: &TrapFrame) -> TrapAction {
    error!("EXCEPTION: DOUBLE FAULT\n{:#?}", frame);
    TrapAction::Halt
}

pub fn general_protection(frame: &TrapFrame) -> TrapAction {
    error!(
        "EXCEPTION: GENERAL PROTECTION FAULT (selector {:#x})\n{:#?}",
        frame.error_code, frame
    );
    TrapAction::Halt
}

pub fn page_fault(frame: &TrapFrame) -> TrapAction {
    let faulting_address = Cr2::read_raw();
    let error_code = PageFaultErrorCode::from_bits_truncate(frame.error_code);
    error!(
        "EXCEPTION: PAGE FAULT\nFaulting Address: {:#x}\nError Code: {:?}\n{:#?}",
        faulting_address, error_code, frame
    );
    TrapAction::Halt
}

/// Every tick is a scheduling point.
pub fn timer(_frame: &TrapFrame) -> TrapAction {
    TrapAction::Reschedule
}
