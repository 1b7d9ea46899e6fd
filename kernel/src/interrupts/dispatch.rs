//! Vector → handler registry and the policy applied to every trap.

use core::fmt;

use log::{error, warn};

use crate::constants::idt::{
    EXCEPTION_COUNT, IDT_ENTRIES, IRQ_BASE, IRQ_COUNT, SPURIOUS_VECTOR,
};

/// Register state saved by the entry stubs, lowest address first.
///
/// The stubs push the vector and an error code (a dummy one where the CPU
/// does not supply it) above the general-purpose registers, and the CPU's
/// own interrupt frame sits on top.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("vector", &self.vector)
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("rflags", &format_args!("{:#x}", self.rflags))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("ss", &format_args!("{:#x}", self.ss))
            .field("rax", &format_args!("{:#016x}", self.rax))
            .field("rbx", &format_args!("{:#016x}", self.rbx))
            .field("rcx", &format_args!("{:#016x}", self.rcx))
            .field("rdx", &format_args!("{:#016x}", self.rdx))
            .field("rsi", &format_args!("{:#016x}", self.rsi))
            .field("rdi", &format_args!("{:#016x}", self.rdi))
            .field("rbp", &format_args!("{:#016x}", self.rbp))
            .finish_non_exhaustive()
    }
}

/// What a handler wants done once it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapAction {
    /// Return to the interrupted code.
    Resume,
    /// Run the scheduler before returning.
    Reschedule,
    /// Unrecoverable; stop the CPU.
    Halt,
}

pub type TrapHandler = fn(&TrapFrame) -> TrapAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("vector {0} is not a CPU exception")]
    NotAnException(u8),
    #[error("IRQ {0} is out of range")]
    NoSuchIrq(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorKind {
    Exception,
    Irq(u8),
    Spurious,
    Unassigned,
}

impl VectorKind {
    pub fn of(vector: u8) -> Self {
        match vector {
            v if v < EXCEPTION_COUNT => VectorKind::Exception,
            v if (IRQ_BASE..IRQ_BASE + IRQ_COUNT).contains(&v) => VectorKind::Irq(v - IRQ_BASE),
            SPURIOUS_VECTOR => VectorKind::Spurious,
            _ => VectorKind::Unassigned,
        }
    }
}

/// Result of routing one trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatched {
    pub action: TrapAction,
    /// Device IRQs need an end-of-interrupt once all work is done.
    pub needs_eoi: bool,
}

pub struct Dispatcher {
    handlers: [Option<TrapHandler>; IDT_ENTRIES],
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            handlers: [None; IDT_ENTRIES],
        }
    }

    /// Installs `handler` for exception `vector`, replacing any previous one.
    pub fn register_exception_handler(
        &mut self,
        vector: u8,
        handler: TrapHandler,
    ) -> Result<(), RegisterError> {
        if vector >= EXCEPTION_COUNT {
            return Err(RegisterError::NotAnException(vector));
        }
        self.handlers[usize::from(vector)] = Some(handler);
        Ok(())
    }

    /// Installs `handler` for legacy IRQ line `irq`, replacing any previous one.
    pub fn register_irq_handler(&mut self, irq: u8, handler: TrapHandler) -> Result<(), RegisterError> {
        if irq >= IRQ_COUNT {
            return Err(RegisterError::NoSuchIrq(irq));
        }
        self.handlers[usize::from(IRQ_BASE + irq)] = Some(handler);
        Ok(())
    }

    pub fn handler(&self, vector: u8) -> Option<TrapHandler> {
        self.handlers[usize::from(vector)]
    }

    /// Runs the registered handler for `frame.vector` and applies the
    /// fallback policy where there is none.
    pub fn dispatch(&self, frame: &TrapFrame) -> Dispatched {
        let vector = frame.vector as u8;
        let kind = VectorKind::of(vector);

        let action = match (self.handler(vector), kind) {
            (_, VectorKind::Spurious) => TrapAction::Resume,
            (Some(handler), _) => handler(frame),
            (None, VectorKind::Exception) => {
                error!("unhandled exception {}\n{:#?}", vector, frame);
                TrapAction::Halt
            }
            (None, VectorKind::Irq(irq)) => {
                warn!("ignoring unexpected IRQ {}", irq);
                TrapAction::Resume
            }
            (None, VectorKind::Unassigned) => {
                error!("trap on unassigned vector {:#x}", vector);
                TrapAction::Halt
            }
        };

        Dispatched {
            action,
            needs_eoi: matches!(kind, VectorKind::Irq(_)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    fn frame(vector: u8) -> TrapFrame {
        TrapFrame {
            vector: u64::from(vector),
            ..TrapFrame::default()
        }
    }

    fn resume(_: &TrapFrame) -> TrapAction {
        TrapAction::Resume
    }

    fn reschedule(_: &TrapFrame) -> TrapAction {
        TrapAction::Reschedule
    }

    #[test]
    fn frame_matches_stub_push_order() {
        assert_eq!(size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 21 * 8);
    }

    #[test]
    fn vector_classification() {
        assert_eq!(VectorKind::of(0), VectorKind::Exception);
        assert_eq!(VectorKind::of(31), VectorKind::Exception);
        assert_eq!(VectorKind::of(32), VectorKind::Irq(0));
        assert_eq!(VectorKind::of(47), VectorKind::Irq(15));
        assert_eq!(VectorKind::of(48), VectorKind::Unassigned);
        assert_eq!(VectorKind::of(0xFF), VectorKind::Spurious);
    }

    #[test]
    fn registration_bounds() {
        let mut dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.register_exception_handler(31, resume), Ok(()));
        assert_eq!(
            dispatcher.register_exception_handler(32, resume),
            Err(RegisterError::NotAnException(32))
        );
        assert_eq!(dispatcher.register_irq_handler(15, resume), Ok(()));
        assert_eq!(
            dispatcher.register_irq_handler(16, resume),
            Err(RegisterError::NoSuchIrq(16))
        );
        assert!(dispatcher.handler(47).is_some());
    }

    #[test]
    fn last_registration_wins() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_irq_handler(0, resume).unwrap();
        dispatcher.register_irq_handler(0, reschedule).unwrap();
        assert_eq!(dispatcher.dispatch(&frame(32)).action, TrapAction::Reschedule);
    }

    #[test]
    fn unhandled_exception_halts_without_eoi() {
        let dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.dispatch(&frame(14)),
            Dispatched {
                action: TrapAction::Halt,
                needs_eoi: false
            }
        );
    }

    #[test]
    fn unhandled_irq_is_ignored_but_acknowledged() {
        let dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.dispatch(&frame(33)),
            Dispatched {
                action: TrapAction::Resume,
                needs_eoi: true
            }
        );
    }

    #[test]
    fn spurious_vector_never_gets_eoi() {
        let dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.dispatch(&frame(0xFF)),
            Dispatched {
                action: TrapAction::Resume,
                needs_eoi: false
            }
        );
    }

    #[test]
    fn handler_sees_the_frame() {
        fn check(frame: &TrapFrame) -> TrapAction {
            if frame.error_code == 0b10 && frame.rip == 0xDEAD {
                TrapAction::Resume
            } else {
                TrapAction::Halt
            }
        }
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_exception_handler(13, check).unwrap();
        let trap = TrapFrame {
            vector: 13,
            error_code: 0b10,
            rip: 0xDEAD,
            ..TrapFrame::default()
        };
        assert_eq!(dispatcher.dispatch(&trap).action, TrapAction::Resume);
    }
}
