use core::fmt;

use x86_64::structures::paging::PhysFrame;

use crate::{
    constants::{
        gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR},
        processes::DEFAULT_RFLAGS,
    },
    interrupts::TrapFrame,
};

/// Everything needed to resume a task: general-purpose registers, the
/// interrupt return state and the page-table root.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub cr3: u64,
}

impl CpuContext {
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            cr3: 0,
        }
    }

    /// Context that starts executing `entry` on a fresh stack with interrupts
    /// enabled. `rsp` sits one word below the top, as if `entry` had been
    /// called.
    pub fn for_entry(entry: u64, stack_top: u64, root: PhysFrame) -> Self {
        Self {
            rip: entry,
            rsp: stack_top - 8,
            rflags: DEFAULT_RFLAGS,
            cs: u64::from(KERNEL_CODE_SELECTOR),
            ss: u64::from(KERNEL_DATA_SELECTOR),
            cr3: root.start_address().as_u64(),
            ..Self::new()
        }
    }

    /// Captures the interrupted state from a trap frame.
    pub fn save(&mut self, frame: &TrapFrame, root: PhysFrame) {
        self.rax = frame.rax;
        self.rbx = frame.rbx;
        self.rcx = frame.rcx;
        self.rdx = frame.rdx;
        self.rsi = frame.rsi;
        self.rdi = frame.rdi;
        self.r8 = frame.r8;
        self.r9 = frame.r9;
        self.r10 = frame.r10;
        self.r11 = frame.r11;
        self.r12 = frame.r12;
        self.r13 = frame.r13;
        self.r14 = frame.r14;
        self.r15 = frame.r15;
        self.rbp = frame.rbp;
        self.rsp = frame.rsp;
        self.rip = frame.rip;
        self.rflags = frame.rflags;
        self.cs = frame.cs;
        self.ss = frame.ss;
        self.cr3 = root.start_address().as_u64();
    }

    /// Overwrites the trap frame so that `iretq` resumes this context.
    /// The vector and error code are left alone.
    pub fn restore(&self, frame: &mut TrapFrame) {
        frame.rax = self.rax;
        frame.rbx = self.rbx;
        frame.rcx = self.rcx;
        frame.rdx = self.rdx;
        frame.rsi = self.rsi;
        frame.rdi = self.rdi;
        frame.r8 = self.r8;
        frame.r9 = self.r9;
        frame.r10 = self.r10;
        frame.r11 = self.r11;
        frame.r12 = self.r12;
        frame.r13 = self.r13;
        frame.r14 = self.r14;
        frame.r15 = self.r15;
        frame.rbp = self.rbp;
        frame.rsp = self.rsp;
        frame.rip = self.rip;
        frame.rflags = self.rflags;
        frame.cs = self.cs;
        frame.ss = self.ss;
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("CpuContext");

        ds.field("rax", &format_args!("{:#016x}", self.rax))
            .field("rbx", &format_args!("{:#016x}", self.rbx))
            .field("rcx", &format_args!("{:#016x}", self.rcx))
            .field("rdx", &format_args!("{:#016x}", self.rdx))
            .field("rsi", &format_args!("{:#016x}", self.rsi))
            .field("rdi", &format_args!("{:#016x}", self.rdi))
            .field("r8", &format_args!("{:#016x}", self.r8))
            .field("r9", &format_args!("{:#016x}", self.r9))
            .field("r10", &format_args!("{:#016x}", self.r10))
            .field("r11", &format_args!("{:#016x}", self.r11))
            .field("r12", &format_args!("{:#016x}", self.r12))
            .field("r13", &format_args!("{:#016x}", self.r13))
            .field("r14", &format_args!("{:#016x}", self.r14))
            .field("r15", &format_args!("{:#016x}", self.r15))
            .field("rbp", &format_args!("{:#016x}", self.rbp))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("rflags", &format_args!("{:#016x}", self.rflags))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("ss", &format_args!("{:#x}", self.ss))
            .field("cr3", &format_args!("{:#016x}", self.cr3));

        ds.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn root(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn save_then_restore_reproduces_the_frame() {
        let frame = TrapFrame {
            rax: 1,
            rbx: 2,
            r15: 15,
            rbp: 0xB0,
            rip: 0xFFFF_FFFF_8000_1234,
            rsp: 0xFFFF_FE00_0000_8000,
            rflags: 0x246,
            cs: 0x08,
            ss: 0x10,
            vector: 32,
            ..TrapFrame::default()
        };
        let mut context = CpuContext::new();
        context.save(&frame, root(0x5000));
        assert_eq!(context.cr3, 0x5000);

        let mut other = TrapFrame {
            vector: 32,
            ..TrapFrame::default()
        };
        context.restore(&mut other);
        assert_eq!(other, frame);
    }

    #[test]
    fn entry_context_starts_with_interrupts_enabled() {
        let context = CpuContext::for_entry(0x1000, 0x8000, root(0x3000));
        assert_eq!(context.rip, 0x1000);
        assert_eq!(context.rsp, 0x7FF8);
        assert_eq!(context.rflags & 0x200, 0x200);
        assert_eq!(context.cs, 0x08);
        assert_eq!(context.ss, 0x10);
        assert_eq!(context.cr3, 0x3000);
    }
}
