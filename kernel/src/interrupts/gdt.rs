//! Flat kernel segments plus a TSS carrying the double-fault stack.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::constants::gdt::{
    DOUBLE_FAULT_IST_INDEX, IST_STACK_SIZE, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR,
};

// Null + kernel code/data + TSS (two slots in long mode)
const GDT_ENTRIES: usize = 5;

#[repr(align(16))]
struct IstStack([u8; IST_STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        static mut DOUBLE_FAULT_STACK: IstStack = IstStack([0; IST_STACK_SIZE]);
        let mut tss = TaskStateSegment::new();

        let stack_start = VirtAddr::from_ptr(unsafe { &raw const DOUBLE_FAULT_STACK });
        let stack_end = stack_start + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_end;
        tss
    };

    static ref GDT: (GlobalDescriptorTable<GDT_ENTRIES>, Selectors) = {
        let mut gdt = GlobalDescriptorTable::<GDT_ENTRIES>::empty();

        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));

        (gdt, Selectors {
            code_selector,
            data_selector,
            tss_selector,
        })
    };
}

#[derive(Debug)]
struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Loads the GDT and TSS and reloads every segment register.
pub fn init() {
    GDT.0.load();

    debug_assert_eq!(GDT.1.code_selector.0, KERNEL_CODE_SELECTOR);
    debug_assert_eq!(GDT.1.data_selector.0, KERNEL_DATA_SELECTOR);

    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);

        load_tss(GDT.1.tss_selector);
    }
}
