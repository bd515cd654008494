//! GDT and TSS setup.
//!
//! No user-mode segments: this kernel has no userspace (see the
//! Non-goals in `SPEC_FULL.md`), so the teacher's SYSRET-ordered
//! user-code/user-data selectors are dropped; everything else is kept.

use x86_64::instructions::segmentation::{Segment, CS, DS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

#[repr(align(16))]
struct AlignedStack([u8; 4096 * 5]);

static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; 4096 * 5]);
static mut PRIVILEGE_STACK: AlignedStack = AlignedStack([0; 4096 * 5]);

lazy_static::lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            // SAFETY: `DOUBLE_FAULT_STACK` is a private static used only
            // here to seed the IST entry; nothing else references it.
            let stack_start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(DOUBLE_FAULT_STACK) });
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64
        };
        tss.privilege_stack_table[0] = {
            // SAFETY: see above, for `PRIVILEGE_STACK`.
            let stack_start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(PRIVILEGE_STACK) });
            stack_start + PRIVILEGE_STACK_SIZE as u64
        };
        tss
    };
}

const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;
const PRIVILEGE_STACK_SIZE: usize = 4096 * 5;

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static::lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (gdt, Selectors { kernel_code, kernel_data, tss })
    };
}

pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors loaded here were just installed into the
    // live GDT above and describe flat kernel code/data segments and
    // this CPU's TSS.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Updates the TSS's RSP0 (used on every privilege-level-raising
/// interrupt) to `stack_top`. Called by the process scheduler before a
/// context switch so a subsequent interrupt lands on the new process's
/// kernel stack.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    // SAFETY: the TSS is only ever touched here and during `init`'s
    // one-time load; both run with interrupts disabled and never
    // interleave on the same CPU.
    unsafe {
        let tss_mut = (&*TSS as *const TaskStateSegment).cast_mut();
        (*tss_mut).privilege_stack_table[0] = stack_top;
    }
}
