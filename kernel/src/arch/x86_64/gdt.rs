//! Segment descriptors and the task state segment
//!
//! The selector layout is a build-time contract: the syscall entry stubs
//! embed the user selectors as immediates, so the values are fixed as
//! constants here and asserted when the tables are built.
//!
//! - 0x08 kernel code, 0x10 kernel data
//! - 0x1B user data (RPL 3), 0x23 user code (RPL 3)
//! - 0x28 TSS (two slots)
//!
//! User data sits directly below user code because SYSRET derives
//! SS = STAR[63:48]+8 and CS = STAR[63:48]+16.
//!
//! The GDT and TSS are carved from the kernel heap at first use (bring-up
//! arms the heap before the descriptor tables load). RSP0 belongs to the
//! context-switch path: [`super::context::apply`] is the only writer after
//! bring-up and publishes each thread's kernel stack top through
//! [`publish_rsp0`] together with the per-CPU syscall stack slot.

extern crate alloc;

use alloc::{boxed::Box, vec};

use spin::Once;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot reserved for the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Selector values the entry stubs hard-code.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x1B;
pub const USER_CODE_SELECTOR: u16 = 0x23;

/// Double-fault stack size in 16-byte words (32 KiB).
const FAULT_STACK_WORDS: usize = 2048;

/// Selectors handed to the rest of the kernel.
pub struct SegmentSelectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

struct CpuTables {
    gdt: GlobalDescriptorTable,
    selectors: SegmentSelectors,
    /// The leaked TSS; RSP0 is rewritten through this on every context
    /// switch while the descriptor keeps pointing at the same frame.
    tss: *mut TaskStateSegment,
}

// SAFETY: the raw TSS pointer targets a leaked, never-freed allocation.
// RSP0 has a single writer (the context switch, interrupts disabled); the
// CPU reads it only while delivering an interrupt.
unsafe impl Send for CpuTables {}
unsafe impl Sync for CpuTables {}

static CPU_TABLES: Once<CpuTables> = Once::new();

/// A 16-byte-aligned stack carved from the heap; returns its top.
fn leak_stack(words: usize) -> VirtAddr {
    let stack: &'static mut [u128] = vec![0u128; words].leak();
    VirtAddr::from_ptr(stack.as_ptr()) + (stack.len() * 16) as u64
}

fn tables() -> &'static CpuTables {
    CPU_TABLES.call_once(|| {
        let tss = Box::leak(Box::new(TaskStateSegment::new()));
        // Double faults get their own stack so a corrupted kernel stack
        // cannot cascade into a triple fault. RSP0 stays empty until the
        // first context switch publishes a thread stack.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            leak_stack(FAULT_STACK_WORDS);
        let tss: &'static TaskStateSegment = tss;
        let tss_ptr = tss as *const TaskStateSegment as *mut TaskStateSegment;

        let mut gdt = GlobalDescriptorTable::new();
        let selectors = SegmentSelectors {
            kernel_code: gdt.append(Descriptor::kernel_code_segment()),
            kernel_data: gdt.append(Descriptor::kernel_data_segment()),
            user_data: gdt.append(Descriptor::user_data_segment()),
            user_code: gdt.append(Descriptor::user_code_segment()),
            tss: gdt.append(Descriptor::tss_segment(tss)),
        };

        // The entry stubs embed these values; a layout change here has to
        // fail loudly, not corrupt ring transitions.
        assert_eq!(selectors.kernel_code.0, KERNEL_CODE_SELECTOR);
        assert_eq!(selectors.kernel_data.0, KERNEL_DATA_SELECTOR);
        assert_eq!(selectors.user_data.0, USER_DATA_SELECTOR);
        assert_eq!(selectors.user_code.0, USER_CODE_SELECTOR);

        CpuTables {
            gdt,
            selectors,
            tss: tss_ptr,
        }
    })
}

/// Build the tables and switch the CPU onto them.
pub fn init() {
    let tables = tables();
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::{
            segmentation::{Segment, CS, DS, ES, SS},
            tables::load_tss,
        };
        tables.gdt.load();
        // SAFETY: the selectors index the table loaded on the previous
        // line.
        unsafe {
            CS::set_reg(tables.selectors.kernel_code);
            SS::set_reg(tables.selectors.kernel_data);
            DS::set_reg(tables.selectors.kernel_data);
            ES::set_reg(tables.selectors.kernel_data);
            load_tss(tables.selectors.tss);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = tables;
    }
}

pub fn selectors() -> &'static SegmentSelectors {
    &tables().selectors
}

/// Publish a thread's kernel stack top as RSP0, the stack the hardware
/// loads on every ring 3 -> ring 0 transition. Stores exactly the value
/// given. Only [`super::context::apply`] calls this, interrupts disabled.
pub(super) fn publish_rsp0(stack_top: u64) {
    let tss = tables().tss;
    // SAFETY: see the Sync rationale on CpuTables; single writer, and the
    // CPU samples RSP0 only at interrupt delivery.
    unsafe { (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top) };
}

/// Current RSP0, for the context-switch path's own checks.
pub(super) fn rsp0() -> u64 {
    // SAFETY: plain load of the slot written by publish_rsp0.
    unsafe { (*tables().tss).privilege_stack_table[0].as_u64() }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn selector_layout_matches_entry_stubs() {
        let s = selectors();
        assert_eq!(s.kernel_code.0, KERNEL_CODE_SELECTOR);
        assert_eq!(s.kernel_data.0, KERNEL_DATA_SELECTOR);
        assert_eq!(s.user_data.0, USER_DATA_SELECTOR);
        assert_eq!(s.user_code.0, USER_CODE_SELECTOR);
        // Ring 3 selectors carry their RPL; SYSRET needs data+8 == code.
        assert_eq!(s.user_code.0 & 3, 3);
        assert_eq!(s.user_data.0 & 3, 3);
        assert_eq!(s.user_data.0 + 8, s.user_code.0);
    }

    #[test]
    fn fault_stack_is_carved_and_aligned() {
        // SAFETY: reading the leaked TSS built by tables().
        let ist = unsafe {
            (*tables().tss).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize]
        };
        assert_ne!(ist.as_u64(), 0, "double-fault stack exists");
        assert_eq!(ist.as_u64() % 16, 0, "ABI alignment");
    }
}
