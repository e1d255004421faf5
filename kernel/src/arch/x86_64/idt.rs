//! Interrupt descriptor table
//!
//! All 256 vectors point at the naked stubs from the trap module, so every
//! entry path materializes the same `TrapFrame`. Exceptions 0-31 route to
//! the crash handler, remapped IRQs to the IRQ layer, and the `int 0x80`
//! gate (DPL 3) to the syscall dispatcher.

use lazy_static::lazy_static;
use x86_64::{structures::idt::InterruptDescriptorTable, PrivilegeLevel, VirtAddr};

use super::trap::{stub_for, SYSCALL_VECTOR};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        macro_rules! wire {
            ($entry:expr, $vector:expr) => {
                if let Some(addr) = stub_for($vector) {
                    // SAFETY: the address is a trap stub that builds a full
                    // frame and returns via iretq.
                    unsafe { $entry.set_handler_addr(VirtAddr::new(addr)) };
                }
            };
        }

        wire!(idt.divide_error, 0);
        wire!(idt.debug, 1);
        wire!(idt.non_maskable_interrupt, 2);
        wire!(idt.breakpoint, 3);
        wire!(idt.overflow, 4);
        wire!(idt.bound_range_exceeded, 5);
        wire!(idt.invalid_opcode, 6);
        wire!(idt.device_not_available, 7);
        if let Some(addr) = stub_for(8) {
            // SAFETY: double faults run on their own IST stack so a
            // corrupted kernel stack cannot cascade into a triple fault.
            unsafe {
                idt.double_fault
                    .set_handler_addr(VirtAddr::new(addr))
                    .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            }
        }
        wire!(idt.invalid_tss, 10);
        wire!(idt.segment_not_present, 11);
        wire!(idt.stack_segment_fault, 12);
        wire!(idt.general_protection_fault, 13);
        wire!(idt.page_fault, 14);
        wire!(idt.x87_floating_point, 16);
        wire!(idt.alignment_check, 17);
        wire!(idt.machine_check, 18);
        wire!(idt.simd_floating_point, 19);
        wire!(idt.virtualization, 20);
        wire!(idt.cp_protection_exception, 21);

        // Remapped PIC lines.
        for vector in 32u8..=47 {
            wire!(idt[vector], vector);
        }

        // Native syscall gate, reachable from ring 3.
        if let Some(addr) = stub_for(SYSCALL_VECTOR) {
            // SAFETY: syscall stub, same contract as above.
            unsafe {
                idt[SYSCALL_VECTOR]
                    .set_handler_addr(VirtAddr::new(addr))
                    .set_privilege_level(PrivilegeLevel::Ring3);
            }
        }

        idt
    };
}

pub fn init() {
    #[cfg(target_os = "none")]
    IDT.load();
}
