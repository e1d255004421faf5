//! Control-register and TLB helpers

use crate::mm::PhysicalAddress;

/// Read the active page-table root from CR3.
pub fn read_cr3() -> PhysicalAddress {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::Cr3;
        let (frame, _flags) = Cr3::read();
        PhysicalAddress::new(frame.start_address().as_u64())
    }
    #[cfg(not(target_os = "none"))]
    {
        PhysicalAddress::new(0)
    }
}

/// Load a new page-table root into CR3.
pub fn write_cr3(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    {
        use x86_64::{
            registers::control::{Cr3, Cr3Flags},
            structures::paging::PhysFrame,
            PhysAddr,
        };
        let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
        // SAFETY: the caller provides a root built by the page-table
        // manager; all kernel mappings are aliased into every root, so the
        // executing code and stack stay mapped across the switch.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

/// The faulting address of the most recent page fault (CR2).
pub fn read_cr2() -> u64 {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::control::Cr2::read_raw()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Snapshot of the control registers for the crash report.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

pub fn snapshot_control_registers() -> ControlRegisters {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::{Cr0, Cr4};
        ControlRegisters {
            cr0: Cr0::read_raw(),
            cr2: read_cr2(),
            cr3: read_cr3().as_u64(),
            cr4: Cr4::read_raw(),
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        ControlRegisters::default()
    }
}
