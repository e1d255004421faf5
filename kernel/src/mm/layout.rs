//! Kernel address-space builder
//!
//! One-shot construction of the kernel page table from [`BootInfo`],
//! executed by the bootstrap thread before any other component touches
//! virtual memory. After [`build`] returns, the kernel half of the address
//! space is frozen: per-process page tables clone its top-level entries by
//! reference and nothing ever changes them again.

use spin::Once;

use super::{
    frame_allocator::{FrameAllocator, FrameNumber},
    heap::HeapKind,
    page_table::{pages_for, AddressSpace},
    set_phys_offset, zero_frame, PageFlags, PageSize, PhysicalAddress, VirtualAddress,
    HEAP_WINDOW_BASE, HEAP_WINDOW_SIZE, PAGE_SIZE,
};
use crate::{
    boot::{BootInfo, RegionKind},
    error::{KernelError, KernelResult},
};

/// Kind of one kernel image section, deciding its mapping permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Executable code: mapped RX
    Text,
    /// Read-only data: mapped RO, NX
    Rodata,
    /// Mutable data and bss: mapped RW, NX
    Data,
    /// Bootstrap trampoline: RWX until bring-up hands over
    Bootstrap,
}

impl SectionKind {
    fn flags(self) -> PageFlags {
        match self {
            SectionKind::Text => PageFlags::kernel_rx(),
            SectionKind::Rodata => PageFlags::kernel_ro(),
            SectionKind::Data => PageFlags::kernel_rw(),
            SectionKind::Bootstrap => PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL,
        }
    }
}

/// One mapped kernel image section.
#[derive(Debug, Clone, Copy)]
pub struct Section {
    pub virt_base: u64,
    pub phys_base: u64,
    pub len: u64,
    pub kind: SectionKind,
}

/// The kernel image split the linker hands us. Targets without section
/// symbols fall back to a single bootstrap-permission section covering the
/// whole image.
#[derive(Debug, Clone, Copy)]
pub struct SectionMap {
    sections: [Option<Section>; 8],
    count: usize,
}

impl SectionMap {
    pub const fn new() -> Self {
        Self {
            sections: [None; 8],
            count: 0,
        }
    }

    pub fn push(&mut self, section: Section) {
        if self.count < self.sections.len() {
            self.sections[self.count] = Some(section);
            self.count += 1;
        }
    }

    /// Whole image as one RWX bootstrap section.
    pub fn single(virt_base: u64, phys_base: u64, len: u64) -> Self {
        let mut map = Self::new();
        map.push(Section {
            virt_base,
            phys_base,
            len,
            kind: SectionKind::Bootstrap,
        });
        map
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections[..self.count].iter().flatten()
    }
}

impl Default for SectionMap {
    fn default() -> Self {
        Self::new()
    }
}

static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// The frozen kernel address space. `None` before [`build`] completes.
pub fn kernel_space() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

/// Build the kernel address space, one shot, in boot order:
/// 1. initialize the frame allocator from the boot memory map,
/// 2. reserve the kernel image, framebuffer and module blobs,
/// 3. install a linear map of usable RAM leaving page 0 unmapped,
/// 4. map the framebuffer User|Global, write-through,
/// 5. map the kernel image sections with per-section permissions,
/// 6. switch the page-table register to the new root,
/// 7. arm the selected kernel heap over its fixed window.
pub fn build(boot: &BootInfo, sections: &SectionMap) -> KernelResult<&'static AddressSpace> {
    let mut frames = super::FRAME_ALLOCATOR.lock();
    build_in(boot, sections, &mut frames, true)?;
    drop(frames);
    kernel_space().ok_or(KernelError::NotInitialized {
        subsystem: "kernel address space",
    })
}

/// The buildable core of [`build`], parameterized over the allocator so
/// the sequence is testable against a private allocator. `arm` gates the
/// hardware switch and heap arming.
pub fn build_in(
    boot: &BootInfo,
    sections: &SectionMap,
    frames: &mut FrameAllocator,
    arm: bool,
) -> KernelResult<FrameNumber> {
    // Step 1: the allocator owns all RAM.
    frames.init(boot);

    // Step 2: permanent reservations. Bootloader-kind regions are already
    // reserved by init; the kernel image and framebuffer may sit inside
    // usable regions.
    frames.reserve(
        PhysicalAddress::new(boot.kernel_base).frame(),
        pages_for(boot.kernel_size as usize),
    )?;
    if let Some(fb) = boot.framebuffer {
        let bytes = (fb.pitch * fb.height) as usize;
        frames.reserve(PhysicalAddress::new(fb.base).frame(), pages_for(bytes))?;
    }
    for module in boot.modules() {
        frames.reserve(
            PhysicalAddress::new(module.base).frame(),
            pages_for(module.size as usize),
        )?;
    }

    // Table walks go through the linear window from here on.
    set_phys_offset(boot.phys_offset);

    // Step 3: fresh root, linear map of all usable RAM. The first page is
    // deliberately left unmapped so null dereferences fault.
    let root = frames.request(1)?;
    zero_frame(root);
    let space = AddressSpace::from_root(root);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    alias_active_kernel_half(&space);

    for region in boot.memory_map() {
        if region.kind == RegionKind::Reserved {
            continue;
        }
        map_linear(&space, frames, boot.phys_offset, region.base, region.length)?;
    }

    // Step 4: framebuffer, write-through and user-visible so the crash
    // screen stays reachable after a process switch.
    if let Some(fb) = boot.framebuffer {
        let bytes = (fb.pitch * fb.height) as usize;
        let flags = PageFlags::WRITABLE
            | PageFlags::USER
            | PageFlags::GLOBAL
            | PageFlags::WRITE_THROUGH
            | PageFlags::NO_EXECUTE;
        let mut offset = 0u64;
        while (offset as usize) < bytes {
            let va = VirtualAddress::new(boot.phys_offset + fb.base + offset);
            let pa = PhysicalAddress::new(fb.base + offset);
            if space.translate(va).is_none() {
                space.map(va, pa, flags, PageSize::Small, frames)?;
            } else {
                space.remap(va, pa, flags, PageSize::Small, frames)?;
            }
            offset += PAGE_SIZE as u64;
        }
    }

    // Step 5: kernel image sections with their landed permissions.
    for section in sections.iter() {
        let mut offset = 0u64;
        while offset < section.len {
            let va = VirtualAddress::new(section.virt_base + offset);
            let pa = PhysicalAddress::new(section.phys_base + offset);
            if space.translate(va).is_none() {
                space.map(va, pa, section.kind.flags(), PageSize::Small, frames)?;
            } else {
                space.remap(va, pa, section.kind.flags(), PageSize::Small, frames)?;
            }
            offset += PAGE_SIZE as u64;
        }
    }

    // Step 6: switch. From here the kernel runs on its own tables.
    if arm {
        space.make_active();
    }

    // Step 7: heap window, then arm the selected allocator.
    if arm {
        let kind = HeapKind::from_cmdline(boot.cmdline());
        let mut va = HEAP_WINDOW_BASE;
        let end = HEAP_WINDOW_BASE + HEAP_WINDOW_SIZE as u64;
        while va < end {
            let frame = frames.request(1)?;
            space.map(
                VirtualAddress::new(va),
                frame.base_addr(),
                PageFlags::kernel_rw(),
                PageSize::Small,
                frames,
            )?;
            va += PAGE_SIZE as u64;
        }
        // SAFETY: the window was just mapped read-write and belongs to the
        // heap alone.
        unsafe {
            crate::kernel_heap().init(kind, HEAP_WINDOW_BASE as usize, HEAP_WINDOW_SIZE)
        };
    }

    KERNEL_SPACE.call_once(|| AddressSpace::from_root(root));
    log::info!(target: "mm", "kernel address space ready, root frame {}", root.as_u64());
    Ok(root)
}

/// Map `[base, base+len)` physical at the linear window, preferring 2 MiB
/// pages where alignment allows. Page 0 stays unmapped.
fn map_linear(
    space: &AddressSpace,
    frames: &mut FrameAllocator,
    phys_offset: u64,
    base: u64,
    len: u64,
) -> KernelResult<()> {
    let flags = PageFlags::kernel_rw();
    let large = PageSize::Large.bytes();
    let mut pa = base & !(PAGE_SIZE as u64 - 1);
    let end = base + len;
    while pa < end {
        if pa == 0 {
            // Null page: never mapped.
            pa += PAGE_SIZE as u64;
            continue;
        }
        let va = VirtualAddress::new(phys_offset + pa);
        if pa % large == 0 && pa + large <= end && (phys_offset + pa) % large == 0 {
            if space.translate(va).is_none() {
                space.map(va, PhysicalAddress::new(pa), flags, PageSize::Large, frames)?;
            }
            pa += large;
        } else {
            if space.translate(va).is_none() {
                space.map(va, PhysicalAddress::new(pa), flags, PageSize::Small, frames)?;
            }
            pa += PAGE_SIZE as u64;
        }
    }
    Ok(())
}

/// Copy the active root's kernel-half entries into the new root so the
/// running stack, the linear window and every other live kernel mapping
/// survive the CR3 switch.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn alias_active_kernel_half(space: &AddressSpace) {
    use super::page_table::{PageTable, KERNEL_L4_START, PAGE_TABLE_ENTRIES};
    let active = crate::arch::x86_64::mmu::read_cr3();
    // SAFETY: both roots are live page-table frames; the linear window
    // makes them addressable.
    unsafe {
        let src = &*(super::phys_to_virt(active) as *const PageTable);
        let dst = &mut *(super::phys_to_virt(space.root_phys()) as *mut PageTable);
        for i in KERNEL_L4_START..PAGE_TABLE_ENTRIES {
            if src[i].is_present() && !dst[i].is_present() {
                dst[i] = src[i];
            }
        }
    }
}
