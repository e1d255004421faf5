//! Page table management
//!
//! Four-level x86_64 paging. [`AddressSpace`] owns one root frame and
//! provides map/remap/unmap/check/translate plus the `walk_to` inspector
//! the crash handler uses. Table frames come from the frame allocator the
//! caller passes in; leaf frames are never freed here (frame ownership
//! belongs to the VMA layer).
//!
//! The kernel half of every user address space aliases the kernel root's
//! upper L4 entries by reference. Those entries are frozen once the
//! address-space builder finishes, so kernel mappings are globally visible
//! without shootdown iteration.

use core::ops::{Index, IndexMut};

use super::{
    frame_allocator::{FrameAllocator, FrameNumber},
    phys_to_virt, zero_frame, PageFlags, PageSize, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};
use crate::error::MemoryError;

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Index of the first kernel-half entry in the root table.
pub const KERNEL_L4_START: usize = 256;

/// Page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.entry & PageFlags::HUGE.bits() != 0
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(FrameNumber::new((self.entry & ADDR_MASK) >> 12))
        } else {
            None
        }
    }

    pub fn addr(&self) -> Option<PhysicalAddress> {
        self.frame().map(|f| f.base_addr())
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry & !ADDR_MASK)
    }

    pub fn set(&mut self, frame: FrameNumber, flags: PageFlags) {
        self.entry = (frame.as_u64() << 12) | flags.bits();
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.entry = (self.entry & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }

    pub const fn raw(&self) -> u64 {
        self.entry
    }
}

/// A page table with 512 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Table level, root downwards. `L1` holds 4 KiB leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
}

#[inline]
const fn index_at(va: u64, level: Level) -> usize {
    ((va >> (12 + 9 * (level as u64 - 1))) & 0x1FF) as usize
}

/// Resolve a physical table address to a reference.
///
/// # Safety
///
/// `pa` must point to a live, exclusively-borrowed page table frame.
unsafe fn table_mut<'a>(pa: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: caller contract; phys_to_virt returns a mapped pointer.
    unsafe { &mut *(phys_to_virt(pa) as *mut PageTable) }
}

/// One multi-level page table tree rooted at a frame this object owns.
pub struct AddressSpace {
    root: FrameNumber,
}

pub type Result<T> = core::result::Result<T, MemoryError>;

impl AddressSpace {
    /// Allocate and zero a fresh root table.
    pub fn new(frames: &mut FrameAllocator) -> Result<Self> {
        let root = frames.request(1)?;
        zero_frame(root);
        Ok(Self { root })
    }

    /// Allocate a user address space whose kernel half aliases `kernel`'s
    /// upper root entries by reference (pointer equality, not copies of
    /// the lower tables).
    pub fn new_user(kernel: &AddressSpace, frames: &mut FrameAllocator) -> Result<Self> {
        let space = Self::new(frames)?;
        // SAFETY: both roots are live table frames owned by this module.
        unsafe {
            let src = table_mut(kernel.root.base_addr());
            let dst = table_mut(space.root.base_addr());
            for i in KERNEL_L4_START..PAGE_TABLE_ENTRIES {
                dst[i] = src[i];
            }
        }
        Ok(space)
    }

    /// Adopt an existing root (used by the address-space builder for the
    /// already-locked boot root).
    pub const fn from_root(root: FrameNumber) -> Self {
        Self { root }
    }

    pub const fn root(&self) -> FrameNumber {
        self.root
    }

    pub const fn root_phys(&self) -> PhysicalAddress {
        self.root.base_addr()
    }

    fn leaf_level(size: PageSize) -> Level {
        match size {
            PageSize::Small => Level::L1,
            PageSize::Large => Level::L2,
            PageSize::Huge => Level::L3,
        }
    }

    /// Walk to the table holding the leaf for `va` at `size`, allocating
    /// intermediate tables when `create` is set.
    fn walk_leaf_table(
        &self,
        va: VirtualAddress,
        size: PageSize,
        create: bool,
        frames: &mut FrameAllocator,
    ) -> Result<Option<(PhysicalAddress, usize)>> {
        let leaf = Self::leaf_level(size);
        let mut table_pa = self.root_phys();
        let mut level = Level::L4;
        loop {
            let idx = index_at(va.as_u64(), level);
            if level == leaf {
                return Ok(Some((table_pa, idx)));
            }
            // SAFETY: table_pa always refers to a table frame reached from
            // our root; the caller serializes mutation.
            let table = unsafe { table_mut(table_pa) };
            let entry = &mut table[idx];
            if !entry.is_present() {
                if !create {
                    return Ok(None);
                }
                let frame = frames.request(1)?;
                zero_frame(frame);
                entry.set(frame, PageFlags::table());
            } else if entry.is_huge() {
                // A larger mapping already covers this range.
                return Err(MemoryError::AlreadyMapped { addr: va.as_u64() });
            }
            table_pa = entry.addr().ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
            level = match level {
                Level::L4 => Level::L3,
                Level::L3 => Level::L2,
                _ => Level::L1,
            };
        }
    }

    /// Map `va -> pa` with the given flags and page size. Refuses to shadow
    /// an existing present leaf; use [`AddressSpace::remap`] for that.
    pub fn map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        size: PageSize,
        frames: &mut FrameAllocator,
    ) -> Result<()> {
        if !va.is_aligned(size.bytes()) {
            return Err(MemoryError::Unaligned { addr: va.as_u64() });
        }
        if !pa.is_aligned(size.bytes()) {
            return Err(MemoryError::Unaligned { addr: pa.as_u64() });
        }
        let (table_pa, idx) = self
            .walk_leaf_table(va, size, true, frames)?
            .ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
        // SAFETY: leaf table reached from our root.
        let table = unsafe { table_mut(table_pa) };
        let entry = &mut table[idx];
        if entry.is_present() {
            return Err(MemoryError::AlreadyMapped { addr: va.as_u64() });
        }
        let mut flags = flags | PageFlags::PRESENT;
        if size != PageSize::Small {
            flags |= PageFlags::HUGE;
        }
        entry.set(pa.frame(), flags);
        Ok(())
    }

    /// Replace whatever maps `va` and invalidate the TLB entry. A large
    /// mapping partially covered by a smaller remap is demoted (split)
    /// first.
    pub fn remap(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        size: PageSize,
        frames: &mut FrameAllocator,
    ) -> Result<()> {
        if !va.is_aligned(size.bytes()) || !pa.is_aligned(size.bytes()) {
            return Err(MemoryError::Unaligned { addr: va.as_u64() });
        }
        if size == PageSize::Small {
            self.demote_if_needed(va, frames)?;
        }
        let (table_pa, idx) = self
            .walk_leaf_table(va, size, true, frames)?
            .ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
        // SAFETY: leaf table reached from our root.
        let table = unsafe { table_mut(table_pa) };
        let mut flags = flags | PageFlags::PRESENT;
        if size != PageSize::Small {
            flags |= PageFlags::HUGE;
        }
        table[idx].set(pa.frame(), flags);
        flush_va(va);
        Ok(())
    }

    /// Clear the mapping at `va` and invalidate the TLB entry. The
    /// physical frame is not freed; that belongs to the VMA layer.
    pub fn unmap(&self, va: VirtualAddress, size: PageSize, frames: &mut FrameAllocator) -> Result<()> {
        if size == PageSize::Small {
            self.demote_if_needed(va, frames)?;
        }
        let (table_pa, idx) = self
            .walk_leaf_table(va, size, false, frames)?
            .ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
        // SAFETY: leaf table reached from our root.
        let table = unsafe { table_mut(table_pa) };
        let entry = &mut table[idx];
        if !entry.is_present() {
            return Err(MemoryError::NotMapped { addr: va.as_u64() });
        }
        entry.clear();
        flush_va(va);
        Ok(())
    }

    /// Split a 2 MiB (or, transitively, 1 GiB) mapping covering `va` into
    /// the next smaller size so a 4 KiB operation can proceed.
    fn demote_if_needed(&self, va: VirtualAddress, frames: &mut FrameAllocator) -> Result<()> {
        for level in [Level::L3, Level::L2] {
            let Some(entry) = self.walk_to(va, level) else {
                return Ok(());
            };
            if !entry.is_present() {
                return Ok(());
            }
            if !entry.is_huge() {
                continue;
            }
            let base = entry.frame().ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
            let step = if level == Level::L3 { 512u64 } else { 1u64 };
            let child_flags = entry.flags() & !PageFlags::HUGE;
            let keep_huge = level == Level::L3; // children of an L3 split are 2 MiB leaves

            let table_frame = frames.request(1)?;
            zero_frame(table_frame);
            // SAFETY: freshly allocated, zeroed, exclusively owned.
            let child = unsafe { table_mut(table_frame.base_addr()) };
            for (i, child_entry) in (0..PAGE_TABLE_ENTRIES).zip(child.entries.iter_mut()) {
                let mut f = child_flags;
                if keep_huge {
                    f |= PageFlags::HUGE;
                }
                child_entry.set(base.add(i as u64 * step), f);
            }

            // Point the old slot at the new table.
            let parent_idx = index_at(va.as_u64(), level);
            let parent_pa = self.table_at(va, level)?;
            // SAFETY: parent table reached from our root.
            let parent = unsafe { table_mut(parent_pa) };
            parent[parent_idx].set(table_frame, PageFlags::table());
            flush_va(va);
        }
        Ok(())
    }

    /// Physical address of the table that holds `va`'s entry at `level`.
    fn table_at(&self, va: VirtualAddress, level: Level) -> Result<PhysicalAddress> {
        let mut table_pa = self.root_phys();
        let mut cur = Level::L4;
        while cur != level {
            // SAFETY: reached from our root.
            let table = unsafe { table_mut(table_pa) };
            let entry = table[index_at(va.as_u64(), cur)];
            if !entry.is_present() || entry.is_huge() {
                return Err(MemoryError::NotMapped { addr: va.as_u64() });
            }
            table_pa = entry.addr().ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
            cur = match cur {
                Level::L4 => Level::L3,
                Level::L3 => Level::L2,
                _ => Level::L1,
            };
        }
        Ok(table_pa)
    }

    /// The entry for `va` at `level`, if the walk reaches it. Diagnostic
    /// helper for the crash handler's page-walk printer.
    pub fn walk_to(&self, va: VirtualAddress, level: Level) -> Option<PageTableEntry> {
        let mut table_pa = self.root_phys();
        for cur in [Level::L4, Level::L3, Level::L2, Level::L1] {
            // SAFETY: reached from our root; read-only access.
            let table = unsafe { table_mut(table_pa) };
            let entry = table[index_at(va.as_u64(), cur)];
            if cur == level {
                return Some(entry);
            }
            if !entry.is_present() || entry.is_huge() {
                return None;
            }
            table_pa = entry.addr()?;
        }
        None
    }

    /// Leaf entry covering `va` at whatever page size maps it.
    fn leaf_entry(&self, va: VirtualAddress) -> Option<(PageTableEntry, PageSize)> {
        let mut table_pa = self.root_phys();
        for cur in [Level::L4, Level::L3, Level::L2, Level::L1] {
            // SAFETY: reached from our root; read-only access.
            let table = unsafe { table_mut(table_pa) };
            let entry = table[index_at(va.as_u64(), cur)];
            if !entry.is_present() {
                return None;
            }
            match cur {
                Level::L3 if entry.is_huge() => return Some((entry, PageSize::Huge)),
                Level::L2 if entry.is_huge() => return Some((entry, PageSize::Large)),
                Level::L1 => return Some((entry, PageSize::Small)),
                _ => table_pa = entry.addr()?,
            }
        }
        None
    }

    /// True iff `va` is mapped and its flags are a superset of `flags`.
    pub fn check(&self, va: VirtualAddress, flags: PageFlags) -> bool {
        match self.leaf_entry(va) {
            Some((entry, _)) => entry.flags().contains(flags),
            None => false,
        }
    }

    /// Translate a virtual address, honoring large pages.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (entry, size) = self.leaf_entry(va)?;
        let base = entry.addr()?.as_u64();
        let offset = va.as_u64() & (size.bytes() - 1);
        Some(PhysicalAddress::new(base + offset))
    }

    /// Rewrite the flags of the 4 KiB leaf mapping `va` without changing
    /// the frame. Used by mprotect and the COW resolver.
    pub fn set_leaf_flags(
        &self,
        va: VirtualAddress,
        flags: PageFlags,
        frames: &mut FrameAllocator,
    ) -> Result<()> {
        self.demote_if_needed(va, frames)?;
        let (table_pa, idx) = self
            .walk_leaf_table(va, PageSize::Small, false, frames)?
            .ok_or(MemoryError::NotMapped { addr: va.as_u64() })?;
        // SAFETY: leaf table reached from our root.
        let table = unsafe { table_mut(table_pa) };
        let entry = &mut table[idx];
        if !entry.is_present() {
            return Err(MemoryError::NotMapped { addr: va.as_u64() });
        }
        entry.set_flags(flags | PageFlags::PRESENT);
        flush_va(va);
        Ok(())
    }

    /// Load this root into the page-table register.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn make_active(&self) {
        crate::arch::x86_64::mmu::write_cr3(self.root_phys());
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    pub fn make_active(&self) {}

    /// Free the user-half intermediate tables and the root itself. Leaf
    /// frames are owned (and already released) by the VMA layer. Called
    /// only during final process teardown.
    pub fn free_tables(self, frames: &mut FrameAllocator) {
        fn free_level(table_pa: PhysicalAddress, level: Level, frames: &mut FrameAllocator) {
            // SAFETY: reached from the root being destroyed; no other
            // reference exists during teardown.
            let table = unsafe { table_mut(table_pa) };
            for entry in table.iter() {
                if !entry.is_present() || entry.is_huge() {
                    continue;
                }
                if let (Some(frame), Some(addr)) = (entry.frame(), entry.addr()) {
                    if level > Level::L2 {
                        free_level(addr, prev_level(level), frames);
                    }
                    let _ = frames.release(frame, 1);
                }
            }
        }
        fn prev_level(level: Level) -> Level {
            match level {
                Level::L4 => Level::L3,
                Level::L3 => Level::L2,
                _ => Level::L1,
            }
        }

        // Only the user half: kernel-half tables are shared with every
        // other address space and with the kernel root.
        // SAFETY: root is live until the release below.
        let root_table = unsafe { table_mut(self.root_phys()) };
        for idx in 0..KERNEL_L4_START {
            let entry = root_table[idx];
            if entry.is_present() && !entry.is_huge() {
                if let (Some(frame), Some(addr)) = (entry.frame(), entry.addr()) {
                    free_level(addr, Level::L3, frames);
                    let _ = frames.release(frame, 1);
                }
            }
        }
        let _ = frames.release(self.root, 1);
    }
}

/// Invalidate one TLB entry for `va`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn flush_va(va: VirtualAddress) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va.as_u64()));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn flush_va(_va: VirtualAddress) {}

/// Number of 4 KiB pages covered by `bytes`, rounded up.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;
    use alloc::boxed::Box;

    use super::*;
    use crate::boot::{BootInfo, MemoryRegion, RegionKind};

    fn fresh_frames(base: u64, count: u64) -> Box<FrameAllocator> {
        let mut boot = BootInfo::empty();
        boot.push_region(MemoryRegion {
            base: base * PAGE_SIZE as u64,
            length: count * PAGE_SIZE as u64,
            kind: RegionKind::Usable,
        });
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(&boot);
        fa
    }

    const USER_FLAGS: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);

    #[test]
    fn map_then_translate_roundtrip() {
        let mut fa = fresh_frames(0x1000, 256);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x1010 * PAGE_SIZE as u64);

        space
            .map(va, pa, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("mapping a free page");
        assert_eq!(space.translate(va), Some(pa));
        assert_eq!(
            space.translate(va.add(0x123)),
            Some(PhysicalAddress::new(pa.as_u64() + 0x123))
        );
    }

    #[test]
    fn map_unmap_translate_none() {
        let mut fa = fresh_frames(0x2000, 256);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x2010 * PAGE_SIZE as u64);

        space
            .map(va, pa, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("map");
        space.unmap(va, PageSize::Small, &mut fa).expect("unmap");
        assert_eq!(space.translate(va), None);
    }

    #[test]
    fn map_refuses_to_shadow() {
        let mut fa = fresh_frames(0x3000, 256);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x3010 * PAGE_SIZE as u64);

        space
            .map(va, pa, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("first map");
        assert_eq!(
            space.map(va, pa, USER_FLAGS, PageSize::Small, &mut fa),
            Err(MemoryError::AlreadyMapped { addr: va.as_u64() })
        );
        // remap replaces without complaint.
        let pa2 = PhysicalAddress::new(0x3020 * PAGE_SIZE as u64);
        space
            .remap(va, pa2, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("remap");
        assert_eq!(space.translate(va), Some(pa2));
    }

    #[test]
    fn unaligned_map_is_rejected() {
        let mut fa = fresh_frames(0x4000, 64);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        assert_eq!(
            space.map(
                VirtualAddress::new(0x4000_0123),
                PhysicalAddress::new(0x4010 * PAGE_SIZE as u64),
                USER_FLAGS,
                PageSize::Small,
                &mut fa,
            ),
            Err(MemoryError::Unaligned { addr: 0x4000_0123 })
        );
    }

    #[test]
    fn check_requires_flag_superset() {
        let mut fa = fresh_frames(0x5000, 64);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x5010 * PAGE_SIZE as u64);
        space
            .map(va, pa, PageFlags::USER, PageSize::Small, &mut fa)
            .expect("read-only map");

        assert!(space.check(va, PageFlags::USER));
        assert!(space.check(va, PageFlags::PRESENT));
        assert!(!space.check(va, PageFlags::WRITABLE));
        assert!(!space.check(VirtualAddress::new(0x5000_0000), PageFlags::PRESENT));
    }

    #[test]
    fn large_page_translate_and_demote() {
        let mut fa = fresh_frames(0x6000, 2048);
        let space = AddressSpace::new(&mut fa).expect("root frame");
        let va = VirtualAddress::new(0x4020_0000);
        // 2 MiB-aligned physical range inside the test pool.
        let pa = PhysicalAddress::new(0x6200u64 * PAGE_SIZE as u64);
        assert!(pa.is_aligned(PageSize::Large.bytes()));

        space
            .map(va, pa, USER_FLAGS, PageSize::Large, &mut fa)
            .expect("2 MiB map");
        assert_eq!(
            space.translate(va.add(0x1234)),
            Some(PhysicalAddress::new(pa.as_u64() + 0x1234))
        );

        // Remapping one 4 KiB page inside it demotes the mapping and the
        // rest of the range still translates to the original frames.
        let hole = va.add(4 * PAGE_SIZE as u64);
        let new_pa = PhysicalAddress::new(0x6400u64 * PAGE_SIZE as u64);
        space
            .remap(hole, new_pa, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("demoting remap");
        assert_eq!(space.translate(hole), Some(new_pa));
        assert_eq!(
            space.translate(va.add(5 * PAGE_SIZE as u64)),
            Some(PhysicalAddress::new(pa.as_u64() + 5 * PAGE_SIZE as u64))
        );
    }

    #[test]
    fn kernel_half_aliases_by_reference() {
        let mut fa = fresh_frames(0x7000, 512);
        let kernel = AddressSpace::new(&mut fa).expect("kernel root");
        // Put something in the kernel half so the aliasing is observable.
        let kva = VirtualAddress::new(crate::mm::KERNEL_VMA + 0x20_0000);
        let pa = PhysicalAddress::new(0x7040 * PAGE_SIZE as u64);
        kernel
            .map(
                kva,
                pa,
                PageFlags::WRITABLE | PageFlags::GLOBAL,
                PageSize::Small,
                &mut fa,
            )
            .expect("kernel map");

        let user_a = AddressSpace::new_user(&kernel, &mut fa).expect("user space A");
        let user_b = AddressSpace::new_user(&kernel, &mut fa).expect("user space B");

        // Invariant: the kernel half points at the same L3 tables.
        let idx = index_at(kva.as_u64(), Level::L4);
        let e_kernel = kernel.walk_to(kva, Level::L4).expect("kernel L4 entry");
        let e_a = user_a.walk_to(kva, Level::L4).expect("user A L4 entry");
        let e_b = user_b.walk_to(kva, Level::L4).expect("user B L4 entry");
        assert!(idx >= KERNEL_L4_START);
        assert_eq!(e_kernel.addr(), e_a.addr());
        assert_eq!(e_a.addr(), e_b.addr());

        // And a mapping added to the kernel root after cloning is visible
        // through the clones without any per-space update.
        let kva2 = kva.add(PAGE_SIZE as u64);
        let pa2 = PhysicalAddress::new(0x7050 * PAGE_SIZE as u64);
        kernel
            .map(
                kva2,
                pa2,
                PageFlags::WRITABLE | PageFlags::GLOBAL,
                PageSize::Small,
                &mut fa,
            )
            .expect("late kernel map");
        assert_eq!(user_a.translate(kva2), Some(pa2));
    }

    #[test]
    fn walk_to_exposes_levels() {
        let mut fa = fresh_frames(0x8000, 128);
        let space = AddressSpace::new(&mut fa).expect("root");
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x8010 * PAGE_SIZE as u64);
        space
            .map(va, pa, USER_FLAGS, PageSize::Small, &mut fa)
            .expect("map");

        let l4 = space.walk_to(va, Level::L4).expect("L4");
        assert!(l4.is_present());
        let l1 = space.walk_to(va, Level::L1).expect("L1");
        assert_eq!(l1.addr(), Some(pa));
    }
}
