//! Virtual memory areas
//!
//! Per-process set of non-overlapping `[start, end)` ranges backing mmap,
//! mprotect, munmap, stack growth and copy-on-write. The VMA layer owns the
//! physical frames behind anonymous areas: `unmap` at the page-table level
//! never frees frames, teardown here does.
//!
//! Frames shared between address spaces after fork carry a reference count
//! in a global table; the last owner standing frees the frame.

extern crate alloc;

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::{
    frame_allocator::{FrameAllocator, FrameNumber},
    page_table::AddressSpace,
    zero_frame, PageFlags, PageSize, PhysicalAddress, VirtualAddress, PAGE_SIZE, USER_SPACE_TOP,
};
use crate::error::MemoryError;

bitflags::bitflags! {
    /// Permissions and backing policy of one area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const SHARED = 1 << 3;
        /// Pages are shared read-only and duplicated on first write
        const COW    = 1 << 4;
        /// Grows downward on faults just below the area
        const STACK  = 1 << 5;
        /// Backed by a file mapping (adapter-provided contents)
        const FILE   = 1 << 6;
        /// The area's frames belong to this process and are freed on unmap
        const OWNED  = 1 << 7;
    }
}

/// One virtual memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
    /// Lowest address a STACK area may grow down to.
    pub growth_limit: u64,
}

impl Vma {
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub const fn pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE as u64
    }
}

/// Reference counts for frames shared across address spaces (fork). Only
/// shared frames appear here; a missing entry means sole ownership.
static SHARED_FRAMES: Mutex<BTreeMap<u64, u32>> = Mutex::new(BTreeMap::new());

fn share_frame(frame: FrameNumber) {
    let mut refs = SHARED_FRAMES.lock();
    let count = refs.entry(frame.as_u64()).or_insert(1);
    *count += 1;
}

/// Drop one reference; returns true when the caller was the last owner and
/// must free the frame.
fn unshare_frame(frame: FrameNumber) -> bool {
    let mut refs = SHARED_FRAMES.lock();
    match refs.get_mut(&frame.as_u64()) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            refs.remove(&frame.as_u64());
            true
        }
        None => true,
    }
}

/// True when nobody else references the frame.
fn frame_is_sole(frame: FrameNumber) -> bool {
    SHARED_FRAMES
        .lock()
        .get(&frame.as_u64())
        .map_or(true, |count| *count <= 1)
}

/// Leaf page-table flags for an area.
fn pte_flags(flags: VmaFlags) -> PageFlags {
    let mut f = PageFlags::USER;
    if flags.contains(VmaFlags::WRITE) && !flags.contains(VmaFlags::COW) {
        f |= PageFlags::WRITABLE;
    }
    if !flags.contains(VmaFlags::EXEC) {
        f |= PageFlags::NO_EXECUTE;
    }
    f
}

/// The per-process set of areas. The owner serializes access; in the
/// locking order the VMA lock sits above page-table, below process-state.
pub struct VmaSet {
    areas: BTreeMap<u64, Vma>,
}

pub type Result<T> = core::result::Result<T, MemoryError>;

impl VmaSet {
    pub const fn new() -> Self {
        Self {
            areas: BTreeMap::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.values()
    }

    pub fn find(&self, addr: u64) -> Option<&Vma> {
        self.areas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.areas
            .range(..end)
            .next_back()
            .map(|(_, vma)| vma.end > start)
            .unwrap_or(false)
    }

    /// Lowest gap of `len` bytes at or above `hint`, for mmap without
    /// MAP_FIXED.
    pub fn find_gap(&self, hint: u64, len: u64) -> Option<u64> {
        let mut candidate = match self.find(hint) {
            Some(vma) => vma.end,
            None => hint,
        };
        for vma in self.areas.range(hint..).map(|(_, v)| v) {
            if vma.start >= candidate + len {
                break;
            }
            candidate = candidate.max(vma.end);
        }
        if candidate + len <= USER_SPACE_TOP {
            Some(candidate)
        } else {
            None
        }
    }

    /// Record an area without touching the page table. Backing pages are
    /// the caller's business (file mappings, physical windows).
    pub fn insert(&mut self, start: u64, len: u64, flags: VmaFlags, growth_limit: u64) -> Result<()> {
        if len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(MemoryError::InvalidSize);
        }
        if start % PAGE_SIZE as u64 != 0 {
            return Err(MemoryError::Unaligned { addr: start });
        }
        let end = start + len;
        if end > USER_SPACE_TOP {
            return Err(MemoryError::KernelRange { addr: start });
        }
        if self.overlaps(start, end) {
            return Err(MemoryError::VmaOverlap { addr: start });
        }
        self.areas.insert(
            start,
            Vma {
                start,
                end,
                flags,
                growth_limit,
            },
        );
        Ok(())
    }

    /// Anonymous mapping: insert the area and eagerly populate it with
    /// zeroed frames.
    pub fn map_anon(
        &mut self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        start: u64,
        len: u64,
        flags: VmaFlags,
    ) -> Result<()> {
        self.insert(start, len, flags | VmaFlags::OWNED, start)?;
        let pte = pte_flags(flags | VmaFlags::OWNED);
        let mut va = start;
        while va < start + len {
            let frame = match frames.request(1) {
                Ok(f) => f,
                Err(e) => {
                    // Roll back the partially-populated area.
                    let mapped = va - start;
                    if mapped > 0 {
                        let _ = self.unmap_range(space, frames, start, mapped);
                    }
                    self.areas.remove(&start);
                    return Err(e);
                }
            };
            zero_frame(frame);
            if let Err(e) = space.map(
                VirtualAddress::new(va),
                frame.base_addr(),
                pte,
                PageSize::Small,
                frames,
            ) {
                let _ = frames.release(frame, 1);
                let mapped = va - start;
                if mapped > 0 {
                    let _ = self.unmap_range(space, frames, start, mapped);
                }
                self.areas.remove(&start);
                return Err(e);
            }
            va += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Release every mapped page of `[start, start+len)`: unmap, drop the
    /// shared reference, free sole-owned frames.
    fn unmap_range(
        &self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        start: u64,
        len: u64,
    ) -> Result<()> {
        let mut va = start;
        while va < start + len {
            let vaddr = VirtualAddress::new(va);
            if let Some(pa) = space.translate(vaddr) {
                space.unmap(vaddr, PageSize::Small, frames)?;
                if unshare_frame(pa.frame()) {
                    frames.release(pa.frame(), 1)?;
                }
            }
            va += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// munmap: carve `[start, start+len)` out of the set, splitting areas
    /// that straddle the boundary, and release the pages of owned areas.
    pub fn remove(
        &mut self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        start: u64,
        len: u64,
    ) -> Result<()> {
        if len == 0 {
            return Err(MemoryError::InvalidSize);
        }
        if start % PAGE_SIZE as u64 != 0 {
            return Err(MemoryError::Unaligned { addr: start });
        }
        let len = (len as usize).next_multiple_of(PAGE_SIZE) as u64;
        let end = start + len;
        if end > USER_SPACE_TOP {
            return Err(MemoryError::KernelRange { addr: start });
        }

        let keys: alloc::vec::Vec<u64> = self
            .areas
            .range(..end)
            .filter(|(_, vma)| vma.end > start)
            .map(|(k, _)| *k)
            .collect();

        for key in keys {
            let vma = self.areas.remove(&key).ok_or(MemoryError::NoVma { addr: key })?;
            let cut_start = vma.start.max(start);
            let cut_end = vma.end.min(end);
            if vma.flags.contains(VmaFlags::OWNED) {
                self.unmap_range(space, frames, cut_start, cut_end - cut_start)?;
            } else {
                // Not ours to free; just drop the mappings.
                let mut va = cut_start;
                while va < cut_end {
                    let vaddr = VirtualAddress::new(va);
                    if space.translate(vaddr).is_some() {
                        space.unmap(vaddr, PageSize::Small, frames)?;
                    }
                    va += PAGE_SIZE as u64;
                }
            }
            if vma.start < cut_start {
                self.areas.insert(
                    vma.start,
                    Vma {
                        start: vma.start,
                        end: cut_start,
                        ..vma
                    },
                );
            }
            if vma.end > cut_end {
                self.areas.insert(
                    cut_end,
                    Vma {
                        start: cut_end,
                        end: vma.end,
                        ..vma
                    },
                );
            }
        }
        Ok(())
    }

    /// mprotect: set the permissions of every page in the range to exactly
    /// `prot` (READ/WRITE/EXEC bits of `flags`). The whole range must be
    /// covered by areas.
    pub fn protect(
        &mut self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        start: u64,
        len: u64,
        prot: VmaFlags,
    ) -> Result<()> {
        if len == 0 || start % PAGE_SIZE as u64 != 0 {
            return Err(MemoryError::Unaligned { addr: start });
        }
        let len = (len as usize).next_multiple_of(PAGE_SIZE) as u64;
        let end = start + len;

        // The whole range must be covered before any page changes.
        let mut cursor = start;
        while cursor < end {
            let vma = self.find(cursor).ok_or(MemoryError::NoVma { addr: cursor })?;
            cursor = vma.end;
        }

        // Split boundary areas so flag updates stay area-precise.
        self.split_at(start);
        self.split_at(end);

        let perm_mask = VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC;
        let keys: alloc::vec::Vec<u64> = self
            .areas
            .range(start..end)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(vma) = self.areas.get_mut(&key) {
                vma.flags = (vma.flags - perm_mask) | (prot & perm_mask);
                let flags = vma.flags;
                let (s, e) = (vma.start, vma.end);
                let mut va = s;
                while va < e {
                    let vaddr = VirtualAddress::new(va);
                    if space.translate(vaddr).is_some() {
                        space.set_leaf_flags(vaddr, pte_flags(flags), frames)?;
                    }
                    va += PAGE_SIZE as u64;
                }
            }
        }
        Ok(())
    }

    /// Detach the area containing `addr` from cleanup: its frames are no
    /// longer owned and survive process exit.
    pub fn detach(&mut self, addr: u64) -> Result<()> {
        let start = self
            .find(addr)
            .map(|vma| vma.start)
            .ok_or(MemoryError::NoVma { addr })?;
        if let Some(vma) = self.areas.get_mut(&start) {
            vma.flags -= VmaFlags::OWNED;
        }
        Ok(())
    }

    /// Rewrite the flags and growth limit of the area spanning exactly
    /// `[start, end)`. Stack setup uses this after inserting the area.
    pub fn replace_area(
        &mut self,
        start: u64,
        end: u64,
        flags: VmaFlags,
        growth_limit: u64,
    ) -> Result<()> {
        match self.areas.get_mut(&start) {
            Some(vma) if vma.end == end => {
                vma.flags = flags;
                vma.growth_limit = growth_limit;
                Ok(())
            }
            _ => Err(MemoryError::NoVma { addr: start }),
        }
    }

    /// Split the area containing `addr` at `addr` (no-op on a boundary or
    /// outside every area).
    fn split_at(&mut self, addr: u64) {
        let Some(vma) = self.find(addr).copied() else {
            return;
        };
        if vma.start == addr {
            return;
        }
        self.areas.insert(
            vma.start,
            Vma {
                end: addr,
                ..vma
            },
        );
        self.areas.insert(
            addr,
            Vma {
                start: addr,
                ..vma
            },
        );
    }

    /// Copy-on-write fault recovery: a write hit a read-only page inside a
    /// COW area. Sole owners get the write bit back; shared frames are
    /// duplicated into a fresh frame for the faulting side only.
    ///
    /// Returns false when the fault is not a recoverable COW write.
    pub fn resolve_cow_write(
        &mut self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        addr: u64,
    ) -> Result<bool> {
        let Some(vma) = self.find(addr).copied() else {
            return Ok(false);
        };
        if !vma.flags.contains(VmaFlags::COW) || !vma.flags.contains(VmaFlags::WRITE) {
            return Ok(false);
        }
        let page = VirtualAddress::new(addr).align_down(PAGE_SIZE as u64);
        let Some(pa) = space.translate(page) else {
            return Ok(false);
        };
        let frame = pa.frame();
        let writable = pte_flags(vma.flags - VmaFlags::COW);

        if frame_is_sole(frame) {
            // Last reference: no copy needed, restore the write bit.
            SHARED_FRAMES.lock().remove(&frame.as_u64());
            space.set_leaf_flags(page, writable, frames)?;
            return Ok(true);
        }

        let fresh = frames.request(1)?;
        // SAFETY: both frames are live and PAGE_SIZE long; the source is
        // mapped read-only so nobody mutates it mid-copy (the owner holds
        // the VMA lock).
        unsafe {
            core::ptr::copy_nonoverlapping(
                super::phys_to_virt(PhysicalAddress::new(frame.base_addr().as_u64())),
                super::phys_to_virt(fresh.base_addr()),
                PAGE_SIZE,
            );
        }
        if unshare_frame(frame) {
            frames.release(frame, 1)?;
        }
        space.remap(page, fresh.base_addr(), writable, PageSize::Small, frames)?;
        Ok(true)
    }

    /// Stack-growth fault recovery: the access sits in the page just below
    /// a STACK area and above its growth limit. Extends the area down one
    /// page and maps a fresh zeroed frame.
    pub fn grow_stack(
        &mut self,
        space: &AddressSpace,
        frames: &mut FrameAllocator,
        addr: u64,
    ) -> Result<bool> {
        let page = addr & !(PAGE_SIZE as u64 - 1);
        // The faulting page must be immediately below an existing stack area.
        let above = page + PAGE_SIZE as u64;
        let Some(vma) = self.areas.get(&above).copied() else {
            return Ok(false);
        };
        if !vma.flags.contains(VmaFlags::STACK) || page < vma.growth_limit {
            return Ok(false);
        }

        let frame = frames.request(1)?;
        zero_frame(frame);
        space.map(
            VirtualAddress::new(page),
            frame.base_addr(),
            pte_flags(vma.flags),
            PageSize::Small,
            frames,
        )?;

        self.areas.remove(&above);
        self.areas.insert(
            page,
            Vma {
                start: page,
                ..vma
            },
        );
        Ok(true)
    }

    /// Fork support: share every mapped page of this set into `child`,
    /// remapping writable owned pages read-only on both sides and marking
    /// the areas COW.
    pub fn clone_for_fork(
        &mut self,
        parent_space: &AddressSpace,
        child_space: &AddressSpace,
        frames: &mut FrameAllocator,
    ) -> Result<VmaSet> {
        let mut child = VmaSet::new();
        let keys: alloc::vec::Vec<u64> = self.areas.keys().copied().collect();
        for key in keys {
            let mut vma = self.areas.get(&key).copied().ok_or(MemoryError::NoVma { addr: key })?;
            let owned_writable =
                vma.flags.contains(VmaFlags::OWNED) && vma.flags.contains(VmaFlags::WRITE);
            if owned_writable {
                vma.flags |= VmaFlags::COW;
            }
            let pte = pte_flags(vma.flags);

            let mut va = vma.start;
            while va < vma.end {
                let vaddr = VirtualAddress::new(va);
                if let Some(pa) = parent_space.translate(vaddr) {
                    if vma.flags.contains(VmaFlags::OWNED) {
                        share_frame(pa.frame());
                    }
                    if owned_writable {
                        parent_space.set_leaf_flags(vaddr, pte, frames)?;
                    }
                    child_space.map(
                        vaddr,
                        PhysicalAddress::new(pa.as_u64() & !(PAGE_SIZE as u64 - 1)),
                        pte,
                        PageSize::Small,
                        frames,
                    )?;
                }
                va += PAGE_SIZE as u64;
            }

            self.areas.insert(key, vma);
            child.areas.insert(vma.start, vma);
        }
        Ok(child)
    }

    /// Tear down every area (process exit). Owned frames are released;
    /// mappings of shared/physical windows are just dropped.
    pub fn clear(&mut self, space: &AddressSpace, frames: &mut FrameAllocator) {
        let keys: alloc::vec::Vec<u64> = self.areas.keys().copied().collect();
        for key in keys {
            if let Some(vma) = self.areas.remove(&key) {
                let len = vma.end - vma.start;
                if vma.flags.contains(VmaFlags::OWNED) {
                    let _ = self.unmap_range(space, frames, vma.start, len);
                } else {
                    let mut va = vma.start;
                    while va < vma.end {
                        let vaddr = VirtualAddress::new(va);
                        if space.translate(vaddr).is_some() {
                            let _ = space.unmap(vaddr, PageSize::Small, frames);
                        }
                        va += PAGE_SIZE as u64;
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }
}

impl Default for VmaSet {
    fn default() -> Self {
        Self::new()
    }
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

    const RW: VmaFlags = VmaFlags::READ.union(VmaFlags::WRITE);

    fn write_user(space: &AddressSpace, va: u64, byte: u8) {
        let pa = space
            .translate(VirtualAddress::new(va))
            .expect("page is mapped");
        // SAFETY: test frames are heap-backed.
        unsafe { *super::super::phys_to_virt(pa) = byte };
    }

    fn read_user(space: &AddressSpace, va: u64) -> u8 {
        let pa = space
            .translate(VirtualAddress::new(va))
            .expect("page is mapped");
        // SAFETY: test frames are heap-backed.
        unsafe { *super::super::phys_to_virt(pa) }
    }

    #[test]
    fn anon_map_is_zeroed_and_accounted() {
        let mut fa = fresh_frames(0x9000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();

        vmas.map_anon(&space, &mut fa, 0x4000_0000, 2 * PAGE_SIZE as u64, RW)
            .expect("anonymous mapping");
        assert_eq!(read_user(&space, 0x4000_0000), 0);
        assert!(vmas.find(0x4000_0FFF).is_some());
        assert!(vmas.find(0x4000_2000).is_none());

        // Overlapping insert is refused.
        assert_eq!(
            vmas.insert(0x4000_1000, PAGE_SIZE as u64, RW, 0),
            Err(MemoryError::VmaOverlap { addr: 0x4000_1000 })
        );
    }

    #[test]
    fn munmap_releases_frames() {
        let mut fa = fresh_frames(0xA000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();

        let before = fa.stats().used;
        vmas.map_anon(&space, &mut fa, 0x4000_0000, 4 * PAGE_SIZE as u64, RW)
            .expect("map");
        vmas.remove(&space, &mut fa, 0x4000_0000, 4 * PAGE_SIZE as u64)
            .expect("unmap");
        assert_eq!(
            space.translate(VirtualAddress::new(0x4000_0000)),
            None
        );
        // All leaf frames returned (intermediate tables stay cached).
        let after = fa.stats().used;
        assert!(after <= before + 4, "leaf frames leaked: {} -> {}", before, after);
        assert!(vmas.is_empty());
    }

    #[test]
    fn munmap_splits_straddling_area() {
        let mut fa = fresh_frames(0xB000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();

        vmas.map_anon(&space, &mut fa, 0x4000_0000, 4 * PAGE_SIZE as u64, RW)
            .expect("map");
        // Punch out the middle two pages.
        vmas.remove(&space, &mut fa, 0x4000_1000, 2 * PAGE_SIZE as u64)
            .expect("partial unmap");
        assert!(vmas.find(0x4000_0000).is_some());
        assert!(vmas.find(0x4000_1000).is_none());
        assert!(vmas.find(0x4000_2800).is_none());
        assert!(vmas.find(0x4000_3000).is_some());
        assert_eq!(space.translate(VirtualAddress::new(0x4000_1000)), None);
        assert!(space.translate(VirtualAddress::new(0x4000_3000)).is_some());
    }

    #[test]
    fn mprotect_sets_exact_permissions_and_is_idempotent() {
        let mut fa = fresh_frames(0xC000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();

        vmas.map_anon(&space, &mut fa, 0x4000_0000, PAGE_SIZE as u64, RW)
            .expect("map");
        assert!(space.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));

        vmas.protect(&space, &mut fa, 0x4000_0000, PAGE_SIZE as u64, VmaFlags::READ)
            .expect("drop write");
        assert!(!space.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));
        let vma = *vmas.find(0x4000_0000).expect("area survives");
        assert!(!vma.flags.contains(VmaFlags::WRITE));

        // P1 then P2 equals a single P2.
        vmas.protect(&space, &mut fa, 0x4000_0000, PAGE_SIZE as u64, RW)
            .expect("restore");
        vmas.protect(&space, &mut fa, 0x4000_0000, PAGE_SIZE as u64, RW)
            .expect("again");
        assert!(space.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));
    }

    #[test]
    fn mprotect_outside_vma_fails() {
        let mut fa = fresh_frames(0xD000, 64);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();
        assert_eq!(
            vmas.protect(&space, &mut fa, 0x4000_0000, PAGE_SIZE as u64, RW),
            Err(MemoryError::NoVma { addr: 0x4000_0000 })
        );
    }

    #[test]
    fn fork_cow_write_isolation() {
        let mut fa = fresh_frames(0xE000, 1024);
        let parent = AddressSpace::new(&mut fa).expect("parent root");
        let child = AddressSpace::new(&mut fa).expect("child root");
        let mut vmas = VmaSet::new();

        // Parent maps a page at 0x40000000 and writes 0xAB.
        vmas.map_anon(&parent, &mut fa, 0x4000_0000, PAGE_SIZE as u64, RW)
            .expect("map");
        write_user(&parent, 0x4000_0000, 0xAB);

        let mut child_vmas = vmas
            .clone_for_fork(&parent, &child, &mut fa)
            .expect("fork clone");

        // Both sides are read-only COW now (invariant 5b).
        assert!(!parent.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));
        assert!(!child.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));
        assert_eq!(read_user(&child, 0x4000_0000), 0xAB);

        // Child writes 0xCD through the COW path.
        assert!(child_vmas
            .resolve_cow_write(&child, &mut fa, 0x4000_0000)
            .expect("cow resolve"));
        write_user(&child, 0x4000_0000, 0xCD);

        // Distinct frames now (invariant 5a); parent still sees 0xAB.
        assert_ne!(
            parent.translate(VirtualAddress::new(0x4000_0000)),
            child.translate(VirtualAddress::new(0x4000_0000))
        );
        assert_eq!(read_user(&parent, 0x4000_0000), 0xAB);
        assert_eq!(read_user(&child, 0x4000_0000), 0xCD);

        // Parent's next write is a sole-owner upgrade, no copy.
        assert!(vmas
            .resolve_cow_write(&parent, &mut fa, 0x4000_0000)
            .expect("parent upgrade"));
        assert!(parent.check(VirtualAddress::new(0x4000_0000), PageFlags::WRITABLE));
    }

    #[test]
    fn stack_grows_downward_within_limit() {
        let mut fa = fresh_frames(0xF000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();

        // 4 KiB stack at 0x7FFF_FFFF_F000 allowed to grow 64 KiB down.
        let stack_top = 0x7FFF_FFFF_F000u64;
        let limit = stack_top - 16 * PAGE_SIZE as u64;
        vmas.insert(
            stack_top,
            PAGE_SIZE as u64,
            RW | VmaFlags::STACK | VmaFlags::OWNED,
            limit,
        )
        .expect("stack area");
        let frame = fa.request(1).expect("stack frame");
        zero_frame(frame);
        space
            .map(
                VirtualAddress::new(stack_top),
                frame.base_addr(),
                pte_flags(RW | VmaFlags::STACK | VmaFlags::OWNED),
                PageSize::Small,
                &mut fa,
            )
            .expect("map stack page");

        // Push below the stack: 0x7FFF_FFFF_EFF8 faults, recovery maps the
        // page below.
        let fault = 0x7FFF_FFFF_EFF8u64;
        assert!(vmas
            .grow_stack(&space, &mut fa, fault)
            .expect("stack growth"));
        write_user(&space, fault, 0x5A);
        assert_eq!(read_user(&space, fault), 0x5A);
        let vma = *vmas.find(fault).expect("grown area");
        assert_eq!(vma.start, stack_top - PAGE_SIZE as u64);

        // Below the growth limit: refused.
        assert!(!vmas
            .grow_stack(&space, &mut fa, limit - 8)
            .expect("limited"));
    }

    #[test]
    fn clear_releases_everything() {
        let mut fa = fresh_frames(0x1_0000, 512);
        let space = AddressSpace::new(&mut fa).expect("root");
        let mut vmas = VmaSet::new();
        vmas.map_anon(&space, &mut fa, 0x4000_0000, 8 * PAGE_SIZE as u64, RW)
            .expect("map A");
        vmas.map_anon(&space, &mut fa, 0x5000_0000, 4 * PAGE_SIZE as u64, RW)
            .expect("map B");
        vmas.clear(&space, &mut fa);
        assert!(vmas.is_empty());
        assert_eq!(space.translate(VirtualAddress::new(0x4000_0000)), None);
        assert_eq!(space.translate(VirtualAddress::new(0x5000_0000)), None);
    }
}
