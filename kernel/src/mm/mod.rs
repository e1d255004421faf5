//! Memory management
//!
//! Frame allocator, page tables, kernel heap, the one-shot address-space
//! builder, per-process VMA sets, and user-pointer validation.

#[cfg(feature = "alloc")]
extern crate alloc;

use core::sync::atomic::{AtomicU64, Ordering};

pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod user;
pub mod vma;

pub use frame_allocator::{FrameAllocator, FrameNumber, FRAME_ALLOCATOR};
pub use page_table::AddressSpace;

/// Size of one page/frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// First virtual address of the kernel half. Everything at or above this is
/// shared between all address spaces and marked Global.
pub const KERNEL_VMA: u64 = 0xFFFF_8000_0000_0000;

/// Exclusive upper bound of user space (lower canonical half).
pub const USER_SPACE_TOP: u64 = 0x0000_8000_0000_0000;

/// Fixed kernel heap window (virtual).
pub const HEAP_WINDOW_BASE: u64 = 0xFFFF_C000_0000_0000;
pub const HEAP_WINDOW_SIZE: usize = 64 * 1024 * 1024;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / PAGE_SIZE as u64)
    }

    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 % align == 0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn add(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 % align == 0
    }

    pub const fn is_user(&self) -> bool {
        self.0 < USER_SPACE_TOP
    }

    pub const fn is_kernel(&self) -> bool {
        self.0 >= KERNEL_VMA
    }
}

/// Page size options for map/remap/unmap.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB pages
    Small = 4096,
    /// 2 MiB pages
    Large = 2 * 1024 * 1024,
    /// 1 GiB pages
    Huge = 1024 * 1024 * 1024,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        self as u64
    }
}

bitflags::bitflags! {
    /// Architectural page table entry flags (x86_64 layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for interior (non-leaf) page-table entries. USER is included
    /// so that leaf-level USER mappings are reachable from ring 3; the leaf
    /// itself gates access.
    pub const fn table() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER)
    }

    pub const fn kernel_rw() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::GLOBAL)
            .union(Self::NO_EXECUTE)
    }

    pub const fn kernel_rx() -> Self {
        Self::PRESENT.union(Self::GLOBAL)
    }

    pub const fn kernel_ro() -> Self {
        Self::PRESENT.union(Self::GLOBAL).union(Self::NO_EXECUTE)
    }
}

/// Offset of the linear physical-memory mapping, set once by the
/// address-space builder before any page-table walk happens.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_phys_offset(offset: u64) {
    PHYS_OFFSET.store(offset, Ordering::Release);
}

pub fn phys_offset() -> u64 {
    PHYS_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address to a pointer the kernel can dereference.
///
/// On bare metal this adds the boot-time linear-mapping offset. On host
/// builds (unit tests) physical frames are backed by per-frame heap
/// buffers so page-table walks and COW copies run as ordinary tests.
#[cfg(target_os = "none")]
pub fn phys_to_virt(pa: PhysicalAddress) -> *mut u8 {
    (phys_offset() + pa.as_u64()) as *mut u8
}

#[cfg(not(target_os = "none"))]
pub fn phys_to_virt(pa: PhysicalAddress) -> *mut u8 {
    let frame = pa.as_u64() / PAGE_SIZE as u64;
    let offset = (pa.as_u64() % PAGE_SIZE as u64) as usize;
    // SAFETY: frame_ptr returns a pointer to a live 4 KiB buffer and
    // offset < PAGE_SIZE.
    unsafe { phys_test::frame_ptr(frame).add(offset) }
}

/// Zero one physical frame. Frame allocation does not zero; callers that
/// hand memory to user space or use it as a page table must.
pub fn zero_frame(frame: FrameNumber) {
    let ptr = phys_to_virt(frame.base_addr());
    // SAFETY: the frame is owned by the caller and spans PAGE_SIZE bytes.
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
}

#[cfg(not(target_os = "none"))]
mod phys_test {
    //! Host-side backing store for "physical" frames.

    extern crate alloc;
    use alloc::{boxed::Box, collections::BTreeMap};

    use spin::Mutex;

    #[repr(align(4096))]
    struct AlignedFrame([u8; super::PAGE_SIZE]);

    static FRAMES: Mutex<BTreeMap<u64, usize>> = Mutex::new(BTreeMap::new());

    pub fn frame_ptr(frame: u64) -> *mut u8 {
        let mut map = FRAMES.lock();
        let addr = *map.entry(frame).or_insert_with(|| {
            let buf: Box<AlignedFrame> = Box::new(AlignedFrame([0u8; super::PAGE_SIZE]));
            Box::into_raw(buf) as usize
        });
        addr as *mut u8
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn address_helpers() {
        let va = VirtualAddress::new(0x0000_7FFF_FFFF_F123);
        assert!(va.is_user());
        assert!(!va.is_kernel());
        assert_eq!(va.align_down(4096).as_u64(), 0x0000_7FFF_FFFF_F000);

        let kva = VirtualAddress::new(KERNEL_VMA + 0x1000);
        assert!(kva.is_kernel());
        assert!(!kva.is_user());
    }

    #[test]
    fn phys_backing_is_stable_and_zeroed() {
        let pa = PhysicalAddress::new(0x7_7700_0000);
        let p1 = phys_to_virt(pa);
        let p2 = phys_to_virt(pa);
        assert_eq!(p1, p2);
        // SAFETY: test-backed frame buffer.
        unsafe {
            assert_eq!(*p1, 0);
            *p1 = 0xAB;
            assert_eq!(*p2, 0xAB);
        }
    }
}
