//! Kernel heap
//!
//! Three byte allocators stand behind one [`KernelHeap`] facade: a free-list
//! allocator (`linked_list_allocator`), a size-class slab allocator, and a
//! page-only bump allocator. The boot command line picks one
//! (`allocator=freelist|sizeclass|pageonly`); the selection is fixed for the
//! life of the boot.
//!
//! Contract for every variant: `alloc` returns zeroed memory, `realloc`
//! preserves the smaller of the old and new sizes (the page-only variant
//! allocates fresh pages, copies, and frees the old ones), `dealloc` of a
//! null pointer is a no-op, and double-free is detected in debug builds via
//! a poison word.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, Ordering},
};

use linked_list_allocator::Heap as ListHeap;
use spin::Mutex;

/// Which byte allocator backs the heap for this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    FreeList,
    SizeClass,
    PageOnly,
}

impl HeapKind {
    /// Parse `allocator=` from the boot command line; free-list is the
    /// default.
    pub fn from_cmdline(cmdline: &str) -> Self {
        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("allocator=") {
                return match value {
                    "sizeclass" => HeapKind::SizeClass,
                    "pageonly" => HeapKind::PageOnly,
                    _ => HeapKind::FreeList,
                };
            }
        }
        HeapKind::FreeList
    }
}

/// Slab size classes (bytes).
const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Debug-build poison written into freed size-class blocks.
const FREE_POISON: u64 = 0xDEAD_F4EE_DEAD_F4EE;

/// Pick the slab class for a layout, or None when it must go to the
/// fallback free list.
fn class_for(layout: Layout) -> Option<usize> {
    let want = layout.size().max(layout.align());
    SIZE_CLASSES.iter().position(|&c| want <= c)
}

struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// Size-class slab allocator. Small requests come from per-class free
/// lists carved out of the window; anything larger than the biggest class
/// is delegated to an embedded free-list heap over the tail of the window.
struct SizeClassAllocator {
    free_lists: [Option<NonNull<FreeBlock>>; SIZE_CLASSES.len()],
    /// Bump cursor for carving fresh slabs
    carve: usize,
    carve_end: usize,
    fallback: ListHeap,
}

// SAFETY: the allocator is only reached through a Mutex.
unsafe impl Send for SizeClassAllocator {}

impl SizeClassAllocator {
    const fn new() -> Self {
        Self {
            free_lists: [None; SIZE_CLASSES.len()],
            carve: 0,
            carve_end: 0,
            fallback: ListHeap::empty(),
        }
    }

    /// # Safety
    ///
    /// `[base, base+size)` must be writable kernel memory owned by the heap.
    unsafe fn init(&mut self, base: usize, size: usize) {
        // One quarter of the window feeds the large-allocation fallback.
        let fallback_size = size / 4;
        let slab_size = size - fallback_size;
        self.carve = base;
        self.carve_end = base + slab_size;
        // SAFETY: tail of the window, disjoint from the slab area.
        unsafe {
            self.fallback
                .init((base + slab_size) as *mut u8, fallback_size)
        };
    }

    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        match class_for(layout) {
            Some(class) => {
                if let Some(block) = self.free_lists[class] {
                    // SAFETY: blocks on the list are live, exclusively
                    // owned chunks of the slab area.
                    unsafe {
                        self.free_lists[class] = block.as_ref().next;
                    }
                    block.as_ptr() as *mut u8
                } else {
                    self.carve_block(SIZE_CLASSES[class])
                }
            }
            None => self
                .fallback
                .allocate_first_fit(layout)
                .map(|p| p.as_ptr())
                .unwrap_or(ptr::null_mut()),
        }
    }

    fn carve_block(&mut self, size: usize) -> *mut u8 {
        if self.carve + size > self.carve_end {
            return ptr::null_mut();
        }
        let block = self.carve;
        self.carve += size;
        block as *mut u8
    }

    fn dealloc(&mut self, ptr_in: *mut u8, layout: Layout) {
        match class_for(layout) {
            Some(class) => {
                #[cfg(debug_assertions)]
                {
                    // A freed block starts with the poison word; freeing it
                    // again is a double free.
                    // SAFETY: block is at least 16 bytes and owned by us.
                    unsafe {
                        let word = ptr_in as *mut u64;
                        debug_assert_ne!(
                            *word, FREE_POISON,
                            "kernel heap: double free of {:p}",
                            ptr_in
                        );
                        *word = FREE_POISON;
                    }
                }
                let Some(mut block) = NonNull::new(ptr_in as *mut FreeBlock) else {
                    return;
                };
                // SAFETY: the block is returning to the free list; writing
                // the link header is the list's ownership protocol.
                unsafe {
                    block.as_mut().next = self.free_lists[class];
                }
                self.free_lists[class] = Some(block);
            }
            None => {
                if let Some(p) = NonNull::new(ptr_in) {
                    // SAFETY: the block came from allocate_first_fit with
                    // the same layout.
                    unsafe { self.fallback.deallocate(p, layout) };
                }
            }
        }
    }
}

/// Page-only bump allocator: every request is rounded up to whole pages.
/// Frees only decrement a live counter; when the last allocation goes, the
/// cursor resets. `realloc` through the facade copies into fresh pages, so
/// nothing leaks across a grow.
struct PageBumpAllocator {
    base: usize,
    end: usize,
    next: usize,
    live: usize,
}

impl PageBumpAllocator {
    const fn new() -> Self {
        Self {
            base: 0,
            end: 0,
            next: 0,
            live: 0,
        }
    }

    fn init(&mut self, base: usize, size: usize) {
        self.base = base;
        self.end = base + size;
        self.next = base;
        self.live = 0;
    }

    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let size = layout.size().next_multiple_of(super::PAGE_SIZE);
        let start = self.next.next_multiple_of(layout.align().max(super::PAGE_SIZE));
        if start + size > self.end {
            return ptr::null_mut();
        }
        self.next = start + size;
        self.live += 1;
        start as *mut u8
    }

    fn dealloc(&mut self) {
        self.live = self.live.saturating_sub(1);
        if self.live == 0 {
            self.next = self.base;
        }
    }
}

/// The global heap facade. Routes to whichever variant was armed at boot.
pub struct KernelHeap {
    selected: AtomicU8,
    freelist: Mutex<ListHeap>,
    sizeclass: Mutex<SizeClassAllocator>,
    pageonly: Mutex<PageBumpAllocator>,
}

const SEL_NONE: u8 = 0;
const SEL_FREELIST: u8 = 1;
const SEL_SIZECLASS: u8 = 2;
const SEL_PAGEONLY: u8 = 3;

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            selected: AtomicU8::new(SEL_NONE),
            freelist: Mutex::new(ListHeap::empty()),
            sizeclass: Mutex::new(SizeClassAllocator::new()),
            pageonly: Mutex::new(PageBumpAllocator::new()),
        }
    }

    /// Arm the selected variant over `[base, base+size)`. Called exactly
    /// once, at the end of the address-space build.
    ///
    /// # Safety
    ///
    /// The window must be mapped, writable kernel memory owned by the heap
    /// and nothing else.
    pub unsafe fn init(&self, kind: HeapKind, base: usize, size: usize) {
        match kind {
            HeapKind::FreeList => {
                // SAFETY: caller contract.
                unsafe { self.freelist.lock().init(base as *mut u8, size) };
                self.selected.store(SEL_FREELIST, Ordering::Release);
            }
            HeapKind::SizeClass => {
                // SAFETY: caller contract.
                unsafe { self.sizeclass.lock().init(base, size) };
                self.selected.store(SEL_SIZECLASS, Ordering::Release);
            }
            HeapKind::PageOnly => {
                self.pageonly.lock().init(base, size);
                self.selected.store(SEL_PAGEONLY, Ordering::Release);
            }
        }
        log::info!(target: "mm", "kernel heap armed: {:?}, {} KiB", kind, size / 1024);
    }

    pub fn kind(&self) -> Option<HeapKind> {
        match self.selected.load(Ordering::Acquire) {
            SEL_FREELIST => Some(HeapKind::FreeList),
            SEL_SIZECLASS => Some(HeapKind::SizeClass),
            SEL_PAGEONLY => Some(HeapKind::PageOnly),
            _ => None,
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: all paths allocate through a selected variant guarded by its own
// lock; alloc zeroes the block before returning it.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = match self.selected.load(Ordering::Acquire) {
            SEL_FREELIST => self
                .freelist
                .lock()
                .allocate_first_fit(layout)
                .map(|p| p.as_ptr())
                .unwrap_or(ptr::null_mut()),
            SEL_SIZECLASS => self.sizeclass.lock().alloc(layout),
            SEL_PAGEONLY => self.pageonly.lock().alloc(layout),
            _ => ptr::null_mut(),
        };
        if !ptr.is_null() {
            // Zero-initialized allocation is part of the heap contract.
            // SAFETY: the block spans at least layout.size() bytes.
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        if ptr_in.is_null() {
            return;
        }
        match self.selected.load(Ordering::Acquire) {
            SEL_FREELIST => {
                if let Some(p) = NonNull::new(ptr_in) {
                    // SAFETY: the block came from this heap with this layout.
                    unsafe { self.freelist.lock().deallocate(p, layout) };
                }
            }
            SEL_SIZECLASS => self.sizeclass.lock().dealloc(ptr_in, layout),
            SEL_PAGEONLY => self.pageonly.lock().dealloc(),
            _ => {}
        }
    }

    // The default `realloc` allocates, copies min(old, new) and frees the
    // old block; that is exactly the contract for every variant, including
    // page-only (fresh pages, copy, release).
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;
    use alloc::vec;

    use super::*;

    #[test]
    fn cmdline_selection() {
        assert_eq!(HeapKind::from_cmdline(""), HeapKind::FreeList);
        assert_eq!(
            HeapKind::from_cmdline("loglevel=debug allocator=pageonly"),
            HeapKind::PageOnly
        );
        assert_eq!(
            HeapKind::from_cmdline("allocator=sizeclass"),
            HeapKind::SizeClass
        );
        assert_eq!(
            HeapKind::from_cmdline("allocator=bogus"),
            HeapKind::FreeList
        );
    }

    #[test]
    fn class_selection() {
        let l = |size, align| Layout::from_size_align(size, align).expect("layout");
        assert_eq!(class_for(l(1, 1)), Some(0));
        assert_eq!(class_for(l(16, 8)), Some(0));
        assert_eq!(class_for(l(17, 1)), Some(1));
        assert_eq!(class_for(l(4096, 8)), Some(8));
        assert_eq!(class_for(l(4097, 8)), None);
        // Alignment dominates size when larger.
        assert_eq!(class_for(l(8, 64)), Some(2));
    }

    #[test]
    fn sizeclass_reuses_freed_blocks() {
        let window = vec![0u8; 64 * 1024].leak();
        let mut sc = SizeClassAllocator::new();
        // SAFETY: the leaked window is exclusively ours.
        unsafe { sc.init(window.as_mut_ptr() as usize, window.len()) };

        let layout = Layout::from_size_align(48, 8).expect("layout");
        let a = sc.alloc(layout);
        assert!(!a.is_null());
        sc.dealloc(a, layout);
        let b = sc.alloc(layout);
        // alloc/free/alloc with no intervening allocations returns the
        // same block.
        assert_eq!(a, b);
    }

    #[test]
    fn page_bump_resets_when_idle() {
        let window = vec![0u8; 16 * super::super::PAGE_SIZE].leak();
        let mut pb = PageBumpAllocator::new();
        // Align the window start up to a page inside the buffer.
        let base = (window.as_mut_ptr() as usize).next_multiple_of(super::super::PAGE_SIZE);
        pb.init(base, 8 * super::super::PAGE_SIZE);

        let layout = Layout::from_size_align(100, 8).expect("layout");
        let a = pb.alloc(layout);
        assert!(!a.is_null());
        let b = pb.alloc(layout);
        assert_ne!(a, b);
        pb.dealloc();
        pb.dealloc();
        // All allocations released: the cursor resets.
        let c = pb.alloc(layout);
        assert_eq!(a, c);
    }
}
