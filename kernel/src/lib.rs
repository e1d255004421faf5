//! FerriteOS kernel
//!
//! Execution substrate of a small general-purpose kernel for x86_64:
//! physical and virtual memory management, tasking and scheduling, trap
//! entry and crash handling, a native plus Linux-subset syscall surface,
//! IPC channels, and the narrow VFS capability the file-descriptor
//! syscalls consume.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host builds (unit tests, tooling) link std and use its allocator; bare
// metal routes the global allocator through the boot-selected kernel heap.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::heap::KernelHeap = mm::heap::KernelHeap::new();

#[cfg(not(target_os = "none"))]
static KERNEL_HEAP: mm::heap::KernelHeap = mm::heap::KernelHeap::new();

/// The boot-selected heap facade (armed by the address-space builder).
pub fn kernel_heap() -> &'static mm::heap::KernelHeap {
    &KERNEL_HEAP
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod crash;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;

#[cfg(not(target_os = "none"))]
pub mod test_support;

// Re-exports the integration tests and the binary lean on.
pub use error::{Errno, KernelError, KernelResult};
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use process::{Priority, ProcessId, TaskState, ThreadId};

/// Bring the core up in dependency order and hand the CPU to the
/// scheduler: frame allocator and kernel address space first (with the
/// heap armed at the end of the build), then the trap gateway and timer,
/// then the filesystem capability and the scheduler.
pub fn bootstrap(boot: boot::BootInfo) -> ! {
    logger::init(boot.cmdline());
    println!(
        "FerriteOS {} ({}) booting",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let sections = mm::layout::SectionMap::single(
        if boot.kernel_virt_base != 0 {
            boot.kernel_virt_base
        } else {
            boot.kernel_base
        },
        boot.kernel_base,
        boot.kernel_size,
    );
    if let Err(e) = mm::layout::build(&boot, &sections) {
        panic!("address-space build failed: {}", e);
    }

    arch::init();
    fs::ram::init();
    if let Err(e) = sched::init() {
        panic!("scheduler init failed: {}", e);
    }

    log::info!(target: "boot", "core online, entering the scheduler");
    sched::run()
}

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
