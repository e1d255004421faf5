//! Host-test bring-up
//!
//! Unit tests run against the same global kernel state the bare-metal
//! boot uses; this module performs a synthetic boot exactly once: frame
//! allocator over fake RAM, kernel address space, ram filesystem, kernel
//! process and a current thread. Tests that depend on the scheduler's
//! "current" slot serialize through [`lock_scheduling`].

#![cfg(not(target_os = "none"))]

extern crate alloc;

use spin::{Mutex, MutexGuard, Once};

use crate::{
    boot::{BootInfo, MemoryRegion, RegionKind},
    fs,
    mm::{layout, FRAME_ALLOCATOR, PAGE_SIZE},
    process::{Compat, Priority, ProcessId, Security, ThreadId, PROCESS_TABLE},
    sched,
};

static BOOT: Once<()> = Once::new();
static SCHED_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Synthetic-boot region: 256 MiB of fake RAM at the 1 GiB mark, clear of
/// the frame ranges the self-contained mm tests use.
const TEST_RAM_BASE: u64 = 0x4000_0000;
const TEST_RAM_SIZE: u64 = 0x1000_0000;

/// One-shot synthetic boot for the host test process.
pub fn ensure_boot() {
    BOOT.call_once(|| {
        let mut boot = BootInfo::empty();
        boot.push_region(MemoryRegion {
            base: 0,
            length: TEST_RAM_BASE,
            kind: RegionKind::Reserved,
        });
        boot.push_region(MemoryRegion {
            base: TEST_RAM_BASE,
            length: TEST_RAM_SIZE,
            kind: RegionKind::Usable,
        });
        boot.kernel_base = TEST_RAM_BASE;
        boot.kernel_size = 64 * PAGE_SIZE as u64;
        boot.set_cmdline("loglevel=off");

        let sections =
            layout::SectionMap::single(boot.kernel_base, boot.kernel_base, boot.kernel_size);
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            layout::build_in(&boot, &sections, &mut frames, false)
                .expect("synthetic address-space build");
        }

        fs::ram::init();

        let mut table = PROCESS_TABLE.lock();
        let kernel_pid = table
            .init_kernel_process()
            .expect("kernel process for tests");
        let boot_tid = table
            .create_kernel_thread(kernel_pid, 0, Priority::Normal)
            .expect("boot thread for tests");
        drop(table);
        sched::adopt_current(kernel_pid, boot_tid);
    });
}

/// Serialize tests that reroute the scheduler's current slot.
pub fn lock_scheduling() -> MutexGuard<'static, ()> {
    ensure_boot();
    SCHED_TEST_LOCK.lock()
}

/// A user process with one thread (mapped stack, argv laid out), adopted
/// as current. Caller holds the [`lock_scheduling`] guard.
pub fn spawn_user_process(name: &str) -> (ProcessId, ThreadId) {
    ensure_boot();
    let mut table = PROCESS_TABLE.lock();
    let pid = table
        .create_process(None, name, Security::user(1000, 1000), Compat::Native)
        .expect("test user process");
    let tid = table
        .create_user_thread(
            pid,
            0x40_0000,
            &[name],
            &["PATH=/bin"],
            &[(6, PAGE_SIZE as u64)],
            Priority::Normal,
        )
        .expect("test user thread");
    drop(table);
    sched::adopt_current(pid, tid);
    (pid, tid)
}

/// Tear a test process down completely.
pub fn destroy_process(pid: ProcessId) {
    let mut table = PROCESS_TABLE.lock();
    let _ = crate::process::lifecycle::exit_process(&mut table, pid, 0);
    let _ = table.reap(pid);
}
