//! Memory end-to-end scenarios through the syscall surface: mmap
//! boundaries, mprotect semantics, fork copy-on-write isolation.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
fn main() {
    host::run();
}

#[cfg(not(target_os = "none"))]
mod host {
    use ferrite_kernel::{
        arch::TrapFrame,
        crash::user::{resolve_user_fault, Resolution},
        error::Errno,
        mm::{user, vma::VmaFlags, VirtualAddress, PAGE_SIZE},
        process::{ProcessId, Signal, PROCESS_TABLE},
        syscall::{shared, Outcome},
        test_support,
    };

    pub fn run() {
        mmap_boundaries();
        mprotect_scenario();
        fork_cow_scenario();
        println!("memory_tests: all tests passed");
    }

    fn write_byte(pid: ProcessId, va: u64, byte: u8) {
        let table = PROCESS_TABLE.lock();
        let process = table.process(pid).expect("pcb");
        user::copy_to_user(&process.memory.space, VirtualAddress::new(va), &[byte])
            .expect("write byte");
    }

    fn read_byte(pid: ProcessId, va: u64) -> u8 {
        let table = PROCESS_TABLE.lock();
        let process = table.process(pid).expect("pcb");
        let mut buf = [0u8; 1];
        user::copy_from_user(&process.memory.space, VirtualAddress::new(va), &mut buf)
            .expect("read byte");
        buf[0]
    }

    fn mmap_boundaries() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("mmap-bounds");

        // len == 0 is EINVAL.
        let r = shared::sys_mmap(0, 0, VmaFlags::READ | VmaFlags::WRITE, false, true, -1, 0);
        assert_eq!(r.map_err(Errno::from), Err(Errno::EINVAL));

        // MAP_FIXED with an unaligned address is EINVAL.
        let r = shared::sys_mmap(
            0x4000_0123,
            PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
            true,
            true,
            -1,
            0,
        );
        assert_eq!(r.map_err(Errno::from), Err(Errno::EINVAL));

        // munmap of a kernel-half page is ENOMEM.
        let r = shared::sys_munmap(0xFFFF_8000_0000_0000, PAGE_SIZE as u64);
        assert_eq!(r.map_err(Errno::from), Err(Errno::ENOMEM));

        // A proper anonymous mapping lands, zero-filled.
        let base = shared::sys_mmap(
            0,
            2 * PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
            false,
            true,
            -1,
            0,
        )
        .expect("anonymous mmap") as u64;
        assert_eq!(base % PAGE_SIZE as u64, 0);
        assert_eq!(read_byte(pid, base), 0);

        test_support::destroy_process(pid);
    }

    fn mprotect_scenario() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("mprotect");

        // mmap(4096, RW, ANON) -> A; *A = 1 succeeds.
        let a = shared::sys_mmap(
            0x4000_0000,
            PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
            true,
            true,
            -1,
            0,
        )
        .expect("mmap") as u64;
        write_byte(pid, a, 1);
        assert_eq!(read_byte(pid, a), 1);

        // mprotect(A, 4096, R); a write now faults to SIGSEGV.
        shared::sys_mprotect(a, PAGE_SIZE as u64, VmaFlags::READ).expect("mprotect");
        {
            let table = PROCESS_TABLE.lock();
            let process = table.process(pid).expect("pcb");
            assert!(user::copy_to_user(&process.memory.space, VirtualAddress::new(a), &[2]).is_err());
        }
        let mut table = PROCESS_TABLE.lock();
        // Present + write + user: a protection fault, not COW, not stack.
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, 0b111, a),
            Resolution::Signaled(Signal::SIGSEGV)
        );
        drop(table);

        // mprotect is idempotent: P1 then P2 == P2.
        shared::sys_mprotect(a, PAGE_SIZE as u64, VmaFlags::READ | VmaFlags::WRITE)
            .expect("restore");
        shared::sys_mprotect(a, PAGE_SIZE as u64, VmaFlags::READ | VmaFlags::WRITE)
            .expect("repeat");
        write_byte(pid, a, 3);
        assert_eq!(read_byte(pid, a), 3);

        test_support::destroy_process(pid);
    }

    /// End-to-end: parent maps a page at 0x40000000, writes 0xAB, forks;
    /// the child sees 0xAB, writes 0xCD through the COW path, and the
    /// parent still reads 0xAB.
    fn fork_cow_scenario() {
        let _guard = test_support::lock_scheduling();
        let (parent, _tid) = test_support::spawn_user_process("cow-parent");

        let addr = shared::sys_mmap(
            0x4000_0000,
            PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
            true,
            true,
            -1,
            0,
        )
        .expect("map page") as u64;
        write_byte(parent, addr, 0xAB);

        // fork through the syscall layer with the live frame.
        let mut frame = TrapFrame::zeroed();
        let child = match shared::sys_fork(&mut frame) {
            Outcome::Done(pid) if pid > 0 => ProcessId(pid as u32),
            other => panic!("fork failed: {:?}", other),
        };

        // Child reads 0xAB through the shared read-only frame.
        assert_eq!(read_byte(child, addr), 0xAB);
        {
            let table = PROCESS_TABLE.lock();
            let p = table.process(parent).expect("parent pcb");
            let c = table.process(child).expect("child pcb");
            use ferrite_kernel::mm::PageFlags;
            assert!(!p
                .memory
                .space
                .check(VirtualAddress::new(addr), PageFlags::WRITABLE));
            assert!(!c
                .memory
                .space
                .check(VirtualAddress::new(addr), PageFlags::WRITABLE));
        }

        // Child write: COW fault resolves, then the write lands.
        {
            let mut table = PROCESS_TABLE.lock();
            assert_eq!(
                resolve_user_fault(&mut table, child, 14, 0b111, addr),
                Resolution::Resumed
            );
        }
        write_byte(child, addr, 0xCD);

        assert_eq!(read_byte(parent, addr), 0xAB, "parent unaffected by child write");
        assert_eq!(read_byte(child, addr), 0xCD);

        test_support::destroy_process(child);
        test_support::destroy_process(parent);
    }
}

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ferrite_kernel::serial_println!("memory_tests: bare-metal image alive");
        loop {
            core::hint::spin_loop();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        ferrite_kernel::serial_println!("memory_tests panic: {}", info);
        loop {
            core::hint::spin_loop();
        }
    }
}
