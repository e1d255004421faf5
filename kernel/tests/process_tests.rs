//! Process lifecycle end-to-end: wait/zombie/reap, thread accounting,
//! context switching through frames, sleep deadlines, and the execve
//! shebang rewrite.

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
        error::Errno,
        fs::ram,
        mm::{user, vma::VmaFlags, VirtualAddress, PAGE_SIZE},
        process::{lifecycle, ProcessId, TaskState, PROCESS_TABLE},
        sched,
        syscall::{shared, Outcome},
        test_support,
    };

    pub fn run() {
        wait_reaps_zombie_child();
        wait_rejects_non_children();
        thread_count_bookkeeping();
        context_switch_swaps_frames();
        sleep_honors_deadline();
        file_syscalls_roundtrip();
        execve_shebang_rewrites_argv();
        shutdown_drains_everything();
        println!("process_tests: all tests passed");
    }

    fn status_page(pid: ProcessId) -> u64 {
        let _ = pid;
        shared::sys_mmap(
            0,
            PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
            false,
            true,
            -1,
            0,
        )
        .expect("status page") as u64
    }

    fn wait_reaps_zombie_child() {
        let _guard = test_support::lock_scheduling();
        let (parent, _tid) = test_support::spawn_user_process("wait-parent");
        let status_out = status_page(parent);

        // Fork a child, then terminate it with code 7.
        let mut frame = TrapFrame::zeroed();
        let child = match shared::sys_fork(&mut frame) {
            Outcome::Done(pid) if pid > 0 => ProcessId(pid as u32),
            other => panic!("fork failed: {:?}", other),
        };
        {
            let mut table = PROCESS_TABLE.lock();
            lifecycle::exit_process(&mut table, child, 7).expect("child exit");
            assert_eq!(
                table.process(child).map(|p| p.state),
                Some(TaskState::Zombie),
                "exited child is a zombie until reaped"
            );
        }

        // wait() reaps it and delivers the encoded status.
        let outcome = shared::sys_wait(&mut frame, child.0 as i64, status_out, 0);
        assert_eq!(outcome, Outcome::Done(child.0 as i64));
        {
            let table = PROCESS_TABLE.lock();
            assert!(table.process(child).is_none(), "reaped slot is gone");
            let parent_proc = table.process(parent).expect("parent pcb");
            let mut raw = [0u8; 4];
            user::copy_from_user(
                &parent_proc.memory.space,
                VirtualAddress::new(status_out),
                &mut raw,
            )
            .expect("status readback");
            assert_eq!(i32::from_le_bytes(raw), 7 << 8);
        }

        test_support::destroy_process(parent);
    }

    fn wait_rejects_non_children() {
        let _guard = test_support::lock_scheduling();
        let (parent, _tid) = test_support::spawn_user_process("echild");

        // No children at all.
        let mut frame = TrapFrame::zeroed();
        let outcome = shared::sys_wait(&mut frame, -1, 0, 0);
        assert_eq!(outcome, Outcome::Done(Errno::ECHILD.as_ret()));

        // A pid that exists but is not our child.
        let (stranger, _t) = {
            let mut table = PROCESS_TABLE.lock();
            let pid = table
                .create_process(
                    None,
                    "stranger",
                    ferrite_kernel::process::Security::user(1000, 1000),
                    ferrite_kernel::process::Compat::Native,
                )
                .expect("stranger");
            (pid, ())
        };
        // Give the caller one child so the ECHILD really tests lineage.
        let child = match shared::sys_fork(&mut frame) {
            Outcome::Done(pid) if pid > 0 => ProcessId(pid as u32),
            other => panic!("fork failed: {:?}", other),
        };
        let outcome = shared::sys_wait(&mut frame, stranger.0 as i64, 0, 0);
        assert_eq!(outcome, Outcome::Done(Errno::ECHILD.as_ret()));

        test_support::destroy_process(child);
        test_support::destroy_process(stranger);
        test_support::destroy_process(parent);
    }

    fn thread_count_bookkeeping() {
        let _guard = test_support::lock_scheduling();
        let table = PROCESS_TABLE.lock();
        let counts = table.thread_counts();
        let in_states = counts.ready
            + counts.running
            + counts.sleeping
            + counts.blocked
            + counts.stopped
            + counts.waiting
            + counts.zombie
            + counts.terminated;
        assert_eq!(
            in_states,
            counts.allocated - counts.reaped,
            "every allocated, unreaped TCB sits in exactly one state"
        );
    }

    fn context_switch_swaps_frames() {
        let _guard = test_support::lock_scheduling();
        let (pid, main_tid) = test_support::spawn_user_process("switcher");

        // A second Ready thread with a recognizable frame.
        let second = {
            let mut table = PROCESS_TABLE.lock();
            let tid = table
                .create_user_thread(pid, 0x41_0000, &[], &[], &[], ferrite_kernel::Priority::Normal)
                .expect("second thread");
            sched::spawn_ready(&mut table, tid).expect("enqueue");
            tid
        };

        // The running thread yields: the live frame must become the
        // second thread's fabricated one.
        let mut frame = TrapFrame::new_user(0x40_0000, 0x7FFF_FFFF_E000);
        sched::yield_now(&mut frame);
        assert_eq!(frame.rip, 0x41_0000, "frame now belongs to the next thread");
        assert_eq!(sched::current(), Some((pid, second)));

        // The old thread's state was stored into its TCB.
        {
            let table = PROCESS_TABLE.lock();
            let old = table.thread(main_tid).expect("old tcb");
            assert_eq!(old.frame.rip, 0x40_0000);
            assert_eq!(old.state, TaskState::Ready);
        }

        // Yield again: round-robin returns to the first thread.
        sched::yield_now(&mut frame);
        assert_eq!(sched::current(), Some((pid, main_tid)));
        assert_eq!(frame.rip, 0x40_0000);

        test_support::destroy_process(pid);
    }

    fn sleep_honors_deadline() {
        let _guard = test_support::lock_scheduling();
        let (pid, tid) = test_support::spawn_user_process("sleeper");

        let mut frame = TrapFrame::new_user(0x40_0000, 0x7FFF_FFFF_E000);
        sched::sleep(&mut frame, 5);
        {
            let table = PROCESS_TABLE.lock();
            assert_eq!(table.thread(tid).map(|t| t.state), Some(TaskState::Sleeping));
        }

        // Two ticks: not yet due.
        ferrite_kernel::arch::x86_64::timer::advance(2);
        sched::tick(&mut frame);
        {
            let table = PROCESS_TABLE.lock();
            assert_eq!(table.thread(tid).map(|t| t.state), Some(TaskState::Sleeping));
        }

        // Past the deadline: re-Readied (and likely re-run).
        ferrite_kernel::arch::x86_64::timer::advance(5);
        sched::tick(&mut frame);
        {
            let table = PROCESS_TABLE.lock();
            let state = table.thread(tid).map(|t| t.state);
            assert!(
                state == Some(TaskState::Ready) || state == Some(TaskState::Running),
                "woken thread is runnable again, got {:?}",
                state
            );
        }

        let _ = pid;
        test_support::destroy_process(pid);
    }

    /// Open/read/write/seek through the full syscall path: pointers in
    /// user memory, descriptors in the process table, bytes in the ram
    /// filesystem.
    fn file_syscalls_roundtrip() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("filer");

        // A scratch page holding the path and an I/O buffer.
        let page = status_page(pid);
        {
            let table = PROCESS_TABLE.lock();
            let process = table.process(pid).expect("pcb");
            user::copy_to_user(
                &process.memory.space,
                VirtualAddress::new(page),
                b"/tmp/roundtrip-file\0",
            )
            .expect("path into user memory");
        }

        let fd = shared::sys_open(
            page,
            ferrite_kernel::fs::OpenFlags::READ
                | ferrite_kernel::fs::OpenFlags::WRITE
                | ferrite_kernel::fs::OpenFlags::CREATE,
            0o644,
        )
        .expect("open") as u64;
        assert!(fd >= 3, "stdio descriptors stay reserved");

        // Write through a user buffer.
        let buf = page + 0x100;
        {
            let table = PROCESS_TABLE.lock();
            let process = table.process(pid).expect("pcb");
            user::copy_to_user(&process.memory.space, VirtualAddress::new(buf), b"payload")
                .expect("payload");
        }
        assert_eq!(shared::sys_write(fd, buf, 7).expect("write"), 7);

        // lseek(fd, 0, CUR) reports the cursor without moving it.
        use ferrite_kernel::fs::Whence;
        assert_eq!(
            shared::sys_lseek(fd, 0, Whence::Current).expect("tell"),
            7
        );
        assert_eq!(
            shared::sys_lseek(fd, 0, Whence::Current).expect("tell again"),
            7
        );

        // Rewind and read the payload back.
        assert_eq!(shared::sys_lseek(fd, 0, Whence::Set).expect("rewind"), 0);
        let readback = page + 0x200;
        assert_eq!(shared::sys_read(fd, readback, 7).expect("read"), 7);
        {
            let table = PROCESS_TABLE.lock();
            let process = table.process(pid).expect("pcb");
            let mut out = [0u8; 7];
            user::copy_from_user(
                &process.memory.space,
                VirtualAddress::new(readback),
                &mut out,
            )
            .expect("readback");
            assert_eq!(&out, b"payload");
        }

        // Open without O_CREAT on a missing path is ENOENT.
        {
            let table = PROCESS_TABLE.lock();
            let process = table.process(pid).expect("pcb");
            user::copy_to_user(
                &process.memory.space,
                VirtualAddress::new(page),
                b"/no/such/file\0",
            )
            .expect("missing path");
        }
        let err = shared::sys_open(page, ferrite_kernel::fs::OpenFlags::READ, 0)
            .expect_err("missing file");
        assert_eq!(Errno::from(err), Errno::ENOENT);

        shared::sys_close(fd).expect("close");
        test_support::destroy_process(pid);
    }

    /// End-to-end: /bin/foo starts with "#!/bin/sh -x"; exec with
    /// [foo, bar] leaves the new program seeing argv
    /// [/bin/sh, -x, /bin/foo, bar].
    fn execve_shebang_rewrites_argv() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("shebang");

        // Seed the filesystem: a real ELF for /bin/sh, a script for
        // /bin/foo. The ELF builder is the kernel's own test image.
        ram::add_file("/bin/foo", b"#!/bin/sh -x\necho hi\n");
        ram::add_file("/bin/sh", &elf_image());

        let mut frame = TrapFrame::zeroed();
        shared::exec_image(
            &mut frame,
            String::from("/bin/foo"),
            vec![String::from("foo"), String::from("bar")],
            vec![],
        )
        .expect("exec through the shebang");

        // The frame starts the interpreter.
        assert_eq!(frame.rip, 0x40_1000);
        assert!(frame.rsp > 0);

        // Walk the fresh stack: argc, then the argv pointers.
        let table = PROCESS_TABLE.lock();
        let process = table.process(pid).expect("pcb");
        let space = &process.memory.space;

        let mut word = [0u8; 8];
        user::copy_from_user(space, VirtualAddress::new(frame.rsp), &mut word).expect("argc");
        let argc = u64::from_le_bytes(word);
        assert_eq!(argc, 4);

        let mut argv = Vec::new();
        for i in 0..argc {
            user::copy_from_user(
                space,
                VirtualAddress::new(frame.rsp + 8 + i * 8),
                &mut word,
            )
            .expect("argv slot");
            let ptr = u64::from_le_bytes(word);
            let mut buf = [0u8; 64];
            let len = user::copy_string_from_user(space, VirtualAddress::new(ptr), &mut buf, 64)
                .expect("argv string");
            argv.push(String::from_utf8_lossy(&buf[..len]).into_owned());
        }
        assert_eq!(argv, vec!["/bin/sh", "-x", "/bin/foo", "bar"]);

        drop(table);
        test_support::destroy_process(pid);
    }

    /// Minimal valid ET_EXEC image, entry 0x40_1000 (mirrors the
    /// in-crate ELF test builder, which is not visible to integration
    /// tests).
    fn elf_image() -> Vec<u8> {
        let code = [0x48u8, 0x31, 0xC0, 0xC3];
        let mut image = vec![0u8; 0x1000 + code.len()];
        image[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[4] = 2; // 64-bit
        image[5] = 1; // little endian
        image[6] = 1; // version
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // x86_64
        image[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes());
        image[32..40].copy_from_slice(&64u64.to_le_bytes());
        image[54..56].copy_from_slice(&56u16.to_le_bytes());
        image[56..58].copy_from_slice(&1u16.to_le_bytes());
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes()); // R+X
        image[ph + 8..ph + 16].copy_from_slice(&0x1000u64.to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&0x40_1000u64.to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64).to_le_bytes());
        image[0x1000..].copy_from_slice(&code);
        image
    }

    fn shutdown_drains_everything() {
        let _guard = test_support::lock_scheduling();
        let (pid, tid) = test_support::spawn_user_process("doomed");
        sched::enqueue(tid, ferrite_kernel::Priority::Normal);

        sched::signal_shutdown();
        assert!(sched::is_shutting_down());
        assert_eq!(sched::ready_count(), 0, "queues drained");
        {
            let table = PROCESS_TABLE.lock();
            assert_eq!(
                table.process(pid).map(|p| p.state),
                Some(TaskState::Terminated)
            );
        }
    }
}

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ferrite_kernel::serial_println!("process_tests: bare-metal image alive");
        loop {
            core::hint::spin_loop();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        ferrite_kernel::serial_println!("process_tests panic: {}", info);
        loop {
            core::hint::spin_loop();
        }
    }
}
