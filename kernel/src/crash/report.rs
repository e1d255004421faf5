//! Crash report and diagnostic screens
//!
//! A kernel-mode fault means the kernel is dead: secondary CPUs are
//! stopped, the machine state is snapshotted into a [`CrashReport`], and a
//! set of text screens (main, details, frames, tasks, console) is rendered
//! into the console sink before the CPU halts. The "frames" screen walks
//! the trap gateway's saved-IP ring.

use crate::arch::{self, RingEntry, TrapFrame, FRAME_RING_SIZE};
use crate::process::PROCESS_TABLE;

/// Everything the screens render, captured in one pass before any output.
pub struct CrashReport {
    pub reason: &'static str,
    pub frame: TrapFrame,
    pub ring: [RingEntry; FRAME_RING_SIZE],
    pub ring_len: usize,
    #[cfg(target_arch = "x86_64")]
    pub control: crate::arch::x86_64::mmu::ControlRegisters,
}

impl CrashReport {
    pub fn capture(frame: &TrapFrame, reason: &'static str) -> Self {
        let (ring, ring_len) = arch::ring_snapshot();
        Self {
            reason,
            frame: *frame,
            ring,
            ring_len,
            #[cfg(target_arch = "x86_64")]
            control: crate::arch::x86_64::mmu::snapshot_control_registers(),
        }
    }
}

/// Ask other CPUs to stop. BSP-only boots have nobody to signal; an SMP
/// bring-up hooks its IPI here.
fn stop_other_cpus() {
    log::error!(target: "crash", "halting secondary CPUs");
}

fn screen_main(report: &CrashReport) {
    println!();
    println!("==================== KERNEL CRASH ====================");
    println!("reason : {}", report.reason);
    println!(
        "vector : {}  error code {:#06x}",
        report.frame.vector, report.frame.error_code
    );
    println!(
        "rip    : {:#018x}  {}",
        report.frame.rip,
        if report.frame.from_user() { "(user)" } else { "(kernel)" }
    );
    println!("rsp    : {:#018x}", report.frame.rsp);
}

fn screen_details(report: &CrashReport) {
    println!("-------------------- details ------------------------");
    let f = &report.frame;
    println!("rax {:#018x} rbx {:#018x} rcx {:#018x}", f.rax, f.rbx, f.rcx);
    println!("rdx {:#018x} rsi {:#018x} rdi {:#018x}", f.rdx, f.rsi, f.rdi);
    println!("rbp {:#018x} r8  {:#018x} r9  {:#018x}", f.rbp, f.r8, f.r9);
    println!("r10 {:#018x} r11 {:#018x} r12 {:#018x}", f.r10, f.r11, f.r12);
    println!("r13 {:#018x} r14 {:#018x} r15 {:#018x}", f.r13, f.r14, f.r15);
    println!(
        "cs {:#06x} ss {:#06x} rflags {:#018x}",
        f.cs, f.ss, f.rflags
    );
    #[cfg(target_arch = "x86_64")]
    {
        let c = &report.control;
        println!(
            "cr0 {:#018x} cr2 {:#018x} cr3 {:#018x} cr4 {:#018x}",
            c.cr0, c.cr2, c.cr3, c.cr4
        );
    }
}

fn screen_frames(report: &CrashReport) {
    println!("-------------------- frames -------------------------");
    if report.ring_len == 0 {
        println!("(no recorded interrupt frames)");
        return;
    }
    for (i, entry) in report.ring[..report.ring_len].iter().enumerate() {
        println!(
            "#{:02} vector {:3} rip {:#018x} err {:#06x}",
            i, entry.vector, entry.rip, entry.error_code
        );
    }
}

fn screen_tasks() {
    println!("-------------------- tasks --------------------------");
    // try_lock: the fault may have interrupted a table-lock holder.
    let Some(table) = PROCESS_TABLE.try_lock() else {
        println!("(process table locked; skipping)");
        return;
    };
    for pid in table.pids() {
        if let Some(process) = table.process(pid) {
            println!(
                "pid {:4} {:24} {:?} threads {} critical {}",
                pid.0,
                process.name,
                process.state,
                process.threads.len(),
                process.security.critical
            );
        }
    }
    let counts = table.thread_counts();
    println!(
        "threads: {} ready, {} running, {} sleeping, {} blocked, {} waiting, {} zombie",
        counts.ready, counts.running, counts.sleeping, counts.blocked, counts.waiting, counts.zombie
    );
}

fn screen_console(report: &CrashReport) {
    println!("-------------------- console ------------------------");
    println!(
        "kernel {} ({}) built {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );
    println!("crash at rip {:#018x}; system halted", report.frame.rip);
    println!("======================================================");
}

/// The terminal path for kernel-mode faults. Renders every screen and
/// halts; nothing returns from here.
pub fn kernel_panic(frame: &TrapFrame, reason: &'static str) -> ! {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::disable_interrupts();
    stop_other_cpus();

    let report = CrashReport::capture(frame, reason);
    screen_main(&report);
    screen_details(&report);
    screen_frames(&report);
    screen_tasks();
    screen_console(&report);

    crate::arch::halt();
}

/// Rust panic entry: fabricate a frame from the panic site so the report
/// machinery is shared.
pub fn panic_report(info: &core::panic::PanicInfo) -> ! {
    log::error!(target: "crash", "kernel panic: {}", info);
    let frame = TrapFrame::zeroed();
    kernel_panic(&frame, "rust panic");
}
