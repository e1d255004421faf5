//! Scheduling

mod queue;
mod scheduler;

pub use queue::ReadyQueues;
pub use scheduler::{
    adopt_current, block_on_channel, current, current_process_id, current_thread_id, dequeue,
    enqueue, is_shutting_down, ready_count, reschedule, set_idle, signal_shutdown, sleep,
    spawn_ready, tick, wake_channel_waiters, wake_locked, yield_now,
};

use crate::{
    error::KernelResult,
    process::{Priority, PROCESS_TABLE},
};

/// Entry of the idle thread: wait for interrupts forever.
extern "C" fn idle_loop() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        crate::arch::x86_64::wait_for_interrupt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}

/// Create the kernel process and its idle thread. Timer ticks start the
/// actual multiplexing once interrupts are on.
pub fn init() -> KernelResult<()> {
    let mut table = PROCESS_TABLE.lock();
    let kernel_pid = table.init_kernel_process()?;
    let idle_tid = table.create_kernel_thread(kernel_pid, idle_loop as usize as u64, Priority::Idle)?;
    set_idle(idle_tid);
    log::info!(target: "sched", "scheduler ready, idle thread {}", idle_tid);
    Ok(())
}

/// Hand the bootstrap CPU to the scheduler. The boot context is abandoned
/// at the first switch; from then on the timer drives everything.
pub fn run() -> ! {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::enable_interrupts();
    loop {
        #[cfg(target_arch = "x86_64")]
        crate::arch::x86_64::wait_for_interrupt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}
