//! Threads and the round-robin scheduler.

pub mod exec;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    current_pid, exit_current, idle_loop, init, kill_zombies, runnable_count, schedule,
    thread_create, with_current, with_thread, SCHEDULER,
};
pub use task::{Pid, Thread, ThreadState};

use crate::config::SCHED_TICK_SHIFT;

/// Timer callback driving preemption: re-arms itself every
/// `freq >> SCHED_TICK_SHIFT` ticks. The actual `schedule()` call happens
/// in the IRQ router once it sees more than one runnable thread.
pub fn schedule_tick(_arg: u64) {
    let interval = crate::arch::timer_freq() >> SCHED_TICK_SHIFT;
    crate::timer::add_task(interval, schedule_tick, 0, -1);
}
