//! Software timers over the ARM generic timer.
//!
//! A single list of future tasks sorted by absolute trigger tick. The
//! comparator always holds the head's trigger (or a far-future sentinel
//! when the list is empty). The timer IRQ pops the expired head and
//! re-inserts it as a deferred IRQ task, so timer callbacks run at
//! deferred-task priority rather than in IRQ context.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::arch;
use crate::config::TIMER_IDLE_SECONDS;
use crate::sync;

/// Timer callbacks are plain function pointers with one word of argument;
/// they run as deferred IRQ tasks.
pub type TimerCallback = fn(u64);

/// A future task keyed by absolute tick.
#[derive(Debug, Clone, Copy)]
pub struct TimerTask {
    pub trigger: u64,
    pub callback: TimerCallback,
    pub arg: u64,
    /// Deferred-task priority once the trigger fires. `-1` also selects
    /// tick (not second) units for the delay at insertion time.
    pub priority: i32,
}

/// Trigger-sorted task list.
pub struct TimerQueue {
    tasks: VecDeque<TimerTask>,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    /// Insert keeping ascending trigger order; equal triggers keep
    /// insertion order.
    pub fn insert(&mut self, task: TimerTask) {
        let pos = self
            .tasks
            .iter()
            .position(|t| t.trigger > task.trigger)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, task);
    }

    pub fn pop_front(&mut self) -> Option<TimerTask> {
        self.tasks.pop_front()
    }

    pub fn head_trigger(&self) -> Option<u64> {
        self.tasks.front().map(|t| t.trigger)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

static TIMER_QUEUE: Mutex<TimerQueue> = Mutex::new(TimerQueue::new());

/// Start the timer subsystem: EL0 counter access, far-future comparator,
/// IRQ routed and enabled.
pub fn init() {
    arch::timer_allow_el0_access();
    program_comparator(&TIMER_QUEUE.lock());
    arch::timer_enable();
}

/// Point the hardware comparator at the next event.
fn program_comparator(queue: &TimerQueue) {
    let now = arch::timer_count();
    let cval = match queue.head_trigger() {
        Some(trigger) => trigger.max(now),
        None => now + TIMER_IDLE_SECONDS * arch::timer_freq(),
    };
    arch::timer_set_compare(cval);
}

/// Schedule `callback(arg)` after `delay`. With `priority >= 0` the delay
/// is in seconds; `priority == -1` means `delay` is already in ticks.
pub fn add_task(delay: u64, callback: TimerCallback, arg: u64, priority: i32) {
    let now = arch::timer_count();
    let trigger = if priority == -1 {
        now + delay
    } else {
        now + delay * arch::timer_freq()
    };
    sync::lock();
    {
        let mut queue = TIMER_QUEUE.lock();
        queue.insert(TimerTask {
            trigger,
            callback,
            arg,
            priority,
        });
        program_comparator(&queue);
    }
    sync::unlock();
}

/// Timer IRQ: hand the expired head to the deferred-task queue and re-arm
/// the comparator for whatever is next.
pub fn handle_tick() {
    sync::lock();
    {
        let mut queue = TIMER_QUEUE.lock();
        if let Some(task) = queue.pop_front() {
            crate::irq::enqueue(task.callback, task.arg, task.priority);
        }
        program_comparator(&queue);
    }
    sync::unlock();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn cb(_arg: u64) {}

    fn task(trigger: u64, priority: i32) -> TimerTask {
        TimerTask {
            trigger,
            callback: cb,
            arg: 0,
            priority,
        }
    }

    #[test]
    fn inserts_keep_trigger_order() {
        let mut q = TimerQueue::new();
        q.insert(task(30, 0));
        q.insert(task(10, 0));
        q.insert(task(20, 0));
        assert_eq!(q.head_trigger(), Some(10));
        assert_eq!(q.pop_front().map(|t| t.trigger), Some(10));
        assert_eq!(q.pop_front().map(|t| t.trigger), Some(20));
        assert_eq!(q.pop_front().map(|t| t.trigger), Some(30));
        assert!(q.is_empty());
    }

    #[test]
    fn equal_triggers_preserve_insertion_order() {
        let mut q = TimerQueue::new();
        q.insert(task(5, 1));
        q.insert(task(5, 2));
        q.insert(task(5, 3));
        let order: alloc::vec::Vec<i32> =
            core::iter::from_fn(|| q.pop_front().map(|t| t.priority)).collect();
        assert_eq!(order, alloc::vec![1, 2, 3]);
    }
}
