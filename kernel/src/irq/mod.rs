//! IRQ routing and the preemptive deferred-task queue.
//!
//! The IRQ vector identifies the source (UART RX/TX, core timer), enqueues
//! a deferred task and drains the queue. While a task of priority `p` runs,
//! only tasks with priority strictly below `p` may preempt it; the "nothing
//! running" priority is 999. Callbacks execute with interrupts re-enabled.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::config::IDLE_IRQ_PRIORITY;
use crate::sync;

/// Deferred work posted by an interrupt.
#[derive(Debug, Clone, Copy)]
pub struct IrqTask {
    /// Lower value = more urgent; may be negative (timer bootstrap)
    pub priority: i32,
    pub callback: fn(u64),
    pub arg: u64,
}

/// Ascending-priority queue, FIFO among equals.
pub struct IrqTaskQueue {
    tasks: VecDeque<IrqTask>,
}

impl IrqTaskQueue {
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, task: IrqTask) {
        let pos = self
            .tasks
            .iter()
            .position(|t| t.priority > task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, task);
    }

    /// Take the front task if it is strictly more urgent than `current`.
    pub fn pop_if_preempts(&mut self, current: i32) -> Option<IrqTask> {
        match self.tasks.front() {
            Some(t) if t.priority < current => self.tasks.pop_front(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for IrqTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

static IRQ_QUEUE: Mutex<IrqTaskQueue> = Mutex::new(IrqTaskQueue::new());

/// Priority of the deferred task currently executing on this CPU.
static CURRENT_PRIORITY: AtomicI32 = AtomicI32::new(IDLE_IRQ_PRIORITY);

/// Post deferred work.
pub fn enqueue(callback: fn(u64), arg: u64, priority: i32) {
    sync::lock();
    IRQ_QUEUE.lock().insert(IrqTask {
        priority,
        callback,
        arg,
    });
    sync::unlock();
}

/// Drain the queue: run every task strictly more urgent than the one we
/// interrupted, most urgent first, with interrupts enabled during the
/// callback.
pub fn run_preemptive() {
    loop {
        sync::lock();
        let task = IRQ_QUEUE
            .lock()
            .pop_if_preempts(CURRENT_PRIORITY.load(Ordering::Relaxed));
        let Some(task) = task else {
            sync::unlock();
            break;
        };
        let prev = CURRENT_PRIORITY.swap(task.priority, Ordering::Relaxed);
        sync::unlock();

        (task.callback)(task.arg);

        sync::lock();
        CURRENT_PRIORITY.store(prev, Ordering::Relaxed);
        sync::unlock();
    }
}

/// The IRQ vector target: decode the source, post the deferred task, drain.
#[cfg(target_arch = "aarch64")]
#[no_mangle]
pub extern "C" fn irq_router(tpf: &mut crate::arch::trap::Trapframe) {
    use crate::arch::aarch64::timer as local_intc;
    use crate::config::UART_IRQ_PRIORITY;
    use crate::drivers::uart;

    if uart::has_pending_irq() && local_intc::gpu_irq_pending() {
        match uart::pending_kind() {
            Some(uart::IrqKind::Rx) => {
                uart::mask_rx_irq();
                enqueue(uart::rx_task, 0, UART_IRQ_PRIORITY);
                run_preemptive();
            }
            Some(uart::IrqKind::Tx) => {
                uart::mask_tx_irq();
                enqueue(uart::tx_task, 0, UART_IRQ_PRIORITY);
                run_preemptive();
            }
            None => {}
        }
    } else if local_intc::timer_irq_pending() {
        crate::arch::timer_disable();
        crate::timer::handle_tick();
        run_preemptive();
        crate::arch::timer_enable();
        // Preemption point: another runnable thread takes the CPU here.
        if crate::sched::runnable_count() > 1 {
            crate::sched::schedule();
        }
    }

    if tpf.from_el0() {
        crate::signal::check_signal(tpf);
    }
}

/// Vector target for exception classes the kernel does not handle.
#[cfg(target_arch = "aarch64")]
#[no_mangle]
pub extern "C" fn invalid_exception_router(tpf: &mut crate::arch::trap::Trapframe, esr: u64) {
    panic!(
        "unhandled exception: esr={:#x} elr={:#x} spsr={:#x}",
        esr, tpf.elr_el1, tpf.spsr_el1
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn cb(_arg: u64) {}

    fn task(priority: i32) -> IrqTask {
        IrqTask {
            priority,
            callback: cb,
            arg: 0,
        }
    }

    #[test]
    fn queue_orders_by_priority_fifo_within() {
        let mut q = IrqTaskQueue::new();
        q.insert(task(10));
        q.insert(task(0));
        q.insert(task(10));
        q.insert(task(-1));
        let drained: alloc::vec::Vec<i32> =
            core::iter::from_fn(|| q.pop_if_preempts(i32::MAX).map(|t| t.priority)).collect();
        assert_eq!(drained, alloc::vec![-1, 0, 10, 10]);
    }

    #[test]
    fn only_strictly_higher_priority_preempts() {
        let mut q = IrqTaskQueue::new();
        q.insert(task(5));
        assert!(
            q.pop_if_preempts(5).is_none(),
            "equal priority must not preempt"
        );
        assert!(q.pop_if_preempts(4).is_none(), "lower urgency must wait");
        assert!(q.pop_if_preempts(6).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn timer_bootstrap_priority_beats_uart() {
        let mut q = IrqTaskQueue::new();
        q.insert(task(crate::config::UART_IRQ_PRIORITY));
        q.insert(task(-1));
        assert_eq!(
            q.pop_if_preempts(crate::config::IDLE_IRQ_PRIORITY)
                .map(|t| t.priority),
            Some(-1)
        );
    }
}
