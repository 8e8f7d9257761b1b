//! Signal delivery.
//!
//! Per-process handler table and pending counters, checked on every return
//! to EL0. Delivery saves the thread's kernel context, then erets into the
//! user-mode wrapper page (`blr x0; mov x8, #50; svc #0`) with x0 holding
//! the registered handler. The `signal_return` trap (syscall 50) restores
//! the saved context, which lands back inside [`check_signal`]'s scan loop
//! so remaining pending signals are delivered too.

use crate::arch::context::{self, SignalContext};
use crate::arch::trap::Trapframe;
use crate::config::{PID_MAX, SIGNAL_MAX};
use crate::error::{KernelError, KernelResult};
use crate::sched::{self, ThreadState};
use crate::sync;

/// What to run when a signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalHandler {
    /// Silent self-kill
    Default,
    /// User-registered handler at this EL0 address
    User(u64),
}

/// Per-thread signal bookkeeping.
#[derive(Debug, Clone)]
pub struct SignalState {
    handlers: [SignalHandler; SIGNAL_MAX + 1],
    pending: [u32; SIGNAL_MAX + 1],
    /// Set while a delivery pass is in flight; blocks re-entry
    pub running: bool,
    /// Kernel context restored by signal_return
    pub saved: SignalContext,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            handlers: [SignalHandler::Default; SIGNAL_MAX + 1],
            pending: [0; SIGNAL_MAX + 1],
            running: false,
            saved: SignalContext::default(),
        }
    }

    /// Fresh state inheriting the parent's handler table (fork).
    pub fn inherited(parent: &SignalState) -> Self {
        Self {
            handlers: parent.handlers,
            ..Self::new()
        }
    }

    /// Back to all-default handlers (exec).
    pub fn reset_handlers(&mut self) {
        self.handlers = [SignalHandler::Default; SIGNAL_MAX + 1];
    }

    pub fn set_handler(&mut self, signum: usize, handler: SignalHandler) {
        self.handlers[signum] = handler;
    }

    pub fn handler(&self, signum: usize) -> SignalHandler {
        self.handlers[signum]
    }

    pub fn post(&mut self, signum: usize) {
        self.pending[signum] += 1;
    }

    /// Consume one pending instance of `signum`, if any.
    pub fn take_pending(&mut self, signum: usize) -> bool {
        if self.pending[signum] > 0 {
            self.pending[signum] -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical address of the signal wrapper page mapped into every process.
pub fn wrapper_phys() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        crate::mm::virt_to_phys(crate::arch::aarch64::switch::signal_wrapper_addr())
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// syscall 8: register a handler for `signum` on the calling process.
pub fn register(signum: usize, handler_addr: u64) -> KernelResult<()> {
    if signum > SIGNAL_MAX {
        return Err(KernelError::BadArgument {
            what: "signal number",
        });
    }
    sched::with_current(|t| t.signals.set_handler(signum, SignalHandler::User(handler_addr)));
    Ok(())
}

/// syscall 9: post `signum` to `pid`. Silently ignored for slots that are
/// not currently live.
pub fn post(pid: usize, signum: usize) -> KernelResult<()> {
    if pid > PID_MAX || signum > SIGNAL_MAX {
        return Err(KernelError::BadArgument {
            what: "pid or signal number",
        });
    }
    sync::lock();
    let _ = sched::with_thread(pid, |t| {
        if matches!(t.state, ThreadState::Ready | ThreadState::Running) {
            t.signals.post(signum);
        }
    });
    sync::unlock();
    Ok(())
}

/// Deliver pending signals before returning to EL0.
pub fn check_signal(tpf: &mut Trapframe) {
    sync::lock();
    let already_running = sched::with_current(|t| {
        if t.signals.running {
            true
        } else {
            t.signals.running = true;
            false
        }
    });
    sync::unlock();
    if already_running {
        return;
    }

    for signum in 0..=SIGNAL_MAX {
        let saved_ptr = sched::with_current(|t| &mut t.signals.saved as *mut SignalContext);
        // SAFETY: the pointer targets the fixed thread table; a later
        // signal_return makes this call return a second time, continuing
        // the scan loop.
        unsafe { context::store_context(saved_ptr) };

        sync::lock();
        let fire = sched::with_current(|t| t.signals.take_pending(signum));
        sync::unlock();
        if fire {
            run_signal(tpf, signum);
        }
    }

    sync::lock();
    sched::with_current(|t| t.signals.running = false);
    sync::unlock();
}

fn run_signal(tpf: &mut Trapframe, signum: usize) {
    let handler = sched::with_current(|t| t.signals.handler(signum));
    match handler {
        SignalHandler::Default => {
            // Silent self-kill; the slot becomes a zombie and the scheduler
            // moves on.
            log::info!(
                "pid {}: default handler for signal {}",
                sched::current_pid(),
                signum
            );
            sched::exit_current();
        }
        SignalHandler::User(addr) => {
            #[cfg(target_arch = "aarch64")]
            {
                let wrapper = crate::config::USER_SIGNAL_WRAPPER_VA as u64;
                // SAFETY: the wrapper page is mapped read+exec in every user
                // address space; the handler runs at EL0 and comes back via
                // svc 50.
                unsafe {
                    crate::arch::aarch64::switch::eret_to_user(
                        wrapper,
                        tpf.sp_el0,
                        tpf.spsr_el1,
                        addr,
                    )
                }
            }
            #[cfg(not(target_arch = "aarch64"))]
            {
                let _ = (tpf, addr);
                unreachable!("signal delivery to user mode is target-only");
            }
        }
    }
}

/// syscall 50: resume the context saved before the handler ran.
pub fn signal_return(_tpf: &mut Trapframe) {
    let saved_ptr = sched::with_current(|t| &t.signals.saved as *const SignalContext);
    // SAFETY: the context was captured by check_signal on this thread's
    // kernel stack, which is still live.
    unsafe { context::load_context(saved_ptr) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_accumulate_and_drain() {
        let mut s = SignalState::new();
        assert!(!s.take_pending(3));
        s.post(3);
        s.post(3);
        assert!(s.take_pending(3));
        assert!(s.take_pending(3));
        assert!(!s.take_pending(3));
    }

    #[test]
    fn fork_inherits_handlers_but_not_pending() {
        let mut parent = SignalState::new();
        parent.set_handler(5, SignalHandler::User(0x1234));
        parent.post(5);
        let child = SignalState::inherited(&parent);
        assert_eq!(child.handler(5), SignalHandler::User(0x1234));
        let mut child = child;
        assert!(!child.take_pending(5), "pending signals are not inherited");
    }

    #[test]
    fn exec_resets_handlers_to_default() {
        let mut s = SignalState::new();
        s.set_handler(9, SignalHandler::User(0xBEEF));
        s.reset_handlers();
        assert_eq!(s.handler(9), SignalHandler::Default);
    }
}
