use std::{
    pin::pin,
    sync::Arc,
    task::{Context, Wake, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

/// Result of blocking on a [`ConditionVariable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The condition was (or became) open.
    Opened,
    /// The cancellation token fired while waiting.
    Cancelled,
    /// The timeout elapsed with the condition still closed.
    TimedOut,
}

#[derive(Debug, Default)]
struct Gate {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn notify(&self) {
        let _open = self.open.lock();
        self.condvar.notify_all();
    }
}

/// Wakes the gate's waiters when a cancellation token fires.
struct CancelWaker(Arc<Gate>);

impl Wake for CancelWaker {
    fn wake(self: Arc<Self>) {
        self.0.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.notify();
    }
}

/// An interruptible open/closed gate.
///
/// Starts closed. [`block`](Self::block) returns as soon as the condition is
/// open or the caller's token is cancelled, so a waiting producer never
/// outlives its cancellation.
#[derive(Debug, Default)]
pub struct ConditionVariable {
    gate: Arc<Gate>,
}

impl ConditionVariable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the condition. Returns `true` if it was previously closed.
    pub fn open(&self) -> bool {
        let mut open = self.gate.open.lock();
        if *open {
            return false;
        }
        *open = true;
        self.gate.condvar.notify_all();
        true
    }

    /// Closes the condition. Returns `true` if it was previously open.
    pub fn close(&self) -> bool {
        let mut open = self.gate.open.lock();
        let was_open = *open;
        *open = false;
        was_open
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.gate.open.lock()
    }

    /// Wakes all waiters without opening, so they re-check their state.
    pub fn wake(&self) {
        self.gate.notify();
    }

    /// Blocks until the condition is open or `cancel` fires.
    pub fn block(&self, cancel: &CancellationToken) -> BlockOutcome {
        self.wait(cancel, None)
    }

    /// Blocks until the condition is open, `cancel` fires, or `timeout` elapses.
    pub fn block_timeout(&self, cancel: &CancellationToken, timeout: Duration) -> BlockOutcome {
        self.wait(cancel, Some(Instant::now() + timeout))
    }

    fn wait(&self, cancel: &CancellationToken, deadline: Option<Instant>) -> BlockOutcome {
        // Registering before taking the lock: a cancellation after the
        // check below blocks in `notify` until this thread waits.
        let waker = Waker::from(Arc::new(CancelWaker(Arc::clone(&self.gate))));
        let mut cancelled = pin!(cancel.cancelled());
        if cancelled
            .as_mut()
            .poll(&mut Context::from_waker(&waker))
            .is_ready()
        {
            return BlockOutcome::Cancelled;
        }

        let mut open = self.gate.open.lock();
        loop {
            if cancel.is_cancelled() {
                return BlockOutcome::Cancelled;
            }
            if *open {
                return BlockOutcome::Opened;
            }
            match deadline {
                None => self.gate.condvar.wait(&mut open),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return BlockOutcome::TimedOut;
                    }
                    self.gate.condvar.wait_until(&mut open, deadline);
                }
            }
        }
    }
}
