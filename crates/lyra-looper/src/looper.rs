use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    error::{LooperError, LooperResult},
    message::Payload,
    queue::MessageQueue,
};

struct LooperInner<M: Payload> {
    queue: Arc<MessageQueue<M>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Payload> Drop for LooperInner<M> {
    fn drop(&mut self) {
        // Last handle gone: nothing can post anymore.
        self.queue.quit(false);
    }
}

/// A dispatch loop running on its own OS thread.
///
/// Cloning is cheap; every clone drives the same thread. The thread exits
/// after [`quit`](Self::quit) / [`quit_safely`](Self::quit_safely), or when
/// the last clone is dropped.
pub struct Looper<M: Payload> {
    inner: Arc<LooperInner<M>>,
}

impl<M: Payload> Looper<M> {
    /// Spawn a looper thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LooperError::Spawn`] if the OS refuses a new thread.
    pub fn spawn(name: impl Into<String>) -> LooperResult<Self> {
        let name = name.into();
        let queue = Arc::new(MessageQueue::new(name.clone()));
        let loop_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&loop_queue))?;
        debug!(looper = %name, "Looper: spawned");

        Ok(Self {
            inner: Arc::new(LooperInner {
                queue,
                thread_id: handle.thread().id(),
                join: Mutex::new(Some(handle)),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.queue.name()
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue<M> {
        &self.inner.queue
    }

    /// Drop every pending message and stop the loop.
    pub fn quit(&self) {
        debug!(looper = %self.name(), "Looper: quit");
        self.inner.queue.quit(false);
    }

    /// Stop the loop after delivering every message already due.
    pub fn quit_safely(&self) {
        debug!(looper = %self.name(), "Looper: quit safely");
        self.inner.queue.quit(true);
    }

    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// # Errors
    ///
    /// Returns [`LooperError::NotOnLooperThread`] when called from any other
    /// thread.
    pub fn check_current_thread(&self) -> LooperResult<()> {
        if self.is_current_thread() {
            Ok(())
        } else {
            Err(LooperError::NotOnLooperThread(self.name().to_owned()))
        }
    }

    /// Wait for the loop thread to exit. Call after quitting.
    ///
    /// No-op on the looper thread itself and on every call after the first.
    pub fn join(&self) {
        if self.is_current_thread() {
            return;
        }
        let handle = self.inner.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(looper = %self.name(), "Looper: loop thread panicked");
            }
        }
    }

    fn downgrade(&self) -> Weak<LooperInner<M>> {
        Arc::downgrade(&self.inner)
    }
}

fn run<M: Payload>(queue: &MessageQueue<M>) {
    trace!(looper = %queue.name(), "Looper started");
    while let Some(mut message) = queue.next() {
        let target = message.target.take();
        let payload = message.payload.take();
        if let (Some(target), Some(payload)) = (target, payload) {
            target.callback.handle_message(payload);
        }
        // Envelope goes back to the pool here.
        drop(message);
    }
    trace!(looper = %queue.name(), "Looper stopped");
}

impl<M: Payload> Clone for Looper<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Payload> fmt::Debug for Looper<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name())
            .field("thread", &self.inner.thread_id)
            .finish()
    }
}

/// Hands out one looper per queue name while that looper is alive.
pub struct Loopers<M: Payload> {
    by_name: Mutex<HashMap<String, Weak<LooperInner<M>>>>,
}

impl<M: Payload> Loopers<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live looper for `name`, spawning one if needed.
    ///
    /// A looper that has started quitting is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`LooperError::Spawn`] if a new thread cannot be created.
    pub fn get_or_spawn(&self, name: &str) -> LooperResult<Looper<M>> {
        let mut by_name = self.by_name.lock();
        if let Some(inner) = by_name.get(name).and_then(Weak::upgrade) {
            if !inner.queue.is_quitting() {
                return Ok(Looper { inner });
            }
        }
        let looper = Looper::spawn(name)?;
        by_name.insert(name.to_owned(), looper.downgrade());
        by_name.retain(|_, weak| weak.strong_count() > 0);
        Ok(looper)
    }
}

impl<M: Payload> Default for Loopers<M> {
    fn default() -> Self {
        Self::new()
    }
}
