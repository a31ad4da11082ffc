use std::{collections::VecDeque, fmt, mem, time::Instant};

use lyra_bufpool::{Pool, Pooled};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::{
    error::{LooperError, LooperResult},
    handler::{HandlerId, Target},
    message::{MAX_POOL_SIZE, Message, Payload},
};

type IdleHandler = Box<dyn FnMut() -> bool + Send>;

struct QueueState<M: Payload> {
    /// Sorted by due time; front messages (`when == None`) first.
    messages: VecDeque<Pooled<Message<M>>>,
    idle_handlers: Vec<IdleHandler>,
    quitting: bool,
    /// The single consumer is parked waiting for work.
    blocked: bool,
}

/// Time-ordered list of pending messages for one looper.
///
/// Any thread may enqueue; only the owning looper thread consumes.
pub struct MessageQueue<M: Payload> {
    name: String,
    state: Mutex<QueueState<M>>,
    condvar: Condvar,
    pool: Pool<Message<M>>,
}

impl<M: Payload> MessageQueue<M> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                idle_handlers: Vec::new(),
                quitting: false,
                blocked: false,
            }),
            condvar: Condvar::new(),
            pool: Pool::new(MAX_POOL_SIZE),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take an envelope from the pool and fill it.
    pub(crate) fn obtain(
        &self,
        target: Target<M>,
        payload: M,
        when: Option<Instant>,
    ) -> Pooled<Message<M>> {
        self.pool.acquire_with(|message| {
            message.when = when;
            message.target = Some(target);
            message.payload = Some(payload);
        })
    }

    /// Insert `message` by due time.
    ///
    /// Ties keep post order. A front-of-queue message goes ahead of
    /// everything already queued.
    ///
    /// # Errors
    ///
    /// Returns [`LooperError::Quitting`] once the queue is quitting; the
    /// message is recycled undelivered.
    pub fn enqueue(&self, message: Pooled<Message<M>>) -> LooperResult<()> {
        let mut state = self.state.lock();
        if state.quitting {
            trace!(queue = %self.name, tag = ?message.tag(), "MessageQueue: enqueue while quitting");
            drop(state);
            drop(message);
            return Err(LooperError::Quitting(self.name.clone()));
        }

        let index = match message.when {
            None => 0,
            Some(when) => state
                .messages
                .iter()
                .position(|queued| queued.when.is_some_and(|queued_when| queued_when > when))
                .unwrap_or(state.messages.len()),
        };
        trace!(queue = %self.name, index, tag = ?message.tag(), "MessageQueue: enqueue");
        state.messages.insert(index, message);

        if index == 0 && state.blocked {
            self.condvar.notify_one();
        }
        Ok(())
    }

    /// Block until a message is due and detach it.
    ///
    /// Runs idle handlers (lock released) at most once per call, when no
    /// message is due. Returns `None` once the queue is quitting and nothing
    /// due is left.
    pub(crate) fn next(&self) -> Option<Pooled<Message<M>>> {
        let mut idle_handled = false;
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            if state.messages.front().is_some_and(|m| m.is_due(now)) {
                state.blocked = false;
                return state.messages.pop_front();
            }
            if state.quitting {
                state.blocked = false;
                return None;
            }

            if !idle_handled && !state.idle_handlers.is_empty() {
                idle_handled = true;
                self.run_idle_handlers(&mut state);
                // An idle handler may have posted work.
                continue;
            }

            state.blocked = true;
            match state.messages.front().and_then(|m| m.when) {
                Some(when) => {
                    self.condvar.wait_until(&mut state, when);
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }

    fn run_idle_handlers(&self, state: &mut MutexGuard<'_, QueueState<M>>) {
        let mut handlers = mem::take(&mut state.idle_handlers);
        MutexGuard::unlocked(state, || {
            handlers.retain_mut(|handler| handler());
        });
        trace!(queue = %self.name, kept = handlers.len(), "MessageQueue: idle handlers ran");
        // Handlers added while unlocked go after the survivors.
        handlers.append(&mut state.idle_handlers);
        state.idle_handlers = handlers;
    }

    /// Register a callback run whenever the queue runs out of due work.
    ///
    /// Returning `false` from the callback unregisters it.
    pub fn add_idle_handler<F>(&self, handler: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut state = self.state.lock();
        state.idle_handlers.push(Box::new(handler));
        if state.blocked {
            self.condvar.notify_one();
        }
    }

    /// `true` when no message is due right now.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        let now = Instant::now();
        !state.messages.front().is_some_and(|m| m.is_due(now))
    }

    #[must_use]
    pub fn is_quitting(&self) -> bool {
        self.state.lock().quitting
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes waiting in the recycle pool.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool.available()
    }

    pub(crate) fn has_messages(&self, handler: HandlerId, tag: Option<M::Tag>) -> bool {
        self.state
            .lock()
            .messages
            .iter()
            .any(|m| Self::matches(m, handler, tag))
    }

    /// Remove pending messages for `handler`, all of them when `tag` is `None`.
    pub(crate) fn remove_messages(&self, handler: HandlerId, tag: Option<M::Tag>) -> usize {
        let mut state = self.state.lock();
        let before = state.messages.len();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(before);
        for message in state.messages.drain(..) {
            if Self::matches(&message, handler, tag) {
                removed.push(message);
            } else {
                kept.push_back(message);
            }
        }
        state.messages = kept;
        drop(state);

        let count = removed.len();
        if count > 0 {
            trace!(queue = %self.name, handler = handler.0, count, ?tag, "MessageQueue: removed");
        }
        count
    }

    fn matches(message: &Message<M>, handler: HandlerId, tag: Option<M::Tag>) -> bool {
        message.target.as_ref().is_some_and(|t| t.id == handler)
            && tag.is_none_or(|tag| message.tag() == Some(tag))
    }

    /// Stop accepting messages.
    ///
    /// With `safe`, messages already due stay queued and are still
    /// dispatched; otherwise every pending message is dropped.
    pub(crate) fn quit(&self, safe: bool) {
        let mut state = self.state.lock();
        if state.quitting {
            return;
        }
        state.quitting = true;

        let dropped: Vec<_> = if safe {
            let now = Instant::now();
            let keep = state
                .messages
                .iter()
                .position(|m| !m.is_due(now))
                .unwrap_or(state.messages.len());
            state.messages.drain(keep..).collect()
        } else {
            state.messages.drain(..).collect()
        };
        trace!(queue = %self.name, safe, dropped = dropped.len(), "MessageQueue: quit");
        self.condvar.notify_all();
        drop(state);
        drop(dropped);
    }
}

impl<M: Payload> fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("pending", &state.messages.len())
            .field("quitting", &state.quitting)
            .finish()
    }
}
