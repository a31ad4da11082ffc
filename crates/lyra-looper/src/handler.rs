use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{error::LooperResult, looper::Looper, message::Payload};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`Handler`], shared by its clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Receives dispatched payloads on the looper thread.
pub trait Callback<M>: Send + Sync + 'static {
    fn handle_message(&self, message: M);
}

impl<M, F> Callback<M> for F
where
    F: Fn(M) + Send + Sync + 'static,
{
    fn handle_message(&self, message: M) {
        self(message);
    }
}

/// Where a message goes once dispatched.
pub(crate) struct Target<M> {
    pub(crate) id: HandlerId,
    pub(crate) callback: Arc<dyn Callback<M>>,
}

impl<M> Clone for Target<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Typed message source bound to one looper.
///
/// Cheap to clone; clones share identity, so `remove_*` and `has_messages`
/// on any clone see messages sent through the others.
pub struct Handler<M: Payload> {
    looper: Looper<M>,
    target: Target<M>,
}

impl<M: Payload> Handler<M> {
    pub fn new<C>(looper: &Looper<M>, callback: C) -> Self
    where
        C: Callback<M>,
    {
        Self::with_callback(looper, Arc::new(callback))
    }

    pub fn with_callback(looper: &Looper<M>, callback: Arc<dyn Callback<M>>) -> Self {
        Self {
            looper: looper.clone(),
            target: Target {
                id: HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
                callback,
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.target.id
    }

    #[must_use]
    pub fn looper(&self) -> &Looper<M> {
        &self.looper
    }

    fn enqueue(&self, payload: M, when: Option<Instant>) -> LooperResult<()> {
        let queue = self.looper.queue();
        queue.enqueue(queue.obtain(self.target.clone(), payload, when))
    }

    /// Post `payload` to run as soon as everything already due has run.
    ///
    /// # Errors
    ///
    /// Fails once the looper is quitting.
    pub fn send(&self, payload: M) -> LooperResult<()> {
        self.enqueue(payload, Some(Instant::now()))
    }

    /// Post `payload` to run after `delay`.
    ///
    /// # Errors
    ///
    /// Fails once the looper is quitting.
    pub fn send_delayed(&self, payload: M, delay: Duration) -> LooperResult<()> {
        self.enqueue(payload, Some(Instant::now() + delay))
    }

    /// Post `payload` to run at `when`.
    ///
    /// # Errors
    ///
    /// Fails once the looper is quitting.
    pub fn send_at_time(&self, payload: M, when: Instant) -> LooperResult<()> {
        self.enqueue(payload, Some(when))
    }

    /// Post `payload` ahead of every queued message.
    ///
    /// # Errors
    ///
    /// Fails once the looper is quitting.
    pub fn send_at_front(&self, payload: M) -> LooperResult<()> {
        self.enqueue(payload, None)
    }

    #[must_use]
    pub fn has_messages(&self, tag: M::Tag) -> bool {
        self.looper.queue().has_messages(self.target.id, Some(tag))
    }

    /// Remove pending messages of kind `tag`. Returns how many were removed.
    pub fn remove_messages(&self, tag: M::Tag) -> usize {
        self.looper.queue().remove_messages(self.target.id, Some(tag))
    }

    /// Remove every pending message sent through this handler.
    pub fn remove_all_messages(&self) -> usize {
        self.looper.queue().remove_messages(self.target.id, None)
    }

    /// # Panics
    ///
    /// Panics when called off the looper thread.
    pub fn assert_on_looper(&self) {
        if let Err(e) = self.looper.check_current_thread() {
            panic!("{e}");
        }
    }
}

impl<M: Payload> Clone for Handler<M> {
    fn clone(&self) -> Self {
        Self {
            looper: self.looper.clone(),
            target: self.target.clone(),
        }
    }
}

impl<M: Payload> fmt::Debug for Handler<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.target.id)
            .field("looper", &self.looper.name())
            .finish()
    }
}
