use std::{fmt, time::Instant};

use lyra_bufpool::Reuse;

use crate::handler::Target;

/// Upper bound on recycled message envelopes kept per queue.
pub const MAX_POOL_SIZE: usize = 50;

/// A message payload: one closed enum per subsystem.
///
/// `Tag` identifies the variant so pending messages can be queried or
/// removed by kind.
pub trait Payload: Send + 'static {
    type Tag: Copy + Eq + fmt::Debug + Send;

    fn tag(&self) -> Self::Tag;
}

/// One unit of scheduled work.
///
/// A message is either queued, being dispatched, or parked in the pool.
/// Ownership moves between those states, so it can never be in two at once.
pub struct Message<M: Payload> {
    /// `None` for messages sent to the front of the queue.
    pub(crate) when: Option<Instant>,
    pub(crate) target: Option<Target<M>>,
    pub(crate) payload: Option<M>,
}

impl<M: Payload> Message<M> {
    /// Due time; `None` for front-of-queue messages.
    #[must_use]
    pub fn when(&self) -> Option<Instant> {
        self.when
    }

    #[must_use]
    pub fn payload(&self) -> Option<&M> {
        self.payload.as_ref()
    }

    pub(crate) fn tag(&self) -> Option<M::Tag> {
        self.payload.as_ref().map(Payload::tag)
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.when.is_none_or(|when| when <= now)
    }
}

impl<M: Payload> Default for Message<M> {
    fn default() -> Self {
        Self {
            when: None,
            target: None,
            payload: None,
        }
    }
}

impl<M: Payload> Reuse for Message<M> {
    fn reuse(&mut self) -> bool {
        self.when = None;
        self.target = None;
        self.payload = None;
        true
    }
}

impl<M: Payload> fmt::Debug for Message<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("when", &self.when)
            .field("target", &self.target.as_ref().map(|t| t.id))
            .field("tag", &self.tag())
            .finish()
    }
}
