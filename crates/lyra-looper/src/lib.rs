//! Per-thread message scheduling.
//!
//! A [`Looper`] owns a dedicated OS thread and a [`MessageQueue`]. Work is
//! posted to it through [`Handler`]s as typed payloads and dispatched on the
//! looper thread in due-time order:
//!
//! - messages with equal due time run in post order;
//! - [`Handler::send_at_front`] jumps ahead of everything already queued;
//! - [`Looper::quit`] drops all pending work, [`Looper::quit_safely`] drops
//!   only work that is not yet due.
//!
//! Payloads are a closed enum per subsystem (see [`Payload`]) rather than
//! boxed closures. Message envelopes are recycled through a bounded
//! [`lyra_bufpool::Pool`].

#![forbid(unsafe_code)]

mod error;
mod handler;
mod looper;
mod message;
mod queue;

pub use error::{LooperError, LooperResult};
pub use handler::{Callback, Handler, HandlerId};
pub use looper::{Looper, Loopers};
pub use message::{MAX_POOL_SIZE, Message, Payload};
pub use queue::MessageQueue;
