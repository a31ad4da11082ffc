//! Threading and synchronization primitives shared by the lyra crates.
//!
//! # Synchronization
//!
//! Re-exports [`parking_lot`] types directly so every crate locks through the
//! same implementation.
//!
//! # Execution contexts
//!
//! [`ThreadPool`] is the execution context loads run on. A loader normally
//! owns a single-threaded pool so its loadables execute strictly one after
//! another.
//!
//! # Gating
//!
//! [`ConditionVariable`] is an open/closed gate. A producer blocks on it while
//! closed; the consumer opens it to let the producer continue. It is the
//! backpressure valve between a load and its reader.

#![forbid(unsafe_code)]

mod condition;
mod pool;

pub use condition::{BlockOutcome, ConditionVariable};
pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use pool::ThreadPool;
pub use rayon::ThreadPoolBuildError;
