//! Runs one blocking [`Loadable`] at a time with retry and cancellation.
//!
//! A [`Loader`] executes loads on a single-threaded [`ThreadPool`] and reports
//! every terminal outcome on its own looper thread through a
//! [`LoaderCallback`]. On failure the callback decides what happens next by
//! returning a [`LoadErrorAction`]; consecutive failures are counted, and
//! [`Loader::maybe_throw_error`] turns a chain that failed too often into a
//! structured [`LoadError`].
//!
//! [`ThreadPool`]: lyra_platform::ThreadPool

#![forbid(unsafe_code)]

mod error;
mod loadable;
mod loader;
mod policy;

pub use error::{LoadError, LoadResult, LoaderError};
pub use loadable::{LoadErrorAction, LoadInfo, Loadable, LoaderCallback};
pub use loader::{Loader, LoaderConfig};
#[cfg(any(test, feature = "test-utils"))]
pub use policy::LoadErrorHandlingPolicyMock;
pub use policy::{
    DataType, DefaultLoadErrorHandlingPolicy, LoadErrorHandlingPolicy, LoadErrorInfo,
};
