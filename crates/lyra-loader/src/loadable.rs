use std::{sync::Arc, time::Duration};

use crate::error::{LoadError, LoadResult};

/// A unit of blocking work driven by a [`Loader`](crate::Loader).
pub trait Loadable: Send + Sync + 'static {
    /// Runs until the work is done, fails, or observes a cancellation.
    ///
    /// Called on the loader's pool thread. A retry calls `load` again on the
    /// same value, which resumes from wherever it got to.
    ///
    /// # Errors
    ///
    /// Any failure; the loader's callback decides whether to retry.
    fn load(&self) -> LoadResult<()>;

    /// Asks a running [`load`](Self::load) to return soon. Called from any
    /// thread; must not block.
    fn cancel_load(&self);

    /// Bytes consumed so far, for reporting.
    fn bytes_loaded(&self) -> u64 {
        0
    }
}

/// Snapshot passed with every load callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadInfo {
    pub load_id: u64,
    /// Attempts started for this load, retries included.
    pub attempts: u32,
    /// Time since `start_loading`.
    pub elapsed: Duration,
    pub bytes_loaded: u64,
}

/// What the loader does after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorAction {
    /// Retry after `delay`, or after the loader's backoff when `None`.
    Retry { delay: Option<Duration> },
    /// Like `Retry`, treating this failure as the first of a new run.
    RetryResetErrorCount { delay: Option<Duration> },
    /// Give up quietly.
    DontRetry,
    /// Give up and keep the error for `maybe_throw_error`.
    DontRetryFatal,
}

impl LoadErrorAction {
    #[must_use]
    pub fn retry_after(reset_error_count: bool, delay: Option<Duration>) -> Self {
        if reset_error_count {
            Self::RetryResetErrorCount { delay }
        } else {
            Self::Retry { delay }
        }
    }

    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. } | Self::RetryResetErrorCount { .. })
    }
}

/// Receives the outcome of each load, on the loader's looper thread.
///
/// Exactly one of `on_load_completed` / `on_load_canceled` ends a load;
/// `on_load_error` may run any number of times before that.
pub trait LoaderCallback<L>: Send + Sync + 'static {
    fn on_load_completed(&self, loadable: &L, info: &LoadInfo);

    /// `released` is set when the cancellation came from
    /// [`Loader::release`](crate::Loader::release). In that case this runs on
    /// the releasing thread.
    fn on_load_canceled(&self, loadable: &L, info: &LoadInfo, released: bool);

    /// `error_count` counts consecutive failures, this one included.
    fn on_load_error(
        &self,
        loadable: &L,
        info: &LoadInfo,
        error: &Arc<LoadError>,
        error_count: u32,
    ) -> LoadErrorAction;
}
