use std::{sync::Arc, time::Duration};

#[cfg(any(test, feature = "test-utils"))]
use unimock::unimock;

use crate::{error::LoadError, loadable::LoadInfo};

/// Retries tolerated before a failing media load is reported.
pub const DEFAULT_MIN_LOADABLE_RETRY_COUNT: u32 = 3;

/// Live progressive streams can drop connections routinely.
pub const DEFAULT_MIN_LOADABLE_RETRY_COUNT_PROGRESSIVE_LIVE: u32 = 6;

/// What is being loaded, for retry accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Media,
    /// Progressive media whose length is unknown.
    MediaProgressiveLive,
}

/// A failed attempt, as presented to a [`LoadErrorHandlingPolicy`].
#[derive(Clone, Debug)]
pub struct LoadErrorInfo {
    pub data_type: DataType,
    pub error: Arc<LoadError>,
    pub error_count: u32,
    pub info: LoadInfo,
}

/// Decides how failed loads are retried.
#[cfg_attr(
    any(test, feature = "test-utils"),
    unimock(api = LoadErrorHandlingPolicyMock)
)]
pub trait LoadErrorHandlingPolicy: Send + Sync + 'static {
    /// Delay before the next attempt, or `None` when the error is fatal.
    fn retry_delay_for(&self, info: &LoadErrorInfo) -> Option<Duration>;

    /// Consecutive failures tolerated before the error is surfaced.
    fn min_loadable_retry_count(&self, data_type: DataType) -> u32;
}

/// Retries everything except malformed media, panics and client errors.
///
/// The delay grows linearly with the error count up to `max_retry_delay`.
#[derive(Clone, Debug)]
pub struct DefaultLoadErrorHandlingPolicy {
    min_loadable_retry_count: Option<u32>,
    first_retry_delay: Duration,
    retry_delay_step: Duration,
    max_retry_delay: Duration,
}

impl Default for DefaultLoadErrorHandlingPolicy {
    fn default() -> Self {
        Self {
            min_loadable_retry_count: None,
            first_retry_delay: Duration::from_millis(100),
            retry_delay_step: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl DefaultLoadErrorHandlingPolicy {
    /// Use `count` for every data type.
    #[must_use]
    pub fn with_min_loadable_retry_count(mut self, count: u32) -> Self {
        self.min_loadable_retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_first_retry_delay(mut self, delay: Duration) -> Self {
        self.first_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_retry_delay_step(mut self, step: Duration) -> Self {
        self.retry_delay_step = step;
        self
    }

    #[must_use]
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }
}

fn is_retryable(error: &LoadError) -> bool {
    match error {
        LoadError::Parser(_)
        | LoadError::Unexpected(_)
        | LoadError::Cancelled
        | LoadError::Fatal(_)
        | LoadError::RetriesExhausted { .. } => false,
        LoadError::Net {
            status: Some(status),
            ..
        } => !(400..500).contains(status) || matches!(status, 408 | 429),
        LoadError::Net { status: None, .. } | LoadError::Io(_) => true,
    }
}

impl LoadErrorHandlingPolicy for DefaultLoadErrorHandlingPolicy {
    fn retry_delay_for(&self, info: &LoadErrorInfo) -> Option<Duration> {
        if !is_retryable(&info.error) {
            return None;
        }
        if info.error_count <= 1 {
            return Some(self.first_retry_delay);
        }
        Some(
            self.retry_delay_step
                .saturating_mul(info.error_count - 1)
                .min(self.max_retry_delay),
        )
    }

    fn min_loadable_retry_count(&self, data_type: DataType) -> u32 {
        self.min_loadable_retry_count.unwrap_or(match data_type {
            DataType::Media => DEFAULT_MIN_LOADABLE_RETRY_COUNT,
            DataType::MediaProgressiveLive => DEFAULT_MIN_LOADABLE_RETRY_COUNT_PROGRESSIVE_LIVE,
        })
    }
}
