use std::{io, sync::Arc};

use lyra_looper::LooperError;
use lyra_platform::ThreadPoolBuildError;
use thiserror::Error;

/// Why a load attempt failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed media: {0}")]
    Parser(String),

    #[error("network error (status {status:?}): {message}")]
    Net {
        status: Option<u16>,
        message: String,
    },

    #[error("load cancelled")]
    Cancelled,

    /// The loadable panicked.
    #[error("unexpected load failure: {0}")]
    Unexpected(String),

    #[error("load failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Arc<LoadError>,
    },

    #[error("fatal load error")]
    Fatal(#[source] Arc<LoadError>),
}

impl LoadError {
    /// HTTP status of a network failure, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Net { status, .. } => *status,
            Self::RetriesExhausted { source, .. } | Self::Fatal(source) => source.status(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Failure to set up a [`Loader`](crate::Loader).
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("loader thread: {0}")]
    Looper(#[from] LooperError),

    #[error("load thread pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}
