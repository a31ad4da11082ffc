use lyra_loader::{LoadError, LoaderError};
use lyra_looper::LooperError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressiveError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("loader setup failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("period looper failed: {0}")]
    Looper(#[from] LooperError),

    #[error("loading finished before preparation completed")]
    LoadingFinishedBeforePrepared,
}

pub type ProgressiveResult<T> = Result<T, ProgressiveError>;
