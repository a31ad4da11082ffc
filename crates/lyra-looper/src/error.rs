use thiserror::Error;

#[derive(Debug, Error)]
pub enum LooperError {
    #[error("message queue of looper `{0}` is quitting")]
    Quitting(String),

    #[error("called off the thread of looper `{0}`")]
    NotOnLooperThread(String),

    #[error("failed to spawn looper thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type LooperResult<T> = Result<T, LooperError>;
