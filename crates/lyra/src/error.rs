use lyra_net::NetError;
use lyra_progressive::ProgressiveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LyraError {
    #[error("invalid source url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http client: {0}")]
    Net(#[from] NetError),

    #[error(transparent)]
    Period(#[from] ProgressiveError),
}

pub type LyraResult<T> = Result<T, LyraError>;
