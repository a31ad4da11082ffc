//! Progressive media period.
//!
//! A [`ProgressiveMediaPeriod`] drives one [`ExtractingLoadable`] through a
//! [`Loader`](lyra_loader::Loader). The loadable pulls bytes from a
//! [`DataSource`], runs them through an [`Extractor`] and appends the
//! resulting samples to one [`SampleQueue`](lyra_sample::SampleQueue) per
//! track. Consumers read the queues through [`SampleStream`]s.
//!
//! Loading pauses every `continue_loading_check_interval_bytes` until the
//! owner calls [`ProgressiveMediaPeriod::continue_loading`], which keeps the
//! buffer bounded without a separate size limit.

#![forbid(unsafe_code)]

mod config;
mod data_source;
mod error;
mod extractor;
mod http;
mod loadable;
mod period;
mod seek;
mod stream;
mod track_output;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use config::{DEFAULT_CONTINUE_LOADING_CHECK_INTERVAL_BYTES, ProgressiveConfig};
pub use data_source::{ByteArrayDataSource, DataSource, DataSpec, ReadOutcome, SourceProbe};
pub use error::{ProgressiveError, ProgressiveResult};
pub use extractor::{
    DiscardingTrackOutput, Extractor, ExtractorInput, ExtractorOutput, ExtractorResult,
    TrackOutput,
};
pub use http::HttpDataSource;
pub use loadable::ExtractingLoadable;
pub use period::{PeriodCallback, ProgressiveMediaPeriod, TrackGroup};
pub use seek::{IndexSeekMap, SeekMap, SeekParameters, SeekPoint, SeekPoints, Unseekable};
pub use stream::SampleStream;
