#![forbid(unsafe_code)]

//! # Lyra
//!
//! Facade over the lyra buffering core: a retrying [`Loader`], per-track
//! [`SampleQueue`]s and the [`ProgressiveMediaPeriod`] that ties them to a
//! byte source and an extractor.
//!
//! ## Quick start
//!
//! ```ignore
//! use lyra::prelude::*;
//!
//! let config = SourceConfig::new("https://example.com/song.mp3")?;
//! let period = lyra::open_progressive(config, Box::new(my_extractor), Handle::current())?;
//! period.prepare(callback, 0);
//! ```
//!
//! [`Loader`]: lyra_loader::Loader
//! [`SampleQueue`]: lyra_sample::SampleQueue

// ── Re-export sub-crates ────────────────────────────────────────────────

pub mod bufpool {
    pub use lyra_bufpool::*;
}

pub mod events {
    pub use lyra_events::*;
}

pub mod loader {
    pub use lyra_loader::*;
}

pub mod looper {
    pub use lyra_looper::*;
}

pub mod net {
    pub use lyra_net::*;
}

pub mod platform {
    pub use lyra_platform::*;
}

pub mod progressive {
    pub use lyra_progressive::*;
}

pub mod sample {
    pub use lyra_sample::*;
}

// ── Progressive source ──────────────────────────────────────────────────

mod config;
mod error;
mod source;

pub use config::SourceConfig;
pub use error::{LyraError, LyraResult};
pub use lyra_progressive::ProgressiveMediaPeriod;
pub use source::open_progressive;

// ── Prelude ─────────────────────────────────────────────────────────────

pub mod prelude {
    pub use lyra_events::{Event, EventBus, LoadEvent, PeriodEvent, TrackEvent};
    pub use lyra_loader::{DefaultLoadErrorHandlingPolicy, LoadError, LoadErrorHandlingPolicy};
    pub use lyra_progressive::{
        DataSource, Extractor, ExtractorOutput, PeriodCallback, ProgressiveConfig,
        ProgressiveMediaPeriod, SampleStream, SeekParameters, TrackOutput,
    };
    pub use lyra_sample::{DecoderInputBuffer, Format, FormatHolder, ReadFlags, ReadResult};

    pub use crate::{LyraError, SourceConfig, open_progressive};
}
