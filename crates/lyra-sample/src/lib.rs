//! Per-track sample storage.
//!
//! Sample bytes and sample metadata are stored apart:
//!
//! - [`SampleDataQueue`] keeps the bytes as a virtual append-only stream in
//!   fixed-size chunks leased from a shared [`lyra_bufpool::Allocator`];
//! - [`SampleQueue`] keeps per-sample metadata (time, size, flags, byte
//!   offset) and the track's format history, and serves keyframe-aware
//!   reads, seeks and discards on top of its data queue.
//!
//! Store misuse (reading bytes that were never staged or already discarded,
//! overlapping samples) is a programming error and panics.

#![forbid(unsafe_code)]

mod buffer;
mod data_queue;
mod format;
mod sample_queue;
mod spans;

pub use buffer::{
    DecoderInputBuffer, ReadFlags, ReadResult, SampleFlags, TIME_END_OF_SOURCE, TIME_UNSET,
};
pub use data_queue::SampleDataQueue;
pub use format::{
    Format, FormatHolder, OFFSET_SAMPLE_RELATIVE, TrackType, all_samples_are_sync_samples,
    track_type_of,
};
pub use sample_queue::{SampleQueue, UpstreamFormatChangedListener};
