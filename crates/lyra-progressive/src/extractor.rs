//! Contracts between a load and the demuxer it drives.

use std::{fmt, io, sync::Arc};

use lyra_loader::{LoadError, LoadResult};
use lyra_sample::{Format, SampleFlags, TrackType};
use tracing::debug;

use crate::{
    data_source::{DataSource, DataSpec, ReadOutcome},
    seek::SeekMap,
};

/// What an extractor wants after one `read` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractorResult {
    Continue,
    /// Re-open the source at this byte position and keep reading.
    Seek(u64),
    EndOfInput,
}

/// Demuxes a byte stream into tracks.
///
/// A single extractor serves every load of a period, so its parsing state
/// survives retries and re-opens.
pub trait Extractor: Send {
    /// Binds the extractor to the outputs it feeds. Called once, before the
    /// first `read`.
    fn init(&mut self, output: Arc<dyn ExtractorOutput>);

    /// Consumes some input.
    ///
    /// # Errors
    ///
    /// Malformed media or a failure of the underlying source.
    fn read(&mut self, input: &mut ExtractorInput<'_>) -> LoadResult<ExtractorResult>;

    /// Reading will resume at `position`, a sync point for `time_us`.
    fn seek(&mut self, position: u64, time_us: i64);

    fn release(&mut self) {}
}

/// Receives the tracks and seek map an extractor discovers.
pub trait ExtractorOutput: Send + Sync {
    /// The output for track `id`, created on first use.
    fn track(&self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput>;

    /// No further tracks will be added.
    fn end_tracks(&self);

    fn seek_map(&self, seek_map: Arc<dyn SeekMap>);
}

/// Receives the samples of one track.
pub trait TrackOutput: Send + Sync {
    fn format(&self, format: Format);

    /// Moves up to `length` bytes of the current sample from `input`.
    ///
    /// # Errors
    ///
    /// Input failures. Hitting the end of input fails unless
    /// `allow_end_of_input` is set, in which case `EndOfInput` is returned.
    fn sample_data(
        &self,
        input: &mut ExtractorInput<'_>,
        length: usize,
        allow_end_of_input: bool,
    ) -> LoadResult<ReadOutcome>;

    fn sample_bytes(&self, data: &[u8]);

    /// Commits the sample whose `size` bytes end `offset` bytes before the
    /// current write position.
    fn sample_metadata(&self, time_us: i64, flags: SampleFlags, size: usize, offset: usize);
}

/// Swallows everything, consuming sample bytes from the input.
#[derive(Debug, Default)]
pub struct DiscardingTrackOutput;

impl TrackOutput for DiscardingTrackOutput {
    fn format(&self, _format: Format) {}

    fn sample_data(
        &self,
        input: &mut ExtractorInput<'_>,
        length: usize,
        allow_end_of_input: bool,
    ) -> LoadResult<ReadOutcome> {
        input.skip(length, allow_end_of_input)
    }

    fn sample_bytes(&self, _data: &[u8]) {}

    fn sample_metadata(&self, _time_us: i64, _flags: SampleFlags, _size: usize, _offset: usize) {}
}

const SKIP_BUFFER_LEN: usize = 4096;

/// Positioned reader over an opened [`DataSource`].
///
/// When the source ends before the length it reported at open, the input
/// re-opens it at the current position and carries on. A re-open that
/// yields nothing fails with an unexpected end of input.
pub struct ExtractorInput<'a> {
    source: &'a mut dyn DataSource,
    spec: DataSpec,
    position: u64,
    /// Absolute end of the resource, when known.
    end: Option<u64>,
    reopened_without_progress: bool,
}

impl<'a> ExtractorInput<'a> {
    /// `source` must already be open at `spec.position`.
    pub fn new(source: &'a mut dyn DataSource, spec: DataSpec, end: Option<u64>) -> Self {
        Self {
            position: spec.position,
            source,
            spec,
            end,
            reopened_without_progress: false,
        }
    }

    /// Absolute position of the next byte.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Absolute length of the resource, when known.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.end
    }

    /// Reads up to `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// Source failures, or a premature end the source cannot recover from.
    pub fn read(&mut self, buf: &mut [u8]) -> LoadResult<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }
        loop {
            match self.source.read(buf)? {
                ReadOutcome::Read(count) => {
                    self.position += count as u64;
                    self.reopened_without_progress = false;
                    return Ok(ReadOutcome::Read(count));
                }
                ReadOutcome::EndOfInput => {
                    let premature = self.end.is_some_and(|end| self.position < end);
                    if !premature {
                        return Ok(ReadOutcome::EndOfInput);
                    }
                    if self.reopened_without_progress {
                        return Err(LoadError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("source ended at {} of {:?}", self.position, self.end),
                        )));
                    }
                    self.reopen()?;
                }
            }
        }
    }

    /// Fills `buf` completely.
    ///
    /// Returns `false` if the input ended before the first byte and
    /// `allow_end_of_input` is set.
    ///
    /// # Errors
    ///
    /// Source failures, or an end of input anywhere else.
    pub fn read_fully(&mut self, buf: &mut [u8], allow_end_of_input: bool) -> LoadResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                ReadOutcome::Read(count) => filled += count,
                ReadOutcome::EndOfInput if filled == 0 && allow_end_of_input => return Ok(false),
                ReadOutcome::EndOfInput => return Err(unexpected_end(self.position)),
            }
        }
        Ok(true)
    }

    /// Discards up to `length` bytes; returns how many were skipped.
    ///
    /// # Errors
    ///
    /// Source failures. An end of input before any byte fails unless
    /// `allow_end_of_input` is set.
    pub fn skip(&mut self, length: usize, allow_end_of_input: bool) -> LoadResult<ReadOutcome> {
        let mut scratch = [0_u8; SKIP_BUFFER_LEN];
        let want = length.min(SKIP_BUFFER_LEN);
        match self.read(&mut scratch[..want])? {
            ReadOutcome::EndOfInput if !allow_end_of_input => Err(unexpected_end(self.position)),
            outcome => Ok(outcome),
        }
    }

    fn reopen(&mut self) -> LoadResult<()> {
        debug!(
            position = self.position,
            end = ?self.end,
            "ExtractorInput: source ended early, reopening"
        );
        self.source.close();
        let spec = self.spec.subrange(self.position);
        if let Some(length) = self.source.open(&spec)? {
            self.end = Some(self.position + length);
        }
        self.reopened_without_progress = true;
        Ok(())
    }
}

impl fmt::Debug for ExtractorInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorInput")
            .field("position", &self.position)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unexpected_end(position: u64) -> LoadError {
    LoadError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("unexpected end of input at {position}"),
    ))
}
