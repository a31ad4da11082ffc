use std::fmt;

use lyra_sample::{DecoderInputBuffer, FormatHolder, ReadFlags, ReadResult};

use crate::{error::ProgressiveResult, period::ProgressiveMediaPeriod};

/// Read side of one enabled track of a [`ProgressiveMediaPeriod`].
///
/// Created by [`ProgressiveMediaPeriod::select_tracks`]. Reads are
/// suppressed while a seek reset or discontinuity is pending.
pub struct SampleStream {
    period: ProgressiveMediaPeriod,
    track: usize,
}

impl SampleStream {
    pub(crate) fn new(period: ProgressiveMediaPeriod, track: usize) -> Self {
        Self { period, track }
    }

    /// Index of the track group this stream reads.
    #[must_use]
    pub fn track(&self) -> usize {
        self.track
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.period.is_track_ready(self.track)
    }

    /// # Errors
    ///
    /// The period's load error once its retries are exhausted.
    pub fn maybe_throw_error(&self) -> ProgressiveResult<()> {
        self.period.maybe_throw_track_error()
    }

    /// Reads the next format change or sample; see
    /// [`SampleQueue::read`](lyra_sample::SampleQueue::read).
    pub fn read_data(
        &self,
        format_holder: &mut FormatHolder,
        buffer: &mut DecoderInputBuffer,
        flags: ReadFlags,
    ) -> ReadResult {
        self.period.read_track(self.track, format_holder, buffer, flags)
    }

    /// Skips samples towards `position_us`; past the end of the buffer only
    /// once loading is done. Returns the samples skipped.
    pub fn skip_data(&self, position_us: i64) -> usize {
        self.period.skip_track(self.track, position_us)
    }
}

impl fmt::Debug for SampleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStream")
            .field("track", &self.track)
            .finish_non_exhaustive()
    }
}
