use std::{collections::VecDeque, fmt, sync::Arc};

use lyra_bufpool::Allocator;
use tracing::{trace, warn};

use crate::{
    buffer::{DecoderInputBuffer, ReadFlags, ReadResult, SampleFlags, TIME_END_OF_SOURCE},
    data_queue::SampleDataQueue,
    format::{Format, FormatHolder, OFFSET_SAMPLE_RELATIVE},
    spans::Spans,
};

/// Told when the effective upstream format of a queue changes.
///
/// Called on the producer's thread, with the producer's lock held: forward
/// the notification elsewhere rather than doing work inline.
pub trait UpstreamFormatChangedListener: Send + Sync {
    fn on_upstream_format_changed(&self, format: &Format);
}

impl<F> UpstreamFormatChangedListener for F
where
    F: Fn(&Format) + Send + Sync,
{
    fn on_upstream_format_changed(&self, format: &Format) {
        self(format);
    }
}

/// Metadata of one queued sample.
#[derive(Clone, Copy, Debug)]
struct SampleWrapper {
    offset: u64,
    size: usize,
    flags: SampleFlags,
    time_us: i64,
    source_id: u64,
}

/// Queue of samples for one track, plus the formats they carry.
///
/// The producer side (`format`, `sample_data*`, `sample_metadata`) is driven
/// by a demuxer; the read side by a renderer. Samples are addressed by an
/// absolute index that only grows until [`reset`](Self::reset).
pub struct SampleQueue {
    data: SampleDataQueue,
    samples: VecDeque<SampleWrapper>,
    formats: Spans<Format>,

    absolute_first_index: u64,
    /// Relative to the first retained sample.
    read_position: usize,
    start_time_us: i64,
    largest_discarded_timestamp_us: i64,
    largest_queued_timestamp_us: i64,
    is_last_sample_queued: bool,

    upstream_keyframe_required: bool,
    upstream_format_required: bool,
    upstream_format_adjustment_required: bool,
    upstream_format: Option<Format>,
    unadjusted_upstream_format: Option<Format>,
    upstream_source_id: u64,
    all_samples_are_sync_samples: bool,
    logged_unexpected_non_sync_sample: bool,
    sample_offset_us: i64,
    pending_splice: bool,

    downstream_format: Option<Format>,
    listener: Option<Arc<dyn UpstreamFormatChangedListener>>,
}

impl SampleQueue {
    #[must_use]
    pub fn new(allocator: Allocator) -> Self {
        Self {
            data: SampleDataQueue::new(allocator),
            samples: VecDeque::new(),
            formats: Spans::new(),
            absolute_first_index: 0,
            read_position: 0,
            start_time_us: i64::MIN,
            largest_discarded_timestamp_us: i64::MIN,
            largest_queued_timestamp_us: i64::MIN,
            is_last_sample_queued: false,
            upstream_keyframe_required: true,
            upstream_format_required: true,
            upstream_format_adjustment_required: false,
            upstream_format: None,
            unadjusted_upstream_format: None,
            upstream_source_id: 0,
            all_samples_are_sync_samples: true,
            logged_unexpected_non_sync_sample: false,
            sample_offset_us: 0,
            pending_splice: false,
            downstream_format: None,
            listener: None,
        }
    }

    pub fn set_upstream_format_change_listener(
        &mut self,
        listener: Option<Arc<dyn UpstreamFormatChangedListener>>,
    ) {
        self.listener = listener;
    }

    // ---- lifecycle ----

    /// Clear all samples. With `reset_upstream_format`, forget the upstream
    /// format as well.
    pub fn reset(&mut self, reset_upstream_format: bool) {
        self.data.reset();
        self.samples.clear();
        self.absolute_first_index = 0;
        self.read_position = 0;
        self.upstream_keyframe_required = true;
        self.start_time_us = i64::MIN;
        self.largest_discarded_timestamp_us = i64::MIN;
        self.largest_queued_timestamp_us = i64::MIN;
        self.is_last_sample_queued = false;
        self.formats.clear();
        if reset_upstream_format {
            self.unadjusted_upstream_format = None;
            self.upstream_format = None;
            self.upstream_format_required = true;
            self.all_samples_are_sync_samples = true;
        }
    }

    /// Reset everything and drop the listener.
    pub fn release(&mut self) {
        self.reset(true);
        self.listener = None;
    }

    /// Tag subsequently queued samples with `source_id`.
    pub fn source_id(&mut self, source_id: u64) {
        self.upstream_source_id = source_id;
    }

    /// Drop samples until one can be spliced in after what was already read.
    pub fn splice(&mut self) {
        self.pending_splice = true;
    }

    /// Offset added to the timestamp of every subsequently queued sample.
    pub fn set_sample_offset_us(&mut self, sample_offset_us: i64) {
        if self.sample_offset_us != sample_offset_us {
            self.sample_offset_us = sample_offset_us;
            self.upstream_format_adjustment_required = true;
        }
    }

    /// Samples before this time are marked decode-only on read.
    pub fn set_start_time_us(&mut self, start_time_us: i64) {
        self.start_time_us = start_time_us;
    }

    // ---- producer side ----

    /// Stage the format of subsequent samples.
    ///
    /// The listener is told only when the adjusted format actually changes.
    pub fn format(&mut self, unadjusted: Format) {
        let adjusted = self.adjusted_format(&unadjusted);
        self.upstream_format_adjustment_required = false;
        self.unadjusted_upstream_format = Some(unadjusted);
        if self.set_upstream_format(adjusted) {
            if let (Some(listener), Some(format)) = (&self.listener, &self.upstream_format) {
                listener.on_upstream_format_changed(format);
            }
        }
    }

    fn adjusted_format(&self, format: &Format) -> Format {
        let mut format = format.clone();
        if self.sample_offset_us != 0 && format.subsample_offset_us != OFFSET_SAMPLE_RELATIVE {
            format.subsample_offset_us += self.sample_offset_us;
        }
        format
    }

    fn set_upstream_format(&mut self, format: Format) -> bool {
        self.upstream_format_required = false;
        if self.upstream_format.as_ref() == Some(&format) {
            return false;
        }
        self.all_samples_are_sync_samples = format.all_samples_are_sync_samples();
        self.logged_unexpected_non_sync_sample = false;
        trace!(format = ?format.sample_mime_type, "SampleQueue: upstream format changed");
        self.upstream_format = Some(format);
        true
    }

    /// Append sample bytes.
    pub fn sample_data(&mut self, data: &[u8]) {
        self.data.sample_data(data);
    }

    /// Append sample bytes up to the end of the current chunk.
    pub fn sample_data_partial(&mut self, data: &[u8]) -> usize {
        self.data.sample_data_partial(data)
    }

    /// Let `fill` write up to `length` sample bytes in place.
    ///
    /// # Errors
    ///
    /// Propagates the error of `fill`.
    pub fn sample_data_with<E, F>(&mut self, length: usize, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        self.data.sample_data_with(length, fill)
    }

    /// Commit metadata for the sample whose `size` bytes end `offset` bytes
    /// before the current write position.
    ///
    /// # Panics
    ///
    /// Panics if no format was staged, or if the sample overlaps the bytes of
    /// the previous one.
    pub fn sample_metadata(&mut self, time_us: i64, mut flags: SampleFlags, size: usize, offset: usize) {
        if self.upstream_format_adjustment_required {
            if let Some(unadjusted) = self.unadjusted_upstream_format.clone() {
                self.format(unadjusted);
            }
        }

        let is_keyframe = flags.contains(SampleFlags::KEY_FRAME);
        if self.upstream_keyframe_required {
            if !is_keyframe {
                return;
            }
            self.upstream_keyframe_required = false;
        }

        let time_us = time_us + self.sample_offset_us;
        if self.all_samples_are_sync_samples {
            if time_us < self.start_time_us {
                return;
            }
            if !is_keyframe {
                if !self.logged_unexpected_non_sync_sample {
                    warn!(
                        time_us,
                        format = ?self.upstream_format.as_ref().and_then(|f| f.sample_mime_type.as_deref()),
                        "SampleQueue: non-keyframe in a keyframe-only format"
                    );
                    self.logged_unexpected_non_sync_sample = true;
                }
                flags.insert(SampleFlags::KEY_FRAME);
            }
        }

        if self.pending_splice {
            if !is_keyframe || !self.attempt_splice(time_us) {
                return;
            }
            self.pending_splice = false;
        }

        let absolute_offset = self.data.total_bytes_written() - size as u64 - offset as u64;
        self.commit_sample(time_us, flags, absolute_offset, size);
    }

    fn commit_sample(&mut self, time_us: i64, flags: SampleFlags, offset: u64, size: usize) {
        if let Some(previous) = self.samples.back() {
            assert!(
                previous.offset + previous.size as u64 <= offset,
                "sample at {offset} overlaps previous sample [{}, {})",
                previous.offset,
                previous.offset + previous.size as u64
            );
        }
        let format = self
            .upstream_format
            .clone()
            .expect("sample metadata before any format");

        self.is_last_sample_queued = flags.contains(SampleFlags::LAST_SAMPLE);
        self.largest_queued_timestamp_us = self.largest_queued_timestamp_us.max(time_us);

        if self.formats.end_value() != Some(&format) {
            self.formats.append(self.write_index(), format);
        }
        self.samples.push_back(SampleWrapper {
            offset,
            size,
            flags,
            time_us,
            source_id: self.upstream_source_id,
        });
    }

    /// Try to make room for a sample at `time_us` after a splice request.
    fn attempt_splice(&mut self, time_us: i64) -> bool {
        if self.samples.is_empty() {
            return time_us > self.largest_discarded_timestamp_us;
        }
        if self.largest_read_timestamp_us() >= time_us {
            return false;
        }
        let retain = self.count_unread_samples_before(time_us);
        // Metadata only: the spliced sample's bytes are already written.
        self.discard_upstream_sample_metadata(self.absolute_first_index + retain as u64);
        true
    }

    fn count_unread_samples_before(&self, time_us: i64) -> usize {
        let mut count = self.samples.len();
        while count > self.read_position && self.samples[count - 1].time_us >= time_us {
            count -= 1;
        }
        count
    }

    /// Drop every sample from absolute index `discard_from` on, along with
    /// its bytes.
    ///
    /// # Panics
    ///
    /// Panics if that would drop a sample that was already read.
    pub fn discard_upstream_samples(&mut self, discard_from: u64) {
        let position = self.discard_upstream_sample_metadata(discard_from);
        self.data.discard_upstream_sample_bytes(position);
    }

    /// Drop unread samples at or after `time_us`.
    ///
    /// # Panics
    ///
    /// Panics if `time_us` is not after everything already read.
    pub fn discard_upstream_from(&mut self, time_us: i64) {
        if self.samples.is_empty() {
            return;
        }
        assert!(
            time_us > self.largest_read_timestamp_us(),
            "upstream discard from {time_us} would drop read samples"
        );
        let retain = self.count_unread_samples_before(time_us);
        self.discard_upstream_samples(self.absolute_first_index + retain as u64);
    }

    fn discard_upstream_sample_metadata(&mut self, discard_from: u64) -> u64 {
        let write_index = self.write_index();
        assert!(
            discard_from <= write_index
                && usize::try_from(write_index - discard_from)
                    .is_ok_and(|count| count <= self.samples.len() - self.read_position),
            "upstream discard from {discard_from} out of unread range"
        );
        let discard_count = usize::try_from(write_index - discard_from).unwrap_or(0);
        let keep = self.samples.len() - discard_count;
        self.samples.truncate(keep);
        self.largest_queued_timestamp_us = self
            .largest_discarded_timestamp_us
            .max(self.largest_timestamp(keep));
        self.is_last_sample_queued = discard_count == 0 && self.is_last_sample_queued;
        self.formats.discard_from(discard_from);

        match self.samples.back() {
            Some(last) => last.offset + last.size as u64,
            None => self.data.first_position(),
        }
    }

    // ---- read side ----

    /// Whether a read would return something right now.
    #[must_use]
    pub fn is_ready(&self, loading_finished: bool) -> bool {
        if !self.has_next_sample() {
            return loading_finished
                || self.is_last_sample_queued
                || (self.upstream_format.is_some() && self.upstream_format != self.downstream_format);
        }
        true
    }

    /// Read the next format change or sample.
    ///
    /// A format change is always reported before the first sample it
    /// applies to. At the end of the queue the end-of-stream marker is
    /// returned once `loading_finished` or the last sample was queued.
    pub fn read(
        &mut self,
        format_holder: &mut FormatHolder,
        buffer: &mut DecoderInputBuffer,
        flags: ReadFlags,
        loading_finished: bool,
    ) -> ReadResult {
        let require_format = flags.contains(ReadFlags::REQUIRE_FORMAT);
        let (offset, size) =
            match self.peek_sample_metadata(format_holder, buffer, require_format, loading_finished) {
                None => return ReadResult::NothingRead,
                Some(SampleRead::Format) => return ReadResult::FormatRead,
                Some(SampleRead::EndOfStream) => return ReadResult::BufferRead,
                Some(SampleRead::Sample { offset, size }) => (offset, size),
            };

        let peek = flags.contains(ReadFlags::PEEK);
        if !flags.contains(ReadFlags::OMIT_SAMPLE_DATA) {
            buffer.data.clear();
            buffer.data.resize(size, 0);
            if peek {
                self.data.peek_to(offset, &mut buffer.data);
            } else {
                self.data.read_to(offset, &mut buffer.data);
            }
        }
        if !peek {
            self.read_position += 1;
        }
        ReadResult::BufferRead
    }

    fn peek_sample_metadata(
        &mut self,
        format_holder: &mut FormatHolder,
        buffer: &mut DecoderInputBuffer,
        format_required: bool,
        loading_finished: bool,
    ) -> Option<SampleRead> {
        if !self.has_next_sample() {
            if loading_finished || self.is_last_sample_queued {
                buffer.data.clear();
                buffer.set_flags(SampleFlags::END_OF_STREAM);
                buffer.time_us = TIME_END_OF_SOURCE;
                return Some(SampleRead::EndOfStream);
            }
            let upstream = self.upstream_format.clone()?;
            if format_required || Some(&upstream) != self.downstream_format.as_ref() {
                self.on_format_result(upstream, format_holder);
                return Some(SampleRead::Format);
            }
            return None;
        }

        let format = self.formats.get(self.read_index());
        if format_required || Some(format) != self.downstream_format.as_ref() {
            let format = format.clone();
            self.on_format_result(format, format_holder);
            return Some(SampleRead::Format);
        }

        let sample = self.samples[self.read_position];
        buffer.set_flags(sample.flags);
        if self.read_position == self.samples.len() - 1
            && (loading_finished || self.is_last_sample_queued)
        {
            buffer.add_flag(SampleFlags::LAST_SAMPLE);
        }
        buffer.time_us = sample.time_us;
        if sample.time_us < self.start_time_us {
            buffer.add_flag(SampleFlags::DECODE_ONLY);
        }
        Some(SampleRead::Sample {
            offset: sample.offset,
            size: sample.size,
        })
    }

    fn on_format_result(&mut self, format: Format, holder: &mut FormatHolder) {
        trace!(format = ?format.sample_mime_type, "SampleQueue: format read");
        holder.format = Some(format.clone());
        self.downstream_format = Some(format);
    }

    /// Move the read position to `time_us`.
    ///
    /// Lands on the first sample at or after `time_us` when every sample is a
    /// sync sample, otherwise on the keyframe at or before it. Returns
    /// `false` and leaves the queue rewound when the time is not buffered.
    pub fn seek_to(&mut self, time_us: i64, allow_time_beyond_buffer: bool) -> bool {
        self.rewind();
        let Some(first) = self.samples.front() else {
            return false;
        };
        if time_us < first.time_us
            || (time_us > self.largest_queued_timestamp_us && !allow_time_beyond_buffer)
        {
            return false;
        }
        let found = if self.all_samples_are_sync_samples {
            self.find_sample_after(0, self.samples.len(), time_us, allow_time_beyond_buffer)
        } else {
            self.find_sample_before(0, self.samples.len(), time_us, true)
        };
        let Some(offset) = found else {
            return false;
        };
        trace!(time_us, index = self.absolute_first_index + offset as u64, "SampleQueue: seek");
        self.start_time_us = time_us;
        self.read_position = offset;
        true
    }

    /// Move the read position to absolute `index`.
    pub fn seek_to_index(&mut self, index: u64) -> bool {
        self.rewind();
        if index < self.absolute_first_index || index > self.write_index() {
            return false;
        }
        self.start_time_us = i64::MIN;
        self.read_position = usize::try_from(index - self.absolute_first_index).unwrap_or(0);
        true
    }

    fn rewind(&mut self) {
        self.read_position = 0;
        self.data.rewind();
    }

    /// How many samples a renderer may skip to reach `time_us`.
    #[must_use]
    pub fn get_skip_count(&self, time_us: i64, allow_end_of_queue: bool) -> usize {
        if !self.has_next_sample() || time_us < self.samples[self.read_position].time_us {
            return 0;
        }
        let remaining = self.samples.len() - self.read_position;
        if time_us > self.largest_queued_timestamp_us && allow_end_of_queue {
            return remaining;
        }
        self.find_sample_before(self.read_position, remaining, time_us, true)
            .unwrap_or(0)
    }

    /// Advance the read position by `count` samples.
    ///
    /// # Panics
    ///
    /// Panics if that would pass the write position.
    pub fn skip(&mut self, count: usize) {
        assert!(
            self.read_position + count <= self.samples.len(),
            "skip of {count} past the write position"
        );
        self.read_position += count;
    }

    /// Discard samples before `time_us` (or the keyframe before it).
    pub fn discard_to(&mut self, time_us: i64, to_keyframe: bool, stop_at_read_position: bool) {
        if let Some(position) = self.discard_sample_metadata_to(time_us, to_keyframe, stop_at_read_position) {
            self.data.discard_downstream_to(position);
        }
    }

    /// Discard everything already read.
    pub fn discard_to_read(&mut self) {
        if self.read_position > 0 {
            let position = self.discard_samples(self.read_position);
            self.data.discard_downstream_to(position);
        }
    }

    /// Discard every queued sample.
    pub fn discard_to_end(&mut self) {
        if !self.samples.is_empty() {
            let position = self.discard_samples(self.samples.len());
            self.data.discard_downstream_to(position);
        }
    }

    fn discard_sample_metadata_to(
        &mut self,
        time_us: i64,
        to_keyframe: bool,
        stop_at_read_position: bool,
    ) -> Option<u64> {
        let first = self.samples.front()?;
        if time_us < first.time_us {
            return None;
        }
        let search_length = if stop_at_read_position && self.read_position != self.samples.len() {
            self.read_position + 1
        } else {
            self.samples.len()
        };
        let count = self.find_sample_before(0, search_length, time_us, to_keyframe)?;
        Some(self.discard_samples(count))
    }

    /// Drop the first `count` samples; returns the byte position where the
    /// retained data starts.
    fn discard_samples(&mut self, count: usize) -> u64 {
        self.largest_discarded_timestamp_us = self
            .largest_discarded_timestamp_us
            .max(self.largest_timestamp(count));
        let last_discarded = if count > 0 { Some(self.samples[count - 1]) } else { None };
        self.samples.drain(..count);
        self.absolute_first_index += count as u64;
        self.read_position = self.read_position.saturating_sub(count);
        self.formats.discard_to(self.absolute_first_index);

        match (self.samples.front(), last_discarded) {
            (Some(first), _) => first.offset,
            (None, Some(last)) => last.offset + last.size as u64,
            (None, None) => self.data.first_position(),
        }
    }

    /// Index (relative to `start`) of the last sample within `length` whose
    /// time is at most `time_us`, optionally restricted to keyframes.
    fn find_sample_before(&self, start: usize, length: usize, time_us: i64, keyframe: bool) -> Option<usize> {
        let mut found = None;
        for (i, sample) in self.samples.iter().skip(start).take(length).enumerate() {
            if sample.time_us > time_us {
                break;
            }
            if !keyframe || sample.flags.contains(SampleFlags::KEY_FRAME) {
                found = Some(i);
                if sample.time_us == time_us {
                    break;
                }
            }
        }
        found
    }

    fn find_sample_after(
        &self,
        start: usize,
        length: usize,
        time_us: i64,
        allow_time_beyond_buffer: bool,
    ) -> Option<usize> {
        self.samples
            .iter()
            .skip(start)
            .take(length)
            .position(|s| s.time_us >= time_us)
            .or(allow_time_beyond_buffer.then_some(length))
    }

    /// Largest timestamp among the first `count` samples, scanning back only
    /// to the closest keyframe.
    fn largest_timestamp(&self, count: usize) -> i64 {
        let mut largest = i64::MIN;
        for sample in self.samples.iter().take(count).rev() {
            largest = largest.max(sample.time_us);
            if sample.flags.contains(SampleFlags::KEY_FRAME) {
                break;
            }
        }
        largest
    }

    // ---- queries ----

    fn has_next_sample(&self) -> bool {
        self.read_position != self.samples.len()
    }

    #[must_use]
    pub fn first_index(&self) -> u64 {
        self.absolute_first_index
    }

    #[must_use]
    pub fn read_index(&self) -> u64 {
        self.absolute_first_index + self.read_position as u64
    }

    #[must_use]
    pub fn write_index(&self) -> u64 {
        self.absolute_first_index + self.samples.len() as u64
    }

    /// Source id of the next sample to read, or the upstream one.
    #[must_use]
    pub fn peek_source_id(&self) -> u64 {
        self.samples
            .get(self.read_position)
            .map_or(self.upstream_source_id, |s| s.source_id)
    }

    #[must_use]
    pub fn upstream_format(&self) -> Option<&Format> {
        if self.upstream_format_required {
            None
        } else {
            self.upstream_format.as_ref()
        }
    }

    #[must_use]
    pub fn largest_queued_timestamp_us(&self) -> i64 {
        self.largest_queued_timestamp_us
    }

    #[must_use]
    pub fn largest_read_timestamp_us(&self) -> i64 {
        self.largest_discarded_timestamp_us
            .max(self.largest_timestamp(self.read_position))
    }

    #[must_use]
    pub fn first_timestamp_us(&self) -> i64 {
        self.samples.front().map_or(i64::MIN, |s| s.time_us)
    }

    #[must_use]
    pub fn is_last_sample_queued(&self) -> bool {
        self.is_last_sample_queued
    }

    #[must_use]
    pub fn total_bytes_written(&self) -> u64 {
        self.data.total_bytes_written()
    }
}

enum SampleRead {
    Format,
    EndOfStream,
    Sample { offset: u64, size: usize },
}

impl fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleQueue")
            .field("first_index", &self.absolute_first_index)
            .field("read_position", &self.read_position)
            .field("length", &self.samples.len())
            .field("upstream_format", &self.upstream_format)
            .finish_non_exhaustive()
    }
}
