//! Deterministic sources and extractors for exercising a period.
//!
//! [`FakeContainer`] writes a tiny container format that [`FakeExtractor`]
//! parses incrementally, so a load can stop and resume at any byte.

use std::{collections::HashMap, io, sync::Arc};

use lyra_loader::{LoadError, LoadResult};
use lyra_sample::{Format, SampleFlags, TrackType};

use crate::{
    data_source::{DataSource, DataSpec, ReadOutcome},
    extractor::{Extractor, ExtractorInput, ExtractorOutput, ExtractorResult, TrackOutput, unexpected_end},
    seek::{IndexSeekMap, SeekMap, SeekPoint, Unseekable},
};

const MAGIC: &[u8; 4] = b"LYRA";
const FLAG_SEEKABLE: u8 = 1;
const FLAG_DURATION: u8 = 1 << 1;
const FIXED_HEADER_LEN: usize = 4 + 1 + 8 + 1;
const TRACK_ENTRY_LEN: usize = 2;
const INDEX_ENTRY_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 1 + 1 + 8 + 4;
const RECORD_KEY_FRAME: u8 = 1;
const LAST_SAMPLE_DURATION_US: i64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeTrackKind {
    Audio,
    Video,
    Text,
}

impl FakeTrackKind {
    fn code(self) -> u8 {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
            Self::Text => 2,
        }
    }

    fn from_code(code: u8) -> LoadResult<Self> {
        match code {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Video),
            2 => Ok(Self::Text),
            other => Err(LoadError::Parser(format!("unknown track kind {other}"))),
        }
    }

    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video => "video/avc",
            Self::Text => "text/vtt",
        }
    }

    fn track_type(self) -> TrackType {
        match self {
            Self::Audio => TrackType::Audio,
            Self::Video => TrackType::Video,
            Self::Text => TrackType::Text,
        }
    }
}

#[derive(Clone, Debug)]
struct FakeSample {
    track_id: u8,
    time_us: i64,
    key_frame: bool,
    payload: Vec<u8>,
}

/// Builder for the fake container.
///
/// Keyframes of the first video track (or of the first track, without
/// video) form the seek index.
#[derive(Clone, Debug)]
pub struct FakeContainer {
    tracks: Vec<(u8, FakeTrackKind)>,
    samples: Vec<FakeSample>,
    seekable: bool,
    duration_known: bool,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeContainer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            samples: Vec::new(),
            seekable: true,
            duration_known: true,
        }
    }

    #[must_use]
    pub fn with_track(mut self, id: u8, kind: FakeTrackKind) -> Self {
        self.tracks.push((id, kind));
        self
    }

    #[must_use]
    pub fn with_sample(mut self, track_id: u8, time_us: i64, key_frame: bool, payload: Vec<u8>) -> Self {
        self.samples.push(FakeSample {
            track_id,
            time_us,
            key_frame,
            payload,
        });
        self
    }

    /// Omit the seek index.
    #[must_use]
    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Leave the duration out of the header.
    #[must_use]
    pub fn without_duration(mut self) -> Self {
        self.duration_known = false;
        self
    }

    /// Payload of `size` bytes derived from the sample's identity.
    #[must_use]
    pub fn payload(track_id: u8, time_us: i64, size: usize) -> Vec<u8> {
        let seed = u64::from(track_id) * 31 + time_us.unsigned_abs();
        (0..size)
            .map(|i| (seed.wrapping_add(i as u64 * 7) % 251) as u8)
            .collect()
    }

    #[must_use]
    pub fn duration_us(&self) -> i64 {
        self.samples
            .iter()
            .map(|sample| sample.time_us)
            .max()
            .map_or(0, |last| last + LAST_SAMPLE_DURATION_US)
    }

    fn index_track(&self) -> Option<u8> {
        self.tracks
            .iter()
            .find(|(_, kind)| *kind == FakeTrackKind::Video)
            .or(self.tracks.first())
            .map(|(id, _)| *id)
    }

    fn indexed(&self) -> Vec<&FakeSample> {
        if !self.seekable {
            return Vec::new();
        }
        let index_track = self.index_track();
        self.samples
            .iter()
            .filter(|sample| sample.key_frame && Some(sample.track_id) == index_track)
            .collect()
    }

    /// Byte offset of every record, and the total stream length.
    fn layout(&self) -> (Vec<u64>, u64) {
        let header_len = FIXED_HEADER_LEN
            + TRACK_ENTRY_LEN * self.tracks.len()
            + 4
            + INDEX_ENTRY_LEN * self.indexed().len();
        let mut positions = Vec::with_capacity(self.samples.len());
        let mut position = header_len as u64;
        for sample in &self.samples {
            positions.push(position);
            position += (RECORD_HEADER_LEN + sample.payload.len()) as u64;
        }
        (positions, position)
    }

    /// Byte offset of the record holding `track_id`'s sample at `time_us`.
    #[must_use]
    pub fn record_position(&self, track_id: u8, time_us: i64) -> Option<u64> {
        let (positions, _) = self.layout();
        self.samples
            .iter()
            .position(|sample| sample.track_id == track_id && sample.time_us == time_us)
            .map(|i| positions[i])
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let indexed = self.indexed();
        let (positions, total) = self.layout();

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(MAGIC);
        let mut flags = 0;
        if self.seekable {
            flags |= FLAG_SEEKABLE;
        }
        if self.duration_known {
            flags |= FLAG_DURATION;
        }
        out.push(flags);
        out.extend_from_slice(&self.duration_us().to_le_bytes());
        out.push(self.tracks.len() as u8);
        for (id, kind) in &self.tracks {
            out.push(*id);
            out.push(kind.code());
        }
        out.extend_from_slice(&(indexed.len() as u32).to_le_bytes());
        for (i, sample) in self.samples.iter().enumerate() {
            if indexed.iter().any(|indexed| std::ptr::eq(*indexed, sample)) {
                out.extend_from_slice(&sample.time_us.to_le_bytes());
                out.extend_from_slice(&positions[i].to_le_bytes());
            }
        }
        for sample in &self.samples {
            out.push(sample.track_id);
            out.push(if sample.key_frame { RECORD_KEY_FRAME } else { 0 });
            out.extend_from_slice(&sample.time_us.to_le_bytes());
            out.extend_from_slice(&(sample.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&sample.payload);
        }
        out
    }
}

#[derive(Clone, Copy, Debug)]
enum ParseState {
    Header,
    RecordHeader,
    RecordBody {
        track_id: u8,
        flags: SampleFlags,
        time_us: i64,
        size: usize,
        remaining: usize,
    },
}

/// Parses [`FakeContainer`] streams.
pub struct FakeExtractor {
    output: Option<Arc<dyn ExtractorOutput>>,
    tracks: HashMap<u8, Arc<dyn TrackOutput>>,
    state: ParseState,
    pending: Vec<u8>,
    data_start: Option<u64>,
    read_chunk: usize,
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            output: None,
            tracks: HashMap::new(),
            state: ParseState::Header,
            pending: Vec::new(),
            data_start: None,
            read_chunk: 4096,
        }
    }

    /// Most sample bytes moved per `read` call.
    #[must_use]
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    fn output(&self) -> LoadResult<Arc<dyn ExtractorOutput>> {
        self.output
            .clone()
            .ok_or_else(|| LoadError::Unexpected("extractor read before init".to_owned()))
    }

    /// Reads into `pending` until it holds `target` bytes. Returns `false`
    /// on a clean end of input.
    fn fill(&mut self, input: &mut ExtractorInput<'_>, target: usize) -> LoadResult<bool> {
        while self.pending.len() < target {
            let start = self.pending.len();
            self.pending.resize(target, 0);
            match input.read(&mut self.pending[start..]) {
                Ok(ReadOutcome::Read(count)) => self.pending.truncate(start + count),
                Ok(ReadOutcome::EndOfInput) => {
                    self.pending.truncate(start);
                    if start == 0 {
                        return Ok(false);
                    }
                    return Err(unexpected_end(input.position()));
                }
                Err(error) => {
                    self.pending.truncate(start);
                    return Err(error);
                }
            }
        }
        Ok(true)
    }

    fn header_len(&self) -> usize {
        let pending = &self.pending;
        if pending.len() < FIXED_HEADER_LEN {
            return FIXED_HEADER_LEN;
        }
        let tracks_end = FIXED_HEADER_LEN + TRACK_ENTRY_LEN * usize::from(pending[FIXED_HEADER_LEN - 1]);
        if pending.len() < tracks_end + 4 {
            return tracks_end + 4;
        }
        let count = u32::from_le_bytes(read_array(&pending[tracks_end..]));
        tracks_end + 4 + INDEX_ENTRY_LEN * count as usize
    }

    fn parse_header(&mut self) -> LoadResult<()> {
        let header = std::mem::take(&mut self.pending);
        if &header[..4] != MAGIC {
            return Err(LoadError::Parser("bad magic".to_owned()));
        }
        let flags = header[4];
        let duration_us = i64::from_le_bytes(read_array(&header[5..]));
        let track_count = usize::from(header[FIXED_HEADER_LEN - 1]);

        let output = self.output()?;
        let mut cursor = FIXED_HEADER_LEN;
        for _ in 0..track_count {
            let id = header[cursor];
            let kind = FakeTrackKind::from_code(header[cursor + 1])?;
            cursor += TRACK_ENTRY_LEN;
            let track = output.track(u32::from(id), kind.track_type());
            track.format(
                Format::new()
                    .with_id(id.to_string())
                    .with_sample_mime_type(kind.mime()),
            );
            self.tracks.insert(id, track);
        }
        let count = u32::from_le_bytes(read_array(&header[cursor..])) as usize;
        cursor += 4;
        let points: Vec<SeekPoint> = (0..count)
            .map(|i| {
                let entry = &header[cursor + i * INDEX_ENTRY_LEN..];
                SeekPoint {
                    time_us: i64::from_le_bytes(read_array(entry)),
                    position: u64::from_le_bytes(read_array(&entry[8..])),
                }
            })
            .collect();

        let duration = (flags & FLAG_DURATION != 0).then_some(duration_us);
        let data_start = header.len() as u64;
        let seek_map: Arc<dyn SeekMap> = if flags & FLAG_SEEKABLE != 0 {
            Arc::new(IndexSeekMap::new(points, duration))
        } else {
            Arc::new(Unseekable::new(duration).with_start_position(data_start))
        };
        self.data_start = Some(data_start);
        output.end_tracks();
        output.seek_map(seek_map);
        Ok(())
    }
}

impl Extractor for FakeExtractor {
    fn init(&mut self, output: Arc<dyn ExtractorOutput>) {
        self.output = Some(output);
    }

    fn read(&mut self, input: &mut ExtractorInput<'_>) -> LoadResult<ExtractorResult> {
        match self.state {
            ParseState::Header => {
                let target = self.header_len();
                if !self.fill(input, target)? {
                    return Ok(ExtractorResult::EndOfInput);
                }
                if self.header_len() == self.pending.len() {
                    self.parse_header()?;
                    self.state = ParseState::RecordHeader;
                }
            }
            ParseState::RecordHeader => {
                if !self.fill(input, RECORD_HEADER_LEN)? {
                    return Ok(ExtractorResult::EndOfInput);
                }
                let record = std::mem::take(&mut self.pending);
                let size = u32::from_le_bytes(read_array(&record[10..])) as usize;
                let mut flags = SampleFlags::NONE;
                if record[1] & RECORD_KEY_FRAME != 0 {
                    flags.insert(SampleFlags::KEY_FRAME);
                }
                self.state = ParseState::RecordBody {
                    track_id: record[0],
                    flags,
                    time_us: i64::from_le_bytes(read_array(&record[2..])),
                    size,
                    remaining: size,
                };
            }
            ParseState::RecordBody {
                track_id,
                flags,
                time_us,
                size,
                remaining,
            } => {
                let track = self
                    .tracks
                    .get(&track_id)
                    .cloned()
                    .ok_or_else(|| LoadError::Parser(format!("sample for unknown track {track_id}")))?;
                let mut remaining = remaining;
                if remaining > 0 {
                    if let ReadOutcome::Read(count) =
                        track.sample_data(input, remaining.min(self.read_chunk), false)?
                    {
                        remaining -= count;
                    }
                }
                if remaining == 0 {
                    track.sample_metadata(time_us, flags, size, 0);
                    self.state = ParseState::RecordHeader;
                } else {
                    self.state = ParseState::RecordBody {
                        track_id,
                        flags,
                        time_us,
                        size,
                        remaining,
                    };
                }
            }
        }
        Ok(ExtractorResult::Continue)
    }

    fn seek(&mut self, position: u64, _time_us: i64) {
        self.pending.clear();
        self.state = match self.data_start {
            Some(data_start) if position >= data_start => ParseState::RecordHeader,
            _ => ParseState::Header,
        };
    }
}

/// Cuts the stream into fixed-size keyframes of one raw audio track.
///
/// Every `read` call moves exactly one chunk, so input positions stay
/// multiples of the chunk size.
pub struct ChunkExtractor {
    chunk: usize,
    sample_duration_us: i64,
    output: Option<Arc<dyn ExtractorOutput>>,
    track: Option<Arc<dyn TrackOutput>>,
    remaining: usize,
    index: u64,
}

impl ChunkExtractor {
    /// # Panics
    ///
    /// Panics if `chunk` is zero.
    #[must_use]
    pub fn new(chunk: usize, sample_duration_us: i64) -> Self {
        assert!(chunk > 0, "chunk must be positive");
        Self {
            chunk,
            sample_duration_us,
            output: None,
            track: None,
            remaining: 0,
            index: 0,
        }
    }

    fn track(&mut self) -> LoadResult<Arc<dyn TrackOutput>> {
        if let Some(track) = &self.track {
            return Ok(Arc::clone(track));
        }
        let output = self
            .output
            .clone()
            .ok_or_else(|| LoadError::Unexpected("extractor read before init".to_owned()))?;
        let track = output.track(0, TrackType::Audio);
        track.format(Format::new().with_id("0").with_sample_mime_type("audio/raw"));
        output.end_tracks();
        output.seek_map(Arc::new(Unseekable::new(None)));
        self.track = Some(Arc::clone(&track));
        Ok(track)
    }
}

impl Extractor for ChunkExtractor {
    fn init(&mut self, output: Arc<dyn ExtractorOutput>) {
        self.output = Some(output);
    }

    fn read(&mut self, input: &mut ExtractorInput<'_>) -> LoadResult<ExtractorResult> {
        let track = self.track()?;
        if self.remaining == 0 {
            self.remaining = self.chunk;
        }
        while self.remaining > 0 {
            match track.sample_data(input, self.remaining, true)? {
                ReadOutcome::Read(count) => self.remaining -= count,
                ReadOutcome::EndOfInput if self.remaining == self.chunk => {
                    self.remaining = 0;
                    return Ok(ExtractorResult::EndOfInput);
                }
                ReadOutcome::EndOfInput => return Err(unexpected_end(input.position())),
            }
        }
        let time_us = self.index as i64 * self.sample_duration_us;
        track.sample_metadata(time_us, SampleFlags::KEY_FRAME, self.chunk, 0);
        self.index += 1;
        Ok(ExtractorResult::Continue)
    }

    fn seek(&mut self, position: u64, _time_us: i64) {
        self.remaining = 0;
        self.index = position / self.chunk as u64;
    }
}

/// Wraps a source and fails on schedule.
pub struct FlakyDataSource {
    inner: Box<dyn DataSource>,
    failing_opens: u32,
    failing_reopens: u32,
    read_failures_at: Vec<u64>,
    position: u64,
}

impl FlakyDataSource {
    pub fn new(inner: impl DataSource + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            failing_opens: 0,
            failing_reopens: 0,
            read_failures_at: Vec::new(),
            position: 0,
        }
    }

    /// Fail the next `count` opens.
    #[must_use]
    pub fn with_failing_opens(mut self, count: u32) -> Self {
        self.failing_opens = count;
        self
    }

    /// Fail the next `count` opens that start past byte zero.
    #[must_use]
    pub fn with_failing_reopens(mut self, count: u32) -> Self {
        self.failing_reopens = count;
        self
    }

    /// Fail once when a read reaches `position`.
    #[must_use]
    pub fn with_read_failure_at(mut self, position: u64) -> Self {
        self.read_failures_at.push(position);
        self.read_failures_at.sort_unstable();
        self
    }

    fn injected(what: &str) -> LoadError {
        LoadError::Io(io::Error::new(io::ErrorKind::ConnectionReset, format!("injected {what} failure")))
    }
}

impl DataSource for FlakyDataSource {
    fn open(&mut self, spec: &DataSpec) -> LoadResult<Option<u64>> {
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(Self::injected("open"));
        }
        if spec.position > 0 && self.failing_reopens > 0 {
            self.failing_reopens -= 1;
            return Err(Self::injected("reopen"));
        }
        self.position = spec.position;
        self.inner.open(spec)
    }

    fn read(&mut self, buf: &mut [u8]) -> LoadResult<ReadOutcome> {
        let mut limit = buf.len();
        if let Some(&at) = self.read_failures_at.first() {
            if self.position >= at {
                self.read_failures_at.remove(0);
                return Err(Self::injected("read"));
            }
            // Bounded by `buf.len()`.
            limit = limit.min((at - self.position) as usize);
        }
        let outcome = self.inner.read(&mut buf[..limit])?;
        if let ReadOutcome::Read(count) = outcome {
            self.position += count as u64;
        }
        Ok(outcome)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
