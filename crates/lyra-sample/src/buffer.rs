use std::ops::{BitOr, BitOrAssign};

/// Timestamp meaning "not set".
pub const TIME_UNSET: i64 = i64::MIN + 1;
/// Timestamp reported with the end-of-stream buffer.
pub const TIME_END_OF_SOURCE: i64 = i64::MIN;

/// Per-sample flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const END_OF_STREAM: Self = Self(1 << 2);
    /// Sample precedes the seek target: decode but do not render.
    pub const DECODE_ONLY: Self = Self(1 << 27);
    pub const FIRST_SAMPLE: Self = Self(1 << 28);
    pub const LAST_SAMPLE: Self = Self(1 << 29);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for SampleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Flags accepted by `SampleQueue::read`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadFlags(u32);

impl ReadFlags {
    pub const NONE: Self = Self(0);
    /// Report the sample without consuming it.
    pub const PEEK: Self = Self(1);
    /// Report the current format even if the reader already has it.
    pub const REQUIRE_FORMAT: Self = Self(1 << 1);
    /// Fill metadata only; leave the sample bytes in the queue.
    pub const OMIT_SAMPLE_DATA: Self = Self(1 << 2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of one read from a sample queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadResult {
    /// Nothing available yet.
    NothingRead,
    /// The format holder was filled; no sample was consumed.
    FormatRead,
    /// The buffer was filled with a sample or the end-of-stream marker.
    BufferRead,
}

/// Destination of one sample read.
#[derive(Clone, Debug)]
pub struct DecoderInputBuffer {
    pub data: Vec<u8>,
    pub time_us: i64,
    flags: SampleFlags,
}

impl Default for DecoderInputBuffer {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            time_us: TIME_UNSET,
            flags: SampleFlags::NONE,
        }
    }
}

impl DecoderInputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.time_us = TIME_UNSET;
        self.flags = SampleFlags::NONE;
    }

    #[must_use]
    pub fn flags(&self) -> SampleFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SampleFlags) {
        self.flags = flags;
    }

    pub fn add_flag(&mut self, flag: SampleFlags) {
        self.flags.insert(flag);
    }

    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
    }

    #[must_use]
    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(SampleFlags::KEY_FRAME)
    }

    #[must_use]
    pub fn is_decode_only(&self) -> bool {
        self.flags.contains(SampleFlags::DECODE_ONLY)
    }

    #[must_use]
    pub fn is_last_sample(&self) -> bool {
        self.flags.contains(SampleFlags::LAST_SAMPLE)
    }
}
