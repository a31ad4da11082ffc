//! Sample format description.

/// Marks subsample timestamps as relative to their sample.
pub const OFFSET_SAMPLE_RELATIVE: i64 = i64::MAX;

/// Coarse classification derived from the sample MIME type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
    Text,
    Unknown,
}

/// Describes the samples of one track.
///
/// Two formats are the same format exactly when they compare equal; the
/// sample store relies on this to record format changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Format {
    pub id: Option<String>,
    pub container_mime_type: Option<String>,
    pub sample_mime_type: Option<String>,
    pub codecs: Option<String>,
    pub average_bitrate: Option<u32>,
    pub max_input_size: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f32>,
    pub channel_count: Option<u16>,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
    /// Offset applied to subsample timestamps, or [`OFFSET_SAMPLE_RELATIVE`].
    pub subsample_offset_us: i64,
}

impl Format {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subsample_offset_us: OFFSET_SAMPLE_RELATIVE,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_container_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.container_mime_type = Some(mime.into());
        self
    }

    #[must_use]
    pub fn with_sample_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.sample_mime_type = Some(mime.into());
        self
    }

    #[must_use]
    pub fn with_codecs(mut self, codecs: impl Into<String>) -> Self {
        self.codecs = Some(codecs.into());
        self
    }

    #[must_use]
    pub fn with_average_bitrate(mut self, bitrate: u32) -> Self {
        self.average_bitrate = Some(bitrate);
        self
    }

    #[must_use]
    pub fn with_max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    #[must_use]
    pub fn with_frame_rate(mut self, frame_rate: f32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    #[must_use]
    pub fn with_audio(mut self, channel_count: u16, sample_rate: u32) -> Self {
        self.channel_count = Some(channel_count);
        self.sample_rate = Some(sample_rate);
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_subsample_offset_us(mut self, offset: i64) -> Self {
        self.subsample_offset_us = offset;
        self
    }

    #[must_use]
    pub fn track_type(&self) -> TrackType {
        track_type_of(self.sample_mime_type.as_deref())
    }

    /// Whether every sample of this format can be decoded on its own.
    #[must_use]
    pub fn all_samples_are_sync_samples(&self) -> bool {
        all_samples_are_sync_samples(self.sample_mime_type.as_deref(), self.codecs.as_deref())
    }
}

#[must_use]
pub fn track_type_of(mime: Option<&str>) -> TrackType {
    let Some(mime) = mime else {
        return TrackType::Unknown;
    };
    match mime.split('/').next() {
        Some("audio") => TrackType::Audio,
        Some("video") => TrackType::Video,
        Some("text") => TrackType::Text,
        _ if mime == "application/x-subrip" || mime == "application/ttml+xml" => TrackType::Text,
        _ => TrackType::Unknown,
    }
}

/// Audio encodings whose every frame is a sync sample.
#[must_use]
pub fn all_samples_are_sync_samples(mime: Option<&str>, codecs: Option<&str>) -> bool {
    match mime {
        Some(
            "audio/mpeg" | "audio/mpeg-L1" | "audio/mpeg-L2" | "audio/raw" | "audio/g711-alaw"
            | "audio/g711-mlaw" | "audio/flac" | "audio/ac3" | "audio/eac3" | "audio/eac3-joc",
        ) => true,
        // xHE-AAC (object type 42) carries non-sync frames.
        Some("audio/mp4a-latm") => codecs
            .and_then(|c| c.strip_prefix("mp4a.40."))
            .and_then(|ot| ot.parse::<u8>().ok())
            .is_some_and(|object_type| object_type != 42),
        _ => false,
    }
}

/// Receives the format produced by a format read.
#[derive(Clone, Debug, Default)]
pub struct FormatHolder {
    pub format: Option<Format>,
}
