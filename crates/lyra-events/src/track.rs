/// Per-track notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackEvent {
    /// A track was discovered in the container.
    Created { track_id: u32 },
    /// The upstream format of a track changed.
    FormatChanged {
        track_id: u32,
        sample_mime_type: Option<String>,
    },
    /// No more samples will be queued for the track.
    EndOfStream { track_id: u32 },
}
