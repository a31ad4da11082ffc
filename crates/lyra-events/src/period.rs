/// Notifications about a whole media period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeriodEvent {
    /// Every track has a format and the seek map is known.
    Prepared {
        duration_us: Option<i64>,
        seekable: bool,
        track_count: usize,
    },
    /// Duration or seekability changed after preparation.
    SourceInfoRefreshed {
        duration_us: Option<i64>,
        seekable: bool,
    },
    /// Loading restarted at `position_us`.
    Seeked { position_us: i64, in_buffer: bool },
    /// Retries are exhausted; the period cannot continue.
    FatalError { error: String },
    Released,
}
