//! Time to byte-position mapping and seek adjustment.

use std::fmt;

/// A position a load can restart from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekPoint {
    pub time_us: i64,
    pub position: u64,
}

impl SeekPoint {
    pub const START: Self = Self {
        time_us: 0,
        position: 0,
    };
}

/// The seek points around a requested time.
///
/// `first` is at or before the time; `second` is the next point after it,
/// or equal to `first` when there is none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekPoints {
    pub first: SeekPoint,
    pub second: SeekPoint,
}

impl SeekPoints {
    #[must_use]
    pub fn single(point: SeekPoint) -> Self {
        Self {
            first: point,
            second: point,
        }
    }
}

/// Maps media time to byte positions in a stream.
pub trait SeekMap: Send + Sync + fmt::Debug {
    fn is_seekable(&self) -> bool;

    /// Duration of the stream, when known.
    fn duration_us(&self) -> Option<i64>;

    fn seek_points(&self, time_us: i64) -> SeekPoints;
}

/// A stream that can only be read from the start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Unseekable {
    duration_us: Option<i64>,
    start_position: u64,
}

impl Unseekable {
    #[must_use]
    pub fn new(duration_us: Option<i64>) -> Self {
        Self {
            duration_us,
            start_position: 0,
        }
    }

    /// Media data begins at `start_position` rather than byte zero.
    #[must_use]
    pub fn with_start_position(mut self, start_position: u64) -> Self {
        self.start_position = start_position;
        self
    }
}

impl SeekMap for Unseekable {
    fn is_seekable(&self) -> bool {
        false
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn seek_points(&self, _time_us: i64) -> SeekPoints {
        SeekPoints::single(SeekPoint {
            time_us: 0,
            position: self.start_position,
        })
    }
}

/// Seek map over a sorted table of sync points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSeekMap {
    points: Vec<SeekPoint>,
    duration_us: Option<i64>,
}

impl IndexSeekMap {
    /// # Panics
    ///
    /// Panics if `points` is not sorted by time.
    #[must_use]
    pub fn new(points: Vec<SeekPoint>, duration_us: Option<i64>) -> Self {
        assert!(
            points.windows(2).all(|pair| pair[0].time_us <= pair[1].time_us),
            "seek points must be sorted by time"
        );
        Self {
            points,
            duration_us,
        }
    }
}

impl SeekMap for IndexSeekMap {
    fn is_seekable(&self) -> bool {
        !self.points.is_empty()
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn seek_points(&self, time_us: i64) -> SeekPoints {
        let after = self.points.partition_point(|point| point.time_us <= time_us);
        if after == 0 {
            let first = self.points.first().copied().unwrap_or(SeekPoint::START);
            return SeekPoints::single(first);
        }
        let first = self.points[after - 1];
        if first.time_us == time_us {
            return SeekPoints::single(first);
        }
        let second = self.points.get(after).copied().unwrap_or(first);
        SeekPoints { first, second }
    }
}

/// How far a seek may move from the requested time to land on a sync
/// point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekParameters {
    pub tolerance_before_us: i64,
    pub tolerance_after_us: i64,
}

impl SeekParameters {
    /// Seek exactly to the requested time.
    pub const EXACT: Self = Self::new(0, 0);
    /// Seek to whichever sync point is closest.
    pub const CLOSEST_SYNC: Self = Self::new(i64::MAX, i64::MAX);
    /// Seek to the sync point at or before the requested time.
    pub const PREVIOUS_SYNC: Self = Self::new(i64::MAX, 0);
    /// Seek to the sync point at or after the requested time.
    pub const NEXT_SYNC: Self = Self::new(0, i64::MAX);
    pub const DEFAULT: Self = Self::EXACT;

    /// # Panics
    ///
    /// Panics if a tolerance is negative.
    #[must_use]
    pub const fn new(tolerance_before_us: i64, tolerance_after_us: i64) -> Self {
        assert!(tolerance_before_us >= 0 && tolerance_after_us >= 0);
        Self {
            tolerance_before_us,
            tolerance_after_us,
        }
    }

    /// Pick the position to seek to given the sync points around
    /// `position_us`.
    #[must_use]
    pub fn resolve_seek_position_us(&self, position_us: i64, first_sync_us: i64, second_sync_us: i64) -> i64 {
        if self.tolerance_before_us == 0 && self.tolerance_after_us == 0 {
            return position_us;
        }
        let min_position_us = position_us.saturating_sub(self.tolerance_before_us);
        let max_position_us = position_us.saturating_add(self.tolerance_after_us);
        let first_valid = (min_position_us..=max_position_us).contains(&first_sync_us);
        let second_valid = (min_position_us..=max_position_us).contains(&second_sync_us);

        match (first_valid, second_valid) {
            (true, true) => {
                if first_sync_us.abs_diff(position_us) <= second_sync_us.abs_diff(position_us) {
                    first_sync_us
                } else {
                    second_sync_us
                }
            }
            (true, false) => first_sync_us,
            (false, true) => second_sync_us,
            (false, false) => min_position_us,
        }
    }
}

impl Default for SeekParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}
