use crate::{LoadEvent, PeriodEvent, TrackEvent};

/// Unified event for the buffering core.
///
/// Hierarchical: each subsystem has its own variant with a sub-enum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Load(LoadEvent),
    Track(TrackEvent),
    Period(PeriodEvent),
}

impl From<LoadEvent> for Event {
    fn from(e: LoadEvent) -> Self {
        Self::Load(e)
    }
}

impl From<TrackEvent> for Event {
    fn from(e: TrackEvent) -> Self {
        Self::Track(e)
    }
}

impl From<PeriodEvent> for Event {
    fn from(e: PeriodEvent) -> Self {
        Self::Period(e)
    }
}
