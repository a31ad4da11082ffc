#![forbid(unsafe_code)]

//! Event bus for the lyra buffering core.

mod bus;
mod event;
mod load;
mod period;
mod track;

pub use bus::EventBus;
pub use event::Event;
pub use load::LoadEvent;
pub use period::PeriodEvent;
pub use track::TrackEvent;
