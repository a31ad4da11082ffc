/// Lifecycle of one load attempt, as seen by the stream orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadEvent {
    /// A loadable started reading at `position`.
    Started { load_id: u64, position: u64 },
    /// The loadable ran to completion.
    Completed { load_id: u64, bytes_loaded: u64 },
    /// The loadable stopped early because it was cancelled.
    Canceled { load_id: u64, released: bool },
    /// The loadable failed; `will_retry` tells whether another attempt follows.
    Error {
        load_id: u64,
        error: String,
        will_retry: bool,
    },
}
