//! All integration tests for lyra
#![expect(
    clippy::unwrap_used,
    reason = "unwraps are acceptable in test code"
)]

mod common;
mod lyra_progressive;
