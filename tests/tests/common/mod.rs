// Common fixtures and utilities for integration tests

pub mod fixtures;
pub mod period;

pub use fixtures::*;
pub use period::*;
