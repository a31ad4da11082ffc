#![forbid(unsafe_code)]

//! HTTP access for progressive byte sources.
//!
//! [`Net`] is the seam: [`HttpClient`] implements it on top of `reqwest`,
//! [`TimeoutNet`] bounds the request phase of any implementation.

mod client;
mod error;
mod timeout;
mod traits;
mod types;

pub use crate::{
    client::HttpClient,
    error::{NetError, NetResult},
    timeout::TimeoutNet,
    traits::{ByteStream, Net, NetExt},
    types::{Headers, NetOptions, RangeResponse, RangeSpec},
};
