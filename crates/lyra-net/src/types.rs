use std::{collections::HashMap, fmt, time::Duration};

use crate::{error::NetError, traits::ByteStream};

/// Request or response headers. Names are case-insensitive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.inner
            .insert(key.into().to_ascii_lowercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// `Content-Length`, if present and numeric.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        let mut headers = Self::new();
        for (k, v) in map {
            headers.insert(k, v);
        }
        headers
    }
}

/// An HTTP byte range; `end` is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    /// # Errors
    ///
    /// Returns [`NetError::InvalidRange`] if `end < start`.
    pub fn new(start: u64, end: Option<u64>) -> Result<Self, NetError> {
        if end.is_some_and(|end| end < start) {
            return Err(NetError::InvalidRange(format!("{start}-{end:?}")));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// `length` bytes from `start`; open-ended when `length` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidRange`] for a zero length.
    pub fn with_length(start: u64, length: Option<u64>) -> Result<Self, NetError> {
        match length {
            None => Ok(Self::from_start(start)),
            Some(0) => Err(NetError::InvalidRange(format!("{start}+0"))),
            Some(length) => Self::new(start, Some(start + length - 1)),
        }
    }

    #[must_use]
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Status, headers and streamed body of a range request.
pub struct RangeResponse {
    pub status: u16,
    pub headers: Headers,
    pub stream: ByteStream,
}

impl RangeResponse {
    /// The server honoured the range.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Length of the body.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.headers.content_length()
    }

    /// Length of the whole resource, when the server states it.
    #[must_use]
    pub fn total_length(&self) -> Option<u64> {
        if !self.is_partial() {
            return self.content_length();
        }
        let range = self.headers.get("content-range")?;
        let (_, total) = range.rsplit_once('/')?;
        total.trim().parse().ok()
    }
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct NetOptions {
    pub request_timeout: Duration,
    /// Max idle connections per host. Set to 0 to disable pooling and reduce memory.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 0,
        }
    }
}

impl NetOptions {
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }
}
