//! Configuration for [`open_progressive`](crate::open_progressive).

use std::time::Duration;

use lyra_net::{Headers, NetOptions};
use lyra_progressive::ProgressiveConfig;
use url::Url;

use crate::error::LyraResult;

/// Where a progressive stream comes from and how to load it.
///
/// # Example
///
/// ```ignore
/// use lyra::SourceConfig;
///
/// let config = SourceConfig::new("https://example.com/song.mp3")?
///     .with_connect_timeout(Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: Url,
    /// Extra request headers sent with every range request.
    pub headers: Option<Headers>,
    pub net: NetOptions,
    /// Bound on the request phase, until response headers arrive. The
    /// body stream is not affected.
    pub connect_timeout: Duration,
    pub period: ProgressiveConfig,
}

impl SourceConfig {
    /// # Errors
    ///
    /// Returns an error when `url` does not parse.
    pub fn new(url: impl AsRef<str>) -> LyraResult<Self> {
        Ok(Self::from_url(Url::parse(url.as_ref())?))
    }

    #[must_use]
    pub fn from_url(url: Url) -> Self {
        Self {
            url,
            headers: None,
            net: NetOptions::default(),
            connect_timeout: Duration::from_secs(10),
            period: ProgressiveConfig::default(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub fn with_net_options(mut self, net: NetOptions) -> Self {
        self.net = net;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_period_config(mut self, period: ProgressiveConfig) -> Self {
        self.period = period;
        self
    }
}
