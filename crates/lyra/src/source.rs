use std::sync::Arc;

use lyra_net::{HttpClient, NetExt};
use lyra_progressive::{Extractor, HttpDataSource, ProgressiveMediaPeriod};
use tokio::runtime::Handle;
use tracing::debug;

use crate::{config::SourceConfig, error::LyraResult};

/// Builds a period that streams `config.url` over HTTP through `extractor`.
///
/// Network I/O runs on `runtime`; the period's own threads block on it, so
/// it must be a multi-threaded runtime that outlives the period.
///
/// # Errors
///
/// Fails when the HTTP client or the period's threads cannot be created.
pub fn open_progressive(
    config: SourceConfig,
    extractor: Box<dyn Extractor>,
    runtime: Handle,
) -> LyraResult<ProgressiveMediaPeriod> {
    let SourceConfig {
        url,
        headers,
        net,
        connect_timeout,
        period,
    } = config;
    let client = HttpClient::new(net)?.with_timeout(connect_timeout);
    let mut source = HttpDataSource::new(Arc::new(client), runtime);
    if let Some(headers) = headers {
        source = source.with_headers(headers);
    }
    debug!(%url, period = %period.name, "open_progressive");
    let period = ProgressiveMediaPeriod::new(Some(url), Box::new(source), extractor, period)?;
    Ok(period)
}
