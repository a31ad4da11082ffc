use std::{fmt, future::Future, sync::Arc};

use bytes::{Buf, Bytes};
use futures::StreamExt;
use lyra_loader::{LoadError, LoadResult};
use lyra_net::{ByteStream, Headers, Net, NetError, RangeSpec};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::data_source::{DataSource, DataSpec, ReadOutcome};

/// [`DataSource`] over HTTP range requests.
///
/// Blocking calls drive the async client on `runtime`; they must come from
/// a thread outside that runtime, such as a loader thread. Reads return
/// early when the spec's cancellation token fires.
pub struct HttpDataSource<N> {
    net: Arc<N>,
    headers: Option<Headers>,
    runtime: Handle,
    opened: Option<Opened>,
}

struct Opened {
    stream: ByteStream,
    pending: Bytes,
    /// Leading bytes to drop when the server ignored the range.
    skip: u64,
    cancel: CancellationToken,
}

impl<N: Net> HttpDataSource<N> {
    pub fn new(net: Arc<N>, runtime: Handle) -> Self {
        Self {
            net,
            headers: None,
            runtime,
            opened: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    fn block_on<F: Future>(&self, cancel: &CancellationToken, future: F) -> LoadResult<F::Output> {
        self.runtime.block_on(async {
            tokio::select! {
                () = cancel.cancelled() => Err(LoadError::Cancelled),
                output = future => Ok(output),
            }
        })
    }

    fn next_chunk(&mut self) -> LoadResult<Option<Bytes>> {
        let Some(mut opened) = self.opened.take() else {
            return Ok(None);
        };
        let cancel = opened.cancel.clone();
        let next = self.block_on(&cancel, opened.stream.next());
        self.opened = Some(opened);
        match next? {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(error)) => Err(load_error(&error)),
        }
    }
}

impl<N: Net + 'static> DataSource for HttpDataSource<N> {
    fn open(&mut self, spec: &DataSpec) -> LoadResult<Option<u64>> {
        self.close();
        let url = spec
            .uri
            .clone()
            .ok_or_else(|| LoadError::Unexpected("http source opened without a uri".to_owned()))?;
        let range = RangeSpec::with_length(spec.position, spec.length).map_err(|error| load_error(&error))?;

        let net = Arc::clone(&self.net);
        let headers = self.headers.clone();
        let response = self
            .block_on(&spec.cancel, net.get_range(url, range, headers))?
            .map_err(|error| load_error(&error))?;

        let (length, skip) = if response.is_partial() {
            (response.content_length(), 0)
        } else {
            // Range ignored: the body starts at byte zero.
            let length = response
                .total_length()
                .map(|total| total.saturating_sub(spec.position));
            (length, spec.position)
        };
        debug!(
            position = spec.position,
            status = response.status,
            ?length,
            skip,
            "HttpDataSource: opened"
        );
        self.opened = Some(Opened {
            stream: response.stream,
            pending: Bytes::new(),
            skip,
            cancel: spec.cancel.clone(),
        });
        Ok(length)
    }

    fn read(&mut self, buf: &mut [u8]) -> LoadResult<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }
        loop {
            let Some(opened) = self.opened.as_mut() else {
                return Ok(ReadOutcome::EndOfInput);
            };
            if opened.skip > 0 && !opened.pending.is_empty() {
                let dropped = opened.skip.min(opened.pending.len() as u64);
                // Bounded by `pending.len()`.
                opened.pending.advance(dropped as usize);
                opened.skip -= dropped;
            }
            if opened.skip == 0 && !opened.pending.is_empty() {
                let count = buf.len().min(opened.pending.len());
                opened.pending.copy_to_slice(&mut buf[..count]);
                return Ok(ReadOutcome::Read(count));
            }
            match self.next_chunk()? {
                Some(chunk) => {
                    trace!(len = chunk.len(), "HttpDataSource: chunk");
                    if let Some(opened) = self.opened.as_mut() {
                        opened.pending = chunk;
                    }
                }
                None => return Ok(ReadOutcome::EndOfInput),
            }
        }
    }

    fn close(&mut self) {
        self.opened = None;
    }
}

impl<N> fmt::Debug for HttpDataSource<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDataSource")
            .field("open", &self.opened.is_some())
            .finish_non_exhaustive()
    }
}

fn load_error(error: &NetError) -> LoadError {
    LoadError::Net {
        status: error.status_code(),
        message: error.to_string(),
    }
}
