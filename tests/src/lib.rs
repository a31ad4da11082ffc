//! Fixtures shared by the integration tests and the fixture server binary.

#![forbid(unsafe_code)]

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{debug, warn};
use url::Url;

struct ServerState {
    body: Bytes,
    /// `Range` header of every media request, in arrival order.
    requests: Mutex<Vec<Option<String>>>,
}

/// Serves one in-memory resource at `/media` with byte-range support.
///
/// `/missing` always answers 404. The server stops when dropped.
pub struct RangeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RangeServer {
    /// Binds an ephemeral local port.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn spawn(body: impl Into<Bytes>) -> Self {
        Self::bind("127.0.0.1:0", body)
            .await
            .unwrap_or_else(|e| panic!("failed to bind range server: {e}"))
    }

    /// # Errors
    ///
    /// Returns an error when `addr` cannot be bound.
    pub async fn bind(addr: &str, body: impl Into<Bytes>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            body: body.into(),
            requests: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route("/media", get(media))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!(error = %e, "RangeServer: serve failed");
            }
        });
        debug!(%addr, "RangeServer: listening");

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// # Panics
    ///
    /// Panics if `path` does not form a valid url.
    #[must_use]
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}", self.addr))
            .and_then(|base| base.join(path))
            .unwrap_or_else(|e| panic!("invalid fixture path {path}: {e}"))
    }

    #[must_use]
    pub fn range_requests(&self) -> Vec<Option<String>> {
        self.state.requests.lock().clone()
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let last = len.checked_sub(1)?;
    let end = if end.is_empty() {
        last
    } else {
        end.parse::<u64>().ok()?.min(last)
    };
    (start <= end).then_some((start, end))
}

async fn media(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    state.requests.lock().push(range.clone());

    let len = state.body.len() as u64;
    let Some(range) = range else {
        return state.body.clone().into_response();
    };
    let Some((start, end)) = parse_range(&range, len) else {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{len}"))],
        )
            .into_response();
    };

    // Bounded by the body length.
    let slice = state.body.slice(start as usize..=end as usize);
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}")),
            (header::CONTENT_LENGTH, slice.len().to_string()),
        ],
        Body::from(slice),
    )
        .into_response()
}
