//! Byte sources a load reads from.

use std::{fmt, sync::Arc};

use lyra_loader::LoadResult;
use lyra_platform::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outcome of one read from a [`DataSource`] or an extractor input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were read; never zero for a non-empty buffer.
    Read(usize),
    EndOfInput,
}

/// Where and how much to read.
#[derive(Clone, Debug)]
pub struct DataSpec {
    pub uri: Option<Url>,
    /// Absolute byte offset to start at.
    pub position: u64,
    /// Bytes to read from `position`, or to the end when `None`.
    pub length: Option<u64>,
    /// Cache key that overrides the uri.
    pub key: Option<String>,
    /// Fires when the load reading this spec is cancelled. Sources that
    /// block on the network should observe it.
    pub cancel: CancellationToken,
}

impl DataSpec {
    #[must_use]
    pub fn new(uri: Option<Url>) -> Self {
        Self {
            uri,
            position: 0,
            length: None,
            key: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The same resource from `position` on, open-ended.
    #[must_use]
    pub fn subrange(&self, position: u64) -> Self {
        Self {
            position,
            length: None,
            ..self.clone()
        }
    }
}

/// A readable byte resource.
///
/// Used from the load thread only; `open` / `read` may block.
pub trait DataSource: Send {
    /// Opens the resource at `spec.position`.
    ///
    /// Returns how many bytes can be read from there, when known.
    ///
    /// # Errors
    ///
    /// Any failure to reach the resource.
    fn open(&mut self, spec: &DataSpec) -> LoadResult<Option<u64>>;

    /// # Errors
    ///
    /// Any failure while reading the opened resource.
    fn read(&mut self, buf: &mut [u8]) -> LoadResult<ReadOutcome>;

    /// Closes the resource. Safe to call when not open.
    fn close(&mut self);
}

/// Counters shared between a [`ByteArrayDataSource`] and whoever watches it.
#[derive(Clone, Default)]
pub struct SourceProbe {
    inner: Arc<Mutex<ProbeState>>,
}

#[derive(Default)]
struct ProbeState {
    opens: Vec<u64>,
    bytes_read: u64,
}

impl SourceProbe {
    /// Positions of every `open`, in order.
    #[must_use]
    pub fn opens(&self) -> Vec<u64> {
        self.inner.lock().opens.clone()
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.inner.lock().bytes_read
    }

    fn record_open(&self, position: u64) {
        self.inner.lock().opens.push(position);
    }

    fn record_read(&self, count: usize) {
        self.inner.lock().bytes_read += count as u64;
    }
}

impl fmt::Debug for SourceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SourceProbe")
            .field("opens", &state.opens)
            .field("bytes_read", &state.bytes_read)
            .finish()
    }
}

/// In-memory source.
///
/// With [`with_max_bytes_per_open`](Self::with_max_bytes_per_open) each
/// connection ends early, like a server dropping the connection.
#[derive(Debug)]
pub struct ByteArrayDataSource {
    data: Arc<[u8]>,
    max_bytes_per_open: Option<u64>,
    report_length: bool,
    probe: SourceProbe,
    opened: Option<Cursor>,
}

#[derive(Debug)]
struct Cursor {
    position: usize,
    /// End of what this connection serves.
    end: usize,
}

impl ByteArrayDataSource {
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            max_bytes_per_open: None,
            report_length: true,
            probe: SourceProbe::default(),
            opened: None,
        }
    }

    #[must_use]
    pub fn with_max_bytes_per_open(mut self, max: u64) -> Self {
        self.max_bytes_per_open = Some(max);
        self
    }

    /// Report an unknown length from `open`, like a live stream.
    #[must_use]
    pub fn with_unknown_length(mut self) -> Self {
        self.report_length = false;
        self
    }

    #[must_use]
    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

impl DataSource for ByteArrayDataSource {
    fn open(&mut self, spec: &DataSpec) -> LoadResult<Option<u64>> {
        let len = self.data.len() as u64;
        let start = spec.position.min(len);
        let available = spec.length.map_or(len - start, |length| length.min(len - start));
        let served = self
            .max_bytes_per_open
            .map_or(available, |max| max.min(available));

        self.probe.record_open(spec.position);
        // Whole-buffer positions always fit in usize.
        self.opened = Some(Cursor {
            position: start as usize,
            end: (start + served) as usize,
        });
        Ok(self.report_length.then_some(available))
    }

    fn read(&mut self, buf: &mut [u8]) -> LoadResult<ReadOutcome> {
        let Some(cursor) = self.opened.as_mut() else {
            return Ok(ReadOutcome::EndOfInput);
        };
        if buf.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }
        let remaining = cursor.end - cursor.position;
        if remaining == 0 {
            return Ok(ReadOutcome::EndOfInput);
        }
        let count = remaining.min(buf.len());
        buf[..count].copy_from_slice(&self.data[cursor.position..cursor.position + count]);
        cursor.position += count;
        self.probe.record_read(count);
        Ok(ReadOutcome::Read(count))
    }

    fn close(&mut self) {
        self.opened = None;
    }
}
