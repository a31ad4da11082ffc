use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use lyra_loader::{LoadResult, Loadable};
use lyra_looper::Handler;
use lyra_platform::{BlockOutcome, ConditionVariable, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    data_source::{DataSource, DataSpec},
    extractor::{Extractor, ExtractorInput, ExtractorOutput, ExtractorResult},
    period::PeriodMsg,
};

/// The source and extractor a period owns, shared by its loads.
pub(crate) struct ExtractorSession {
    pub(crate) data_source: Box<dyn DataSource>,
    pub(crate) extractor: Box<dyn Extractor>,
    initialized: bool,
}

impl ExtractorSession {
    pub(crate) fn new(data_source: Box<dyn DataSource>, extractor: Box<dyn Extractor>) -> Self {
        Self {
            data_source,
            extractor,
            initialized: false,
        }
    }
}

#[derive(Debug)]
struct LoadPosition {
    position: u64,
    seek_time_us: i64,
    pending_extractor_seek: bool,
}

/// Reads the period's source through its extractor, pausing at each
/// watermark until the period lets it continue.
pub struct ExtractingLoadable {
    spec: DataSpec,
    session: Arc<Mutex<ExtractorSession>>,
    output: Arc<dyn ExtractorOutput>,
    load_condition: Arc<ConditionVariable>,
    handler: Handler<PeriodMsg>,
    length_known: Arc<AtomicBool>,
    check_interval_bytes: u64,
    position: Mutex<LoadPosition>,
    cancel: CancellationToken,
    bytes_loaded: AtomicU64,
}

impl ExtractingLoadable {
    pub(crate) fn new(
        spec: DataSpec,
        session: Arc<Mutex<ExtractorSession>>,
        output: Arc<dyn ExtractorOutput>,
        load_condition: Arc<ConditionVariable>,
        handler: Handler<PeriodMsg>,
        length_known: Arc<AtomicBool>,
        check_interval_bytes: u64,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            spec: spec.with_cancel(cancel.clone()),
            session,
            output,
            load_condition,
            handler,
            length_known,
            check_interval_bytes,
            position: Mutex::new(LoadPosition {
                position: 0,
                seek_time_us: 0,
                pending_extractor_seek: false,
            }),
            cancel,
            bytes_loaded: AtomicU64::new(0),
        }
    }

    /// Start (or restart) at `position`, which maps to `time_us`. The
    /// extractor is told about the jump before it reads again.
    pub fn set_load_position(&self, position: u64, time_us: i64) {
        let mut state = self.position.lock();
        state.position = position;
        state.seek_time_us = time_us;
        state.pending_extractor_seek = true;
    }

    /// Byte position the next attempt opens at.
    #[must_use]
    pub fn load_position(&self) -> u64 {
        self.position.lock().position
    }

    /// One open-read-close cycle.
    fn load_once(&self, session: &mut ExtractorSession) -> LoadResult<ExtractorResult> {
        // The pending seek survives a failed open; it is cleared only once
        // the extractor has seen it.
        let (mut position, pending_seek) = {
            let state = self.position.lock();
            (
                state.position,
                state.pending_extractor_seek.then_some(state.seek_time_us),
            )
        };
        let spec = self.spec.subrange(position);
        let length = session.data_source.open(&spec)?;
        let end = length.map(|length| position + length);
        if end.is_some() {
            self.length_known.store(true, Ordering::Release);
        }
        trace!(position, ?end, "ExtractingLoadable: opened");

        if !session.initialized {
            session.extractor.init(Arc::clone(&self.output));
            session.initialized = true;
        }
        if let Some(time_us) = pending_seek {
            session.extractor.seek(position, time_us);
            self.position.lock().pending_extractor_seek = false;
        }

        let mut input = ExtractorInput::new(session.data_source.as_mut(), spec, end);
        let mut result = ExtractorResult::Continue;
        let outcome = loop {
            if result != ExtractorResult::Continue || self.cancel.is_cancelled() {
                break Ok(result);
            }
            if self.load_condition.block(&self.cancel) == BlockOutcome::Cancelled {
                break Ok(result);
            }
            result = match session.extractor.read(&mut input) {
                Ok(result) => result,
                Err(error) => break Err(error),
            };
            let current = input.position();
            self.bytes_loaded.store(current, Ordering::Relaxed);
            if current >= position + self.check_interval_bytes {
                position = current;
                self.load_condition.close();
                trace!(position, "ExtractingLoadable: watermark reached");
                if self.handler.send(PeriodMsg::ContinueLoadingRequested).is_err() {
                    debug!("ExtractingLoadable: continue request dropped, period looper quit");
                }
            }
        };

        if !matches!(outcome, Ok(ExtractorResult::Seek(_))) {
            self.position.lock().position = input.position();
        }
        outcome
    }
}

impl Loadable for ExtractingLoadable {
    fn load(&self) -> LoadResult<()> {
        let mut session = self.session.lock();
        let mut result = ExtractorResult::Continue;
        while result == ExtractorResult::Continue && !self.cancel.is_cancelled() {
            let attempt = self.load_once(&mut session);
            session.data_source.close();
            result = match attempt? {
                ExtractorResult::Seek(position) => {
                    debug!(position, "ExtractingLoadable: extractor requested seek");
                    self.position.lock().position = position;
                    ExtractorResult::Continue
                }
                other => other,
            };
        }
        Ok(())
    }

    fn cancel_load(&self) {
        // Wakes a load blocked on the condition.
        self.cancel.cancel();
    }

    fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ExtractingLoadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractingLoadable")
            .field("position", &self.position.lock())
            .field("canceled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
