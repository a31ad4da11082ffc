use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use lyra_bufpool::{Allocator, Pool};
use lyra_events::{EventBus, LoadEvent, PeriodEvent, TrackEvent};
use lyra_loader::{
    DataType, LoadError, LoadErrorAction, LoadErrorHandlingPolicy, LoadErrorInfo, LoadInfo,
    Loader, LoaderCallback,
};
use lyra_looper::{Handler, Looper, Payload};
use lyra_platform::{ConditionVariable, Mutex};
use lyra_sample::{
    DecoderInputBuffer, Format, FormatHolder, ReadFlags, ReadResult, SampleQueue,
    TIME_END_OF_SOURCE, TrackType, UpstreamFormatChangedListener,
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    config::ProgressiveConfig,
    data_source::{DataSource, DataSpec},
    error::{ProgressiveError, ProgressiveResult},
    extractor::{DiscardingTrackOutput, Extractor, ExtractorOutput, TrackOutput},
    loadable::{ExtractingLoadable, ExtractorSession},
    seek::{SeekMap, SeekParameters},
    stream::SampleStream,
    track_output::SampleQueueOutput,
};

/// Duration credited to the last sample when the stream duration has to be
/// derived from the buffer.
const DEFAULT_LAST_SAMPLE_DURATION_US: i64 = 10_000;

/// Scratch buffers kept for staging sample bytes.
const SCRATCH_POOL_CAPACITY: usize = 4;

/// Work posted to the period's looper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeriodMsg {
    MaybeFinishPrepare,
    ContinueLoadingRequested,
}

impl Payload for PeriodMsg {
    type Tag = Self;

    fn tag(&self) -> Self {
        *self
    }
}

/// Upward notifications of a period, delivered on the period's looper
/// thread with no period lock held.
pub trait PeriodCallback: Send + Sync + 'static {
    /// Tracks and seek map are known; `track_groups` may be called.
    fn on_prepared(&self, period: &ProgressiveMediaPeriod);

    /// The period wants [`continue_loading`](ProgressiveMediaPeriod::continue_loading)
    /// to be called.
    fn on_continue_loading_requested(&self, period: &ProgressiveMediaPeriod);
}

/// One selectable track of a prepared period.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackGroup {
    /// Track id assigned by the extractor.
    pub id: u32,
    pub format: Format,
}

struct TrackSlot {
    id: u32,
    queue: Arc<Mutex<SampleQueue>>,
    is_audio_video: bool,
    enabled: bool,
    end_of_stream_notified: bool,
}

struct State {
    callback: Option<Arc<dyn PeriodCallback>>,
    tracks: Vec<TrackSlot>,
    sample_queues_built: bool,
    prepared: bool,
    have_audio_video_tracks: bool,
    track_groups: Vec<TrackGroup>,
    seek_map: Option<Arc<dyn SeekMap>>,
    duration_us: Option<i64>,
    data_type: DataType,
    seen_first_track_selection: bool,
    enabled_track_count: usize,
    extracted_samples_count_at_start_of_load: u64,
    last_seek_position_us: i64,
    pending_reset_position_us: Option<i64>,
    pending_deferred_retry: bool,
    notify_discontinuity: bool,
    loading_finished: bool,
    /// Load id between `start_loading` and its terminal callback.
    active_load: Option<u64>,
    fatal_load_error: bool,
    released: bool,
}

impl State {
    fn new() -> Self {
        Self {
            callback: None,
            tracks: Vec::new(),
            sample_queues_built: false,
            prepared: false,
            have_audio_video_tracks: false,
            track_groups: Vec::new(),
            seek_map: None,
            duration_us: None,
            data_type: DataType::Media,
            seen_first_track_selection: false,
            enabled_track_count: 0,
            extracted_samples_count_at_start_of_load: 0,
            last_seek_position_us: 0,
            pending_reset_position_us: None,
            pending_deferred_retry: false,
            notify_discontinuity: false,
            loading_finished: false,
            active_load: None,
            fatal_load_error: false,
            released: false,
        }
    }

    fn assert_prepared(&self) {
        assert!(self.prepared, "period is not prepared");
    }

    fn suppress_read(&self) -> bool {
        self.notify_discontinuity || self.pending_reset_position_us.is_some()
    }

    fn extracted_samples_count(&self) -> u64 {
        self.tracks
            .iter()
            .map(|slot| slot.queue.lock().write_index())
            .sum()
    }

    fn largest_queued_timestamp_us(&self, include_disabled: bool) -> i64 {
        self.tracks
            .iter()
            .filter(|slot| include_disabled || slot.enabled)
            .map(|slot| slot.queue.lock().largest_queued_timestamp_us())
            .fold(i64::MIN, i64::max)
    }

    fn reset_queues(&mut self) {
        for slot in &mut self.tracks {
            slot.queue.lock().reset(false);
            slot.end_of_stream_notified = false;
        }
    }

    fn discard_queues_to_end(&self) {
        for slot in &self.tracks {
            slot.queue.lock().discard_to_end();
        }
    }

    fn is_seekable(&self) -> bool {
        self.seek_map.as_ref().is_some_and(|map| map.is_seekable())
    }
}

struct Shared {
    name: String,
    state: Mutex<State>,
    loader: Loader<ExtractingLoadable>,
    load_condition: Arc<ConditionVariable>,
    session: Arc<Mutex<ExtractorSession>>,
    spec: DataSpec,
    policy: Arc<dyn LoadErrorHandlingPolicy>,
    allocator: Allocator,
    scratch: Pool<Vec<u8>>,
    bus: EventBus,
    check_interval_bytes: u64,
    length_known: Arc<AtomicBool>,
    looper: Looper<PeriodMsg>,
    handler: Handler<PeriodMsg>,
    output: Arc<dyn ExtractorOutput>,
    load_callback: Arc<dyn LoaderCallback<ExtractingLoadable>>,
}

/// A media period backed by one progressive stream.
///
/// A single [`ExtractingLoadable`] reads the stream through an extractor
/// into one [`SampleQueue`] per track. The load pauses every
/// `continue_loading_check_interval_bytes` until the owner calls
/// [`continue_loading`](Self::continue_loading) again.
///
/// Cloning is cheap; clones drive the same period. Call
/// [`release`](Self::release) when done.
#[derive(Clone)]
pub struct ProgressiveMediaPeriod {
    shared: Arc<Shared>,
}

impl ProgressiveMediaPeriod {
    /// # Errors
    ///
    /// Fails when the period's looper or loader cannot be started.
    pub fn new(
        uri: Option<Url>,
        data_source: Box<dyn DataSource>,
        extractor: Box<dyn Extractor>,
        mut config: ProgressiveConfig,
    ) -> ProgressiveResult<Self> {
        let allocator = config.take_allocator();
        let bus = config.take_bus();
        let loader = Loader::new(
            config
                .loader
                .clone()
                .with_name(format!("{}-loader", config.name)),
        )?;
        let looper = Looper::spawn(config.name.clone())?;

        let mut spec = DataSpec::new(uri);
        if let Some(key) = config.custom_cache_key.clone() {
            spec = spec.with_key(key);
        }

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let looper_weak = weak.clone();
            let handler = Handler::new(&looper, move |msg: PeriodMsg| {
                if let Some(period) = upgrade(&looper_weak) {
                    period.handle_message(msg);
                }
            });
            Shared {
                name: config.name,
                state: Mutex::new(State::new()),
                loader,
                load_condition: Arc::new(ConditionVariable::new()),
                session: Arc::new(Mutex::new(ExtractorSession::new(data_source, extractor))),
                spec,
                policy: config.load_error_handling_policy,
                allocator,
                scratch: Pool::new(SCRATCH_POOL_CAPACITY),
                bus,
                check_interval_bytes: config.continue_loading_check_interval_bytes,
                length_known: Arc::new(AtomicBool::new(false)),
                looper,
                handler,
                output: Arc::new(PeriodOutput {
                    shared: weak.clone(),
                }),
                load_callback: Arc::new(PeriodLoadCallback {
                    shared: weak.clone(),
                }),
            }
        });
        Ok(Self { shared })
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Starts loading. `callback` hears about preparation and load requests.
    ///
    /// Progressive streams always prepare from the start, whatever
    /// `position_us` is.
    pub fn prepare(&self, callback: Arc<dyn PeriodCallback>, position_us: i64) {
        let mut state = self.shared.state.lock();
        assert!(!state.released, "prepare on released period");
        debug!(period = %self.shared.name, position_us, "ProgressiveMediaPeriod: prepare");
        state.callback = Some(callback);
        self.shared.load_condition.open();
        self.start_loading(&mut state);
    }

    /// # Errors
    ///
    /// The load error once retries are exhausted, or
    /// [`ProgressiveError::LoadingFinishedBeforePrepared`].
    pub fn maybe_throw_prepare_error(&self) -> ProgressiveResult<()> {
        let state = self.shared.state.lock();
        self.maybe_throw_error(&state)?;
        if state.loading_finished && !state.prepared {
            return Err(ProgressiveError::LoadingFinishedBeforePrepared);
        }
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the period is not prepared.
    #[must_use]
    pub fn track_groups(&self) -> Vec<TrackGroup> {
        let state = self.shared.state.lock();
        state.assert_prepared();
        state.track_groups.clone()
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.shared.state.lock().prepared
    }

    #[must_use]
    pub fn duration_us(&self) -> Option<i64> {
        self.shared.state.lock().duration_us
    }

    #[must_use]
    pub fn is_seekable(&self) -> bool {
        self.shared.state.lock().is_seekable()
    }

    /// Samples written by the extractor across all tracks, since the last
    /// queue reset.
    #[must_use]
    pub fn extracted_samples_count(&self) -> u64 {
        self.shared.state.lock().extracted_samples_count()
    }

    /// [`extracted_samples_count`](Self::extracted_samples_count) as of the
    /// start of the current load, or the last retry that resumed it.
    #[must_use]
    pub fn extracted_samples_count_at_start_of_load(&self) -> u64 {
        self.shared
            .state
            .lock()
            .extracted_samples_count_at_start_of_load
    }

    /// Enables and disables tracks.
    ///
    /// For each renderer slot `i`, `selections[i]` is the track group to
    /// play, if any. A stream in `streams[i]` is kept when it still matches
    /// and `may_retain_streams[i]` is set; new streams get their reset flag
    /// set. Returns the position playback must start from.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length, the period is not prepared, or
    /// a track is enabled twice.
    pub fn select_tracks(
        &self,
        selections: &[Option<usize>],
        may_retain_streams: &[bool],
        streams: &mut [Option<SampleStream>],
        stream_reset_flags: &mut [bool],
        position_us: i64,
    ) -> i64 {
        assert!(
            selections.len() == streams.len()
                && may_retain_streams.len() == streams.len()
                && stream_reset_flags.len() == streams.len(),
            "selection slices differ in length"
        );
        let mut state = self.shared.state.lock();
        state.assert_prepared();
        let old_enabled_track_count = state.enabled_track_count;

        for ((slot, selection), may_retain) in streams.iter_mut().zip(selections).zip(may_retain_streams) {
            if selection.is_some() && *may_retain {
                continue;
            }
            if let Some(stream) = slot.take() {
                let track = &mut state.tracks[stream.track()];
                assert!(track.enabled, "deselecting a disabled track");
                track.enabled = false;
                state.enabled_track_count -= 1;
            }
        }

        // A first selection away from zero, or re-enabling after all tracks
        // were disabled, always seeks.
        let mut seek_required = if state.seen_first_track_selection {
            old_enabled_track_count == 0
        } else {
            position_us != 0
        };

        for (index, selection) in selections.iter().enumerate() {
            let Some(track) = *selection else {
                continue;
            };
            if streams[index].is_some() {
                continue;
            }
            let slot = &mut state.tracks[track];
            assert!(!slot.enabled, "track {track} selected twice");
            slot.enabled = true;
            if !seek_required {
                let mut queue = slot.queue.lock();
                seek_required = queue.read_index() != 0 && !queue.seek_to(position_us, true);
            }
            state.enabled_track_count += 1;
            streams[index] = Some(SampleStream::new(self.clone(), track));
            stream_reset_flags[index] = true;
        }

        let mut position_us = position_us;
        if state.enabled_track_count == 0 {
            state.pending_deferred_retry = false;
            state.notify_discontinuity = false;
            if state.active_load.is_some() {
                state.discard_queues_to_end();
                self.shared.loader.cancel_loading();
            } else {
                state.reset_queues();
            }
        } else if seek_required {
            position_us = self.seek_locked(&mut state, position_us);
            for (flag, stream) in stream_reset_flags.iter_mut().zip(streams.iter()) {
                if stream.is_some() {
                    *flag = true;
                }
            }
        }
        state.seen_first_track_selection = true;
        debug!(
            period = %self.shared.name,
            enabled = state.enabled_track_count,
            position_us,
            "ProgressiveMediaPeriod: tracks selected"
        );
        position_us
    }

    /// Drops samples before `position_us` that are no longer needed.
    pub fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        let state = self.shared.state.lock();
        state.assert_prepared();
        if state.pending_reset_position_us.is_some() {
            return;
        }
        for slot in &state.tracks {
            slot.queue
                .lock()
                .discard_to(position_us, to_keyframe, slot.enabled);
        }
    }

    /// Progressive periods never discard upstream.
    pub fn reevaluate_buffer(&self, _position_us: i64) {}

    /// Lets a paused load continue, starting one if none runs.
    ///
    /// Returns whether loading resumed or started.
    pub fn continue_loading(&self, position_us: i64) -> bool {
        let mut state = self.shared.state.lock();
        if state.released
            || state.loading_finished
            || state.fatal_load_error
            || self.shared.loader.has_fatal_error()
            || state.pending_deferred_retry
            || (state.prepared && state.enabled_track_count == 0)
        {
            return false;
        }
        trace!(period = %self.shared.name, position_us, "ProgressiveMediaPeriod: continue loading");
        let mut continued = self.shared.load_condition.open();
        if state.active_load.is_none() {
            self.start_loading(&mut state);
            continued = true;
        }
        continued
    }

    /// A load runs and is not paused at a watermark.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.shared.state.lock().active_load.is_some() && self.shared.load_condition.is_open()
    }

    #[must_use]
    pub fn next_load_position_us(&self) -> i64 {
        self.buffered_position_us()
    }

    /// The position of the last seek, once after the seek, when it has to
    /// be reported as a discontinuity.
    pub fn read_discontinuity(&self) -> Option<i64> {
        let mut state = self.shared.state.lock();
        if state.notify_discontinuity
            && (state.loading_finished
                || state.extracted_samples_count() > state.extracted_samples_count_at_start_of_load)
        {
            state.notify_discontinuity = false;
            return Some(state.last_seek_position_us);
        }
        None
    }

    /// How far the enabled tracks are buffered, or
    /// [`TIME_END_OF_SOURCE`] once everything is loaded.
    ///
    /// # Panics
    ///
    /// Panics if the period is not prepared.
    #[must_use]
    pub fn buffered_position_us(&self) -> i64 {
        let state = self.shared.state.lock();
        state.assert_prepared();
        if state.loading_finished || state.enabled_track_count == 0 {
            return TIME_END_OF_SOURCE;
        }
        if let Some(pending) = state.pending_reset_position_us {
            return pending;
        }
        let mut largest = i64::MAX;
        if state.have_audio_video_tracks {
            // Sparse tracks would hold the buffered position back.
            for slot in &state.tracks {
                let queue = slot.queue.lock();
                if slot.is_audio_video && slot.enabled && !queue.is_last_sample_queued() {
                    largest = largest.min(queue.largest_queued_timestamp_us());
                }
            }
        }
        if largest == i64::MAX {
            largest = state.largest_queued_timestamp_us(false);
        }
        if largest == i64::MIN {
            state.last_seek_position_us
        } else {
            largest
        }
    }

    /// Seeks to `position_us`, inside the buffer when every track allows it,
    /// otherwise by restarting the load at the nearest preceding sync point.
    ///
    /// Returns the position actually seeked to; unseekable media always
    /// seeks to zero.
    pub fn seek_to_us(&self, position_us: i64) -> i64 {
        let mut state = self.shared.state.lock();
        self.seek_locked(&mut state, position_us)
    }

    /// The position a seek to `position_us` would resolve to under
    /// `parameters`.
    #[must_use]
    pub fn adjusted_seek_position_us(&self, position_us: i64, parameters: SeekParameters) -> i64 {
        let state = self.shared.state.lock();
        state.assert_prepared();
        let Some(seek_map) = state.seek_map.as_ref().filter(|map| map.is_seekable()) else {
            return 0;
        };
        let points = seek_map.seek_points(position_us);
        parameters.resolve_seek_position_us(position_us, points.first.time_us, points.second.time_us)
    }

    /// Stops loading and frees the sample queues once the running load has
    /// returned. No callback is delivered afterwards.
    pub fn release(&self) {
        let shared = &self.shared;
        let (queues, prepared) = {
            let mut state = shared.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.callback = None;
            state.active_load = None;
            let queues: Vec<_> = state.tracks.iter().map(|slot| Arc::clone(&slot.queue)).collect();
            (queues, state.prepared)
        };
        debug!(period = %shared.name, "ProgressiveMediaPeriod: release");
        if prepared {
            for queue in &queues {
                queue.lock().discard_to_end();
            }
        }
        shared.handler.remove_all_messages();

        let session = Arc::clone(&shared.session);
        let bus = shared.bus.clone();
        let name = shared.name.clone();
        // Must not hold the state lock: the loader reports the release
        // cancellation synchronously.
        shared.loader.release_with(move || {
            for queue in &queues {
                queue.lock().release();
            }
            session.lock().extractor.release();
            debug!(period = %name, "ProgressiveMediaPeriod: loader released");
            bus.publish(PeriodEvent::Released);
        });
        shared.looper.quit();
    }

    // ---- sample stream glue ----

    pub(crate) fn is_track_ready(&self, track: usize) -> bool {
        let state = self.shared.state.lock();
        !state.suppress_read() && state.tracks[track].queue.lock().is_ready(state.loading_finished)
    }

    pub(crate) fn maybe_throw_track_error(&self) -> ProgressiveResult<()> {
        let state = self.shared.state.lock();
        self.maybe_throw_error(&state)
    }

    pub(crate) fn read_track(
        &self,
        track: usize,
        format_holder: &mut FormatHolder,
        buffer: &mut DecoderInputBuffer,
        flags: ReadFlags,
    ) -> ReadResult {
        let mut state = self.shared.state.lock();
        if state.suppress_read() {
            return ReadResult::NothingRead;
        }
        let loading_finished = state.loading_finished;
        let result = state.tracks[track]
            .queue
            .lock()
            .read(format_holder, buffer, flags, loading_finished);

        match result {
            ReadResult::NothingRead => self.maybe_start_deferred_retry(&mut state, track),
            ReadResult::BufferRead if buffer.is_end_of_stream() && !flags.contains(ReadFlags::PEEK) => {
                let slot = &mut state.tracks[track];
                if !slot.end_of_stream_notified {
                    slot.end_of_stream_notified = true;
                    let track_id = slot.id;
                    self.shared.bus.publish(TrackEvent::EndOfStream { track_id });
                }
            }
            _ => {}
        }
        result
    }

    pub(crate) fn skip_track(&self, track: usize, position_us: i64) -> usize {
        let mut state = self.shared.state.lock();
        if state.suppress_read() {
            return 0;
        }
        let loading_finished = state.loading_finished;
        let skipped = {
            let mut queue = state.tracks[track].queue.lock();
            let count = queue.get_skip_count(position_us, loading_finished);
            queue.skip(count);
            count
        };
        if skipped == 0 {
            self.maybe_start_deferred_retry(&mut state, track);
        }
        skipped
    }

    // ---- internals ----

    fn maybe_throw_error(&self, state: &State) -> ProgressiveResult<()> {
        let min_retry_count = self.shared.policy.min_loadable_retry_count(state.data_type);
        self.shared.loader.maybe_throw_error_with(min_retry_count)?;
        Ok(())
    }

    fn start_loading(&self, state: &mut State) {
        let shared = &self.shared;
        let loadable = Arc::new(ExtractingLoadable::new(
            shared.spec.clone(),
            Arc::clone(&shared.session),
            Arc::clone(&shared.output),
            Arc::clone(&shared.load_condition),
            shared.handler.clone(),
            Arc::clone(&shared.length_known),
            shared.check_interval_bytes,
        ));

        if state.prepared {
            let pending = state
                .pending_reset_position_us
                .expect("a prepared period only restarts loading after a reset");
            if state.duration_us.is_some_and(|duration_us| pending > duration_us) {
                state.loading_finished = true;
                state.pending_reset_position_us = None;
                return;
            }
            let position = state
                .seek_map
                .as_ref()
                .map_or(0, |map| map.seek_points(pending).first.position);
            loadable.set_load_position(position, pending);
            for slot in &state.tracks {
                slot.queue.lock().set_start_time_us(pending);
            }
            state.pending_reset_position_us = None;
        }

        state.extracted_samples_count_at_start_of_load = state.extracted_samples_count();
        let min_retry_count = shared.policy.min_loadable_retry_count(state.data_type);
        let position = loadable.load_position();
        let load_id = shared
            .loader
            .start_loading(loadable, Arc::clone(&shared.load_callback), min_retry_count);
        state.active_load = Some(load_id);
        debug!(period = %shared.name, load_id, position, "ProgressiveMediaPeriod: load started");
        shared.bus.publish(LoadEvent::Started { load_id, position });
    }

    fn seek_locked(&self, state: &mut State, position_us: i64) -> i64 {
        state.assert_prepared();
        let position_us = if state.is_seekable() { position_us } else { 0 };
        state.notify_discontinuity = false;
        state.last_seek_position_us = position_us;

        if state.pending_reset_position_us.is_some() {
            state.pending_reset_position_us = Some(position_us);
            self.publish_seek(position_us, false);
            return position_us;
        }

        // An idle period that has not finished loading must reset so the
        // next load starts at the new position.
        let buffer_usable = state.loading_finished || state.active_load.is_some();
        if state.data_type != DataType::MediaProgressiveLive
            && buffer_usable
            && seek_inside_buffer(state, position_us)
        {
            self.publish_seek(position_us, true);
            return position_us;
        }

        state.pending_deferred_retry = false;
        state.pending_reset_position_us = Some(position_us);
        state.loading_finished = false;
        if state.active_load.is_some() {
            state.discard_queues_to_end();
            self.shared.loader.cancel_loading();
        } else {
            self.shared.loader.clear_fatal_error();
            state.fatal_load_error = false;
            state.reset_queues();
        }
        self.publish_seek(position_us, false);
        position_us
    }

    fn publish_seek(&self, position_us: i64, in_buffer: bool) {
        debug!(period = %self.shared.name, position_us, in_buffer, "ProgressiveMediaPeriod: seek");
        self.shared
            .bus
            .publish(PeriodEvent::Seeked { position_us, in_buffer });
    }

    fn maybe_start_deferred_retry(&self, state: &mut State, track: usize) {
        let slot = &state.tracks[track];
        if !state.pending_deferred_retry || !slot.is_audio_video || slot.queue.lock().is_ready(false) {
            return;
        }
        debug!(period = %self.shared.name, "ProgressiveMediaPeriod: starting deferred retry");
        state.pending_reset_position_us = Some(0);
        state.pending_deferred_retry = false;
        state.notify_discontinuity = true;
        state.last_seek_position_us = 0;
        state.extracted_samples_count_at_start_of_load = 0;
        state.reset_queues();
        self.request_continue_loading();
    }

    fn request_continue_loading(&self) {
        self.post(PeriodMsg::ContinueLoadingRequested);
    }

    /// Posts `msg` to the period looper. After release the looper has quit
    /// and nobody is left to act on it.
    fn post(&self, msg: PeriodMsg) {
        post(&self.shared.handler, &self.shared.name, msg);
    }

    fn handle_message(&self, msg: PeriodMsg) {
        match msg {
            PeriodMsg::MaybeFinishPrepare => self.maybe_finish_prepare(),
            PeriodMsg::ContinueLoadingRequested => {
                let callback = {
                    let state = self.shared.state.lock();
                    if state.released {
                        None
                    } else {
                        state.callback.clone()
                    }
                };
                if let Some(callback) = callback {
                    callback.on_continue_loading_requested(self);
                }
            }
        }
    }

    fn maybe_finish_prepare(&self) {
        let callback = {
            let mut state = self.shared.state.lock();
            if state.released || state.prepared || !state.sample_queues_built {
                return;
            }
            let Some(seek_map) = state.seek_map.clone() else {
                return;
            };
            let mut formats = Vec::with_capacity(state.tracks.len());
            for slot in &state.tracks {
                match slot.queue.lock().upstream_format() {
                    Some(format) => formats.push(format.clone()),
                    None => return,
                }
            }

            // Hold loading until tracks are selected.
            self.shared.load_condition.close();
            let mut groups = Vec::with_capacity(formats.len());
            let mut have_audio_video = false;
            for (slot, format) in state.tracks.iter_mut().zip(formats) {
                let is_audio_video = matches!(format.track_type(), TrackType::Audio | TrackType::Video);
                slot.is_audio_video = is_audio_video;
                have_audio_video |= is_audio_video;
                groups.push(TrackGroup { id: slot.id, format });
            }
            state.have_audio_video_tracks = have_audio_video;
            state.track_groups = groups;
            state.prepared = true;

            let track_count = state.tracks.len();
            debug!(
                period = %self.shared.name,
                track_count,
                duration_us = ?state.duration_us,
                "ProgressiveMediaPeriod: prepared"
            );
            self.shared.bus.publish(PeriodEvent::Prepared {
                duration_us: state.duration_us,
                seekable: seek_map.is_seekable(),
                track_count,
            });
            state.callback.clone()
        };
        if let Some(callback) = callback {
            callback.on_prepared(self);
        }
    }

    // ---- extractor output ----

    fn prepare_track_output(&self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if let Some(slot) = state.tracks.iter().find(|slot| slot.id == id) {
            return Arc::new(SampleQueueOutput::new(Arc::clone(&slot.queue), shared.scratch.clone()));
        }
        if state.sample_queues_built || state.released {
            warn!(
                period = %shared.name,
                track_id = id,
                "ProgressiveMediaPeriod: track added after tracks ended, discarding"
            );
            return Arc::new(DiscardingTrackOutput);
        }

        let mut queue = SampleQueue::new(shared.allocator.clone());
        let handler = shared.handler.clone();
        let name = shared.name.clone();
        let bus = shared.bus.clone();
        let listener: Arc<dyn UpstreamFormatChangedListener> = Arc::new(move |format: &Format| {
            bus.publish(TrackEvent::FormatChanged {
                track_id: id,
                sample_mime_type: format.sample_mime_type.clone(),
            });
            post(&handler, &name, PeriodMsg::MaybeFinishPrepare);
        });
        queue.set_upstream_format_change_listener(Some(listener));
        let queue = Arc::new(Mutex::new(queue));

        state.tracks.push(TrackSlot {
            id,
            queue: Arc::clone(&queue),
            is_audio_video: false,
            enabled: false,
            end_of_stream_notified: false,
        });
        trace!(period = %shared.name, track_id = id, ?track_type, "ProgressiveMediaPeriod: track created");
        shared.bus.publish(TrackEvent::Created { track_id: id });
        Arc::new(SampleQueueOutput::new(queue, shared.scratch.clone()))
    }

    fn end_tracks(&self) {
        self.shared.state.lock().sample_queues_built = true;
        self.post(PeriodMsg::MaybeFinishPrepare);
    }

    fn set_seek_map(&self, seek_map: Arc<dyn SeekMap>) {
        let prepared = {
            let mut state = self.shared.state.lock();
            if state.released {
                return;
            }
            let duration_us = seek_map.duration_us();
            let is_live = !self.shared.length_known.load(Ordering::Acquire) && duration_us.is_none();
            state.data_type = if is_live {
                DataType::MediaProgressiveLive
            } else {
                DataType::Media
            };
            state.duration_us = duration_us;
            let seekable = seek_map.is_seekable();
            state.seek_map = Some(seek_map);
            debug!(
                period = %self.shared.name,
                ?duration_us,
                seekable,
                is_live,
                "ProgressiveMediaPeriod: seek map"
            );
            self.shared
                .bus
                .publish(PeriodEvent::SourceInfoRefreshed { duration_us, seekable });
            state.prepared
        };
        if !prepared {
            self.post(PeriodMsg::MaybeFinishPrepare);
        }
    }

    // ---- loader callbacks ----

    fn on_load_completed(&self, info: &LoadInfo) {
        {
            let mut state = self.shared.state.lock();
            if state.released {
                return;
            }
            state.active_load = None;
            if state.duration_us.is_none() {
                if let Some(seek_map) = state.seek_map.clone() {
                    let largest = state.largest_queued_timestamp_us(true);
                    let duration_us = if largest == i64::MIN {
                        0
                    } else {
                        largest + DEFAULT_LAST_SAMPLE_DURATION_US
                    };
                    state.duration_us = Some(duration_us);
                    self.shared.bus.publish(PeriodEvent::SourceInfoRefreshed {
                        duration_us: Some(duration_us),
                        seekable: seek_map.is_seekable(),
                    });
                }
            }
            state.loading_finished = true;
        }
        debug!(
            period = %self.shared.name,
            load_id = info.load_id,
            bytes = info.bytes_loaded,
            "ProgressiveMediaPeriod: load completed"
        );
        self.shared.bus.publish(LoadEvent::Completed {
            load_id: info.load_id,
            bytes_loaded: info.bytes_loaded,
        });
        self.request_continue_loading();
    }

    fn on_load_canceled(&self, info: &LoadInfo, released: bool) {
        self.shared.bus.publish(LoadEvent::Canceled {
            load_id: info.load_id,
            released,
        });
        if released {
            return;
        }
        let request = {
            let mut state = self.shared.state.lock();
            if state.released {
                return;
            }
            state.active_load = None;
            state.reset_queues();
            state.enabled_track_count > 0
        };
        if request {
            self.request_continue_loading();
        }
    }

    fn on_load_error(
        &self,
        loadable: &ExtractingLoadable,
        info: &LoadInfo,
        error: &Arc<LoadError>,
        error_count: u32,
    ) -> LoadErrorAction {
        let mut state = self.shared.state.lock();
        if state.released {
            return LoadErrorAction::DontRetry;
        }
        let error_info = LoadErrorInfo {
            data_type: state.data_type,
            error: Arc::clone(error),
            error_count,
            info: *info,
        };
        let action = match self.shared.policy.retry_delay_for(&error_info) {
            None => LoadErrorAction::DontRetryFatal,
            Some(delay) => {
                let extracted = state.extracted_samples_count();
                let made_progress = extracted > state.extracted_samples_count_at_start_of_load;
                if self.configure_retry(&mut state, loadable, extracted) {
                    LoadErrorAction::retry_after(made_progress, Some(delay))
                } else {
                    LoadErrorAction::DontRetry
                }
            }
        };

        let will_retry = action.is_retry();
        debug!(
            period = %self.shared.name,
            load_id = info.load_id,
            error_count,
            %error,
            ?action,
            "ProgressiveMediaPeriod: load error"
        );
        self.shared.bus.publish(LoadEvent::Error {
            load_id: info.load_id,
            error: error.to_string(),
            will_retry,
        });
        if !will_retry {
            state.active_load = None;
        }
        if action == LoadErrorAction::DontRetryFatal {
            state.fatal_load_error = true;
            warn!(period = %self.shared.name, %error, "ProgressiveMediaPeriod: fatal load error");
            self.shared.bus.publish(PeriodEvent::FatalError {
                error: error.to_string(),
            });
        }
        action
    }

    /// Prepares `loadable` for a retry. Returns `false` when the retry is
    /// deferred until the buffered samples are consumed.
    fn configure_retry(&self, state: &mut State, loadable: &ExtractingLoadable, extracted: u64) -> bool {
        let length_known = self.shared.length_known.load(Ordering::Acquire);
        let duration_known = state.seek_map.as_ref().is_some_and(|map| map.duration_us().is_some());
        if length_known || duration_known {
            // Resume from where the failed attempt stopped.
            state.extracted_samples_count_at_start_of_load = extracted;
            true
        } else if state.prepared && !state.suppress_read() {
            // Unknown length and duration: treat as live. Restarting now
            // would replay old samples, so wait for the buffer to drain.
            state.pending_deferred_retry = true;
            false
        } else {
            // Nothing played yet: restart from the beginning right away.
            state.notify_discontinuity = state.prepared;
            state.last_seek_position_us = 0;
            state.extracted_samples_count_at_start_of_load = 0;
            state.reset_queues();
            loadable.set_load_position(0, 0);
            true
        }
    }
}

impl fmt::Debug for ProgressiveMediaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressiveMediaPeriod")
            .field("name", &self.shared.name)
            .field("prepared", &self.is_prepared())
            .finish_non_exhaustive()
    }
}

fn post(handler: &Handler<PeriodMsg>, name: &str, msg: PeriodMsg) {
    if handler.send(msg).is_err() {
        debug!(period = %name, ?msg, "ProgressiveMediaPeriod: message dropped, looper quit");
    }
}

fn upgrade(shared: &Weak<Shared>) -> Option<ProgressiveMediaPeriod> {
    shared.upgrade().map(|shared| ProgressiveMediaPeriod { shared })
}

/// Seeks every queue; succeeds when all audio/video queues (or all queues,
/// without audio/video) could seek inside their buffer.
fn seek_inside_buffer(state: &State, position_us: i64) -> bool {
    state.tracks.iter().all(|slot| {
        let seeked = slot.queue.lock().seek_to(position_us, false);
        seeked || !(slot.is_audio_video || !state.have_audio_video_tracks)
    })
}

struct PeriodOutput {
    shared: Weak<Shared>,
}

impl ExtractorOutput for PeriodOutput {
    fn track(&self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput> {
        match upgrade(&self.shared) {
            Some(period) => period.prepare_track_output(id, track_type),
            None => Arc::new(DiscardingTrackOutput),
        }
    }

    fn end_tracks(&self) {
        if let Some(period) = upgrade(&self.shared) {
            period.end_tracks();
        }
    }

    fn seek_map(&self, seek_map: Arc<dyn SeekMap>) {
        if let Some(period) = upgrade(&self.shared) {
            period.set_seek_map(seek_map);
        }
    }
}

struct PeriodLoadCallback {
    shared: Weak<Shared>,
}

impl LoaderCallback<ExtractingLoadable> for PeriodLoadCallback {
    fn on_load_completed(&self, _loadable: &ExtractingLoadable, info: &LoadInfo) {
        if let Some(period) = upgrade(&self.shared) {
            period.on_load_completed(info);
        }
    }

    fn on_load_canceled(&self, _loadable: &ExtractingLoadable, info: &LoadInfo, released: bool) {
        if let Some(period) = upgrade(&self.shared) {
            period.on_load_canceled(info, released);
        }
    }

    fn on_load_error(
        &self,
        loadable: &ExtractingLoadable,
        info: &LoadInfo,
        error: &Arc<LoadError>,
        error_count: u32,
    ) -> LoadErrorAction {
        match upgrade(&self.shared) {
            Some(period) => period.on_load_error(loadable, info, error, error_count),
            None => LoadErrorAction::DontRetry,
        }
    }
}
