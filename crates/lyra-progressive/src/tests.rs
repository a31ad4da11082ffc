use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use lyra_events::{Event, LoadEvent, PeriodEvent, TrackEvent};
use lyra_loader::{
    DefaultLoadErrorHandlingPolicy, LoadError, LoadErrorHandlingPolicy, LoadErrorHandlingPolicyMock,
};
use lyra_sample::{DecoderInputBuffer, FormatHolder, ReadFlags, ReadResult};
use rstest::rstest;
use tokio::sync::broadcast;
use unimock::{MockFn, Unimock, matching};

use crate::{
    ByteArrayDataSource, DataSource, Extractor, PeriodCallback, ProgressiveConfig,
    ProgressiveError, ProgressiveMediaPeriod, SampleStream, SeekParameters,
    testing::{ChunkExtractor, FakeContainer, FakeExtractor, FakeTrackKind, FlakyDataSource},
};

const WAIT: Duration = Duration::from_secs(5);
const SAMPLE_STEP_US: i64 = 20_000;

#[derive(Default)]
struct TestCallback {
    prepared: AtomicUsize,
    continue_requests: AtomicUsize,
    auto_continue: bool,
}

impl TestCallback {
    fn auto_continue() -> Arc<Self> {
        Arc::new(Self {
            auto_continue: true,
            ..Self::default()
        })
    }

    fn manual() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PeriodCallback for TestCallback {
    fn on_prepared(&self, _period: &ProgressiveMediaPeriod) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_continue_loading_requested(&self, period: &ProgressiveMediaPeriod) {
        self.continue_requests.fetch_add(1, Ordering::SeqCst);
        if self.auto_continue {
            period.continue_loading(0);
        }
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn period(
    source: impl DataSource + 'static,
    extractor: impl Extractor + 'static,
    config: ProgressiveConfig,
) -> ProgressiveMediaPeriod {
    ProgressiveMediaPeriod::new(None, Box::new(source), Box::new(extractor), config).unwrap()
}

fn prepare(period: &ProgressiveMediaPeriod, callback: &Arc<TestCallback>) {
    period.prepare(Arc::clone(callback) as Arc<dyn PeriodCallback>, 0);
    wait_until("prepared", || callback.prepared.load(Ordering::SeqCst) > 0);
}

fn select_all(period: &ProgressiveMediaPeriod) -> Vec<SampleStream> {
    let count = period.track_groups().len();
    let selections: Vec<Option<usize>> = (0..count).map(Some).collect();
    let mut streams: Vec<Option<SampleStream>> = (0..count).map(|_| None).collect();
    let mut reset_flags = vec![false; count];
    let position = period.select_tracks(
        &selections,
        &vec![false; count],
        &mut streams,
        &mut reset_flags,
        0,
    );
    assert_eq!(position, 0);
    assert!(reset_flags.iter().all(|flag| *flag));
    streams.into_iter().map(Option::unwrap).collect()
}

/// Reads `stream` to its end-of-stream marker.
fn drain(stream: &SampleStream) -> Vec<(i64, Vec<u8>)> {
    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    let mut samples = Vec::new();
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < deadline, "timed out reading track {}", stream.track());
        match stream.read_data(&mut holder, &mut buffer, ReadFlags::NONE) {
            ReadResult::NothingRead => thread::sleep(Duration::from_millis(1)),
            ReadResult::FormatRead => {}
            ReadResult::BufferRead if buffer.is_end_of_stream() => return samples,
            ReadResult::BufferRead => samples.push((buffer.time_us, buffer.data.clone())),
        }
    }
}

/// Like [`drain`], but keeps a manually driven period loading.
fn drain_loading(period: &ProgressiveMediaPeriod, stream: &SampleStream) -> Vec<(i64, Vec<u8>)> {
    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    let mut samples = Vec::new();
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < deadline, "timed out reading track {}", stream.track());
        match stream.read_data(&mut holder, &mut buffer, ReadFlags::NONE) {
            ReadResult::NothingRead => {
                period.continue_loading(0);
                thread::sleep(Duration::from_millis(1));
            }
            ReadResult::FormatRead => {}
            ReadResult::BufferRead if buffer.is_end_of_stream() => return samples,
            ReadResult::BufferRead => samples.push((buffer.time_us, buffer.data.clone())),
        }
    }
}

/// Reads what is buffered, up to the first empty read.
fn read_buffered(stream: &SampleStream) -> Vec<(i64, Vec<u8>)> {
    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    let mut samples = Vec::new();
    loop {
        match stream.read_data(&mut holder, &mut buffer, ReadFlags::NONE) {
            ReadResult::NothingRead => return samples,
            ReadResult::FormatRead => {}
            ReadResult::BufferRead => {
                assert!(!buffer.is_end_of_stream(), "stream ended early");
                samples.push((buffer.time_us, buffer.data.clone()));
            }
        }
    }
}

fn load_errors(events: &[Event], retried: bool) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(event, Event::Load(LoadEvent::Error { will_retry, .. }) if *will_retry == retried)
        })
        .count()
}

fn quick_retries() -> Arc<dyn LoadErrorHandlingPolicy> {
    Arc::new(
        DefaultLoadErrorHandlingPolicy::default()
            .with_first_retry_delay(Duration::from_millis(5))
            .with_retry_delay_step(Duration::from_millis(5)),
    )
}

fn collect_events(rx: &mut broadcast::Receiver<Event>, into: &mut Vec<Event>) {
    while let Ok(event) = rx.try_recv() {
        into.push(event);
    }
}

fn wait_for_event(rx: &mut broadcast::Receiver<Event>, seen: &mut Vec<Event>, wanted: &Event) {
    wait_until("event", || {
        collect_events(rx, seen);
        seen.contains(wanted)
    });
}

/// Audio sample every step, video sample every step with a keyframe every
/// fifth.
fn audio_video(count: i64) -> (FakeContainer, Vec<(i64, Vec<u8>)>, Vec<(i64, Vec<u8>)>) {
    let mut container = FakeContainer::new()
        .with_track(1, FakeTrackKind::Audio)
        .with_track(2, FakeTrackKind::Video);
    let mut audio = Vec::new();
    let mut video = Vec::new();
    for i in 0..count {
        let time_us = i * SAMPLE_STEP_US;
        let audio_payload = FakeContainer::payload(1, time_us, 300);
        let video_payload = FakeContainer::payload(2, time_us, 700);
        container = container
            .with_sample(1, time_us, true, audio_payload.clone())
            .with_sample(2, time_us, i % 5 == 0, video_payload.clone());
        audio.push((time_us, audio_payload));
        video.push((time_us, video_payload));
    }
    (container, audio, video)
}

fn audio_only(count: i64, size: usize) -> (FakeContainer, Vec<(i64, Vec<u8>)>) {
    let mut container = FakeContainer::new().with_track(1, FakeTrackKind::Audio);
    let mut samples = Vec::new();
    for i in 0..count {
        let time_us = i * SAMPLE_STEP_US;
        let payload = FakeContainer::payload(1, time_us, size);
        container = container.with_sample(1, time_us, true, payload.clone());
        samples.push((time_us, payload));
    }
    (container, samples)
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_prepare_select_and_read_every_sample() {
    let (container, audio, video) = audio_video(25);
    let period = period(
        ByteArrayDataSource::new(container.build()),
        FakeExtractor::new(),
        ProgressiveConfig::default().with_name("test-av"),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::auto_continue();

    prepare(&period, &callback);
    let groups = period.track_groups();
    assert_eq!(groups.iter().map(|group| group.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(groups[0].format.sample_mime_type.as_deref(), Some("audio/mpeg"));
    assert_eq!(groups[1].format.sample_mime_type.as_deref(), Some("video/avc"));
    assert_eq!(period.duration_us(), Some(container.duration_us()));
    assert!(period.is_seekable());
    period.maybe_throw_prepare_error().unwrap();

    let streams = select_all(&period);
    period.continue_loading(0);
    assert_eq!(drain(&streams[0]), audio);
    assert_eq!(drain(&streams[1]), video);
    assert_eq!(period.buffered_position_us(), lyra_sample::TIME_END_OF_SOURCE);
    assert_eq!(period.read_discontinuity(), None);

    wait_for_event(&mut rx, &mut events, &TrackEvent::EndOfStream { track_id: 2 }.into());
    assert!(events.contains(&TrackEvent::Created { track_id: 1 }.into()));
    assert!(events.contains(
        &PeriodEvent::Prepared {
            duration_us: Some(container.duration_us()),
            seekable: true,
            track_count: 2,
        }
        .into()
    ));
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Load(LoadEvent::Completed { .. })))
    );

    period.release();
    period.release();
    assert!(!period.continue_loading(0));
    wait_for_event(&mut rx, &mut events, &PeriodEvent::Released.into());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_connection_dropped_early_is_reopened_without_loss() {
    let (container, samples) = audio_only(20, 240);
    let data = container.build();
    let len = data.len() as u64;
    let source = ByteArrayDataSource::new(data).with_max_bytes_per_open(1000);
    let probe = source.probe();
    let period = period(source, FakeExtractor::new(), ProgressiveConfig::default());
    let callback = TestCallback::auto_continue();

    prepare(&period, &callback);
    let streams = select_all(&period);
    period.continue_loading(0);
    assert_eq!(drain(&streams[0]), samples);

    assert_eq!(probe.opens(), (0..len).step_by(1000).collect::<Vec<_>>());
    assert_eq!(probe.bytes_read(), len);
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_loading_pauses_at_each_check_interval() {
    const INTERVAL: u64 = 64 * 1024;
    const CHUNK: usize = 4096;

    let source = ByteArrayDataSource::new(vec![0x5a_u8; 1024 * 1024]);
    let probe = source.probe();
    let period = period(
        source,
        ChunkExtractor::new(CHUNK, 10_000),
        ProgressiveConfig::default().with_continue_loading_check_interval_bytes(INTERVAL),
    );
    let callback = TestCallback::manual();

    prepare(&period, &callback);
    let _streams = select_all(&period);

    // Preparing closes the load condition at an arbitrary byte; the next
    // pause is a watermark.
    assert!(period.continue_loading(0));
    wait_until("first watermark", || !period.is_loading());
    let paused_at = probe.bytes_read();
    assert!(paused_at >= INTERVAL);
    assert_eq!(paused_at % INTERVAL, 0);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.bytes_read(), paused_at);
    assert!(!period.is_loading());

    assert!(period.continue_loading(0));
    wait_until("second watermark", || !period.is_loading());
    assert_eq!(probe.bytes_read(), paused_at + INTERVAL);
    assert_eq!(
        period.extracted_samples_count(),
        (paused_at + INTERVAL) / CHUNK as u64
    );
    wait_until("continue requests", || {
        callback.continue_requests.load(Ordering::SeqCst) >= 2
    });
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_failure_before_prepare_restarts_from_zero() {
    let (container, samples) = audio_only(10, 100);
    let inner = ByteArrayDataSource::new(container.build()).with_unknown_length();
    let probe = inner.probe();
    let period = period(
        FlakyDataSource::new(inner).with_read_failure_at(6),
        FakeExtractor::new(),
        ProgressiveConfig::default().with_load_error_handling_policy(Arc::new(
            DefaultLoadErrorHandlingPolicy::default().with_first_retry_delay(Duration::from_millis(5)),
        )),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::auto_continue();

    prepare(&period, &callback);
    assert_eq!(period.extracted_samples_count_at_start_of_load(), 0);
    let streams = select_all(&period);
    period.continue_loading(0);
    assert_eq!(drain(&streams[0]), samples);

    assert_eq!(probe.opens(), vec![0, 0]);
    collect_events(&mut rx, &mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Load(LoadEvent::Error {
            will_retry: true,
            ..
        })
    )));
    period.maybe_throw_prepare_error().unwrap();
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_fatal_policy_surfaces_error() {
    let policy = Unimock::new((
        LoadErrorHandlingPolicyMock::retry_delay_for
            .each_call(matching!(_))
            .returns(None),
        LoadErrorHandlingPolicyMock::min_loadable_retry_count
            .each_call(matching!(_))
            .returns(3_u32),
    ));
    let (container, _) = audio_only(4, 50);
    let period = period(
        FlakyDataSource::new(ByteArrayDataSource::new(container.build())).with_failing_opens(1),
        FakeExtractor::new(),
        ProgressiveConfig::default()
            .with_load_error_handling_policy(Arc::new(policy) as Arc<dyn LoadErrorHandlingPolicy>),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();

    period.prepare(TestCallback::manual(), 0);
    wait_until("fatal error", || period.maybe_throw_prepare_error().is_err());
    assert!(matches!(
        period.maybe_throw_prepare_error(),
        Err(ProgressiveError::Load(LoadError::Fatal(_)))
    ));
    assert!(!period.is_prepared());
    assert!(!period.continue_loading(0));

    collect_events(&mut rx, &mut events);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Period(PeriodEvent::FatalError { .. })))
    );
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_seek_inside_buffer_then_reset() {
    let (container, samples) = audio_only(20, 64);
    let period = period(
        ByteArrayDataSource::new(container.build()),
        FakeExtractor::new(),
        ProgressiveConfig::default(),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::auto_continue();

    prepare(&period, &callback);
    let streams = select_all(&period);
    period.continue_loading(0);
    assert_eq!(drain(&streams[0]), samples);

    assert_eq!(period.seek_to_us(100_000), 100_000);
    wait_for_event(
        &mut rx,
        &mut events,
        &PeriodEvent::Seeked {
            position_us: 100_000,
            in_buffer: true,
        }
        .into(),
    );
    assert_eq!(drain(&streams[0]), samples[5..].to_vec());

    // Nothing buffered is left, so seeking back restarts the load.
    period.discard_buffer(i64::MAX, false);
    assert_eq!(period.seek_to_us(0), 0);
    wait_for_event(
        &mut rx,
        &mut events,
        &PeriodEvent::Seeked {
            position_us: 0,
            in_buffer: false,
        }
        .into(),
    );
    assert!(!streams[0].is_ready());
    assert!(period.continue_loading(0));
    assert_eq!(drain(&streams[0]), samples);
    period.release();
}

#[rstest]
#[case(SeekParameters::EXACT, 130_000)]
#[case(SeekParameters::PREVIOUS_SYNC, 100_000)]
#[case(SeekParameters::NEXT_SYNC, 200_000)]
#[case(SeekParameters::CLOSEST_SYNC, 100_000)]
#[timeout(Duration::from_secs(10))]
fn test_adjusted_seek_position(#[case] parameters: SeekParameters, #[case] expected: i64) {
    let (container, _, _) = audio_video(15);
    let period = period(
        ByteArrayDataSource::new(container.build()),
        FakeExtractor::new(),
        ProgressiveConfig::default(),
    );
    prepare(&period, &TestCallback::auto_continue());
    assert_eq!(period.adjusted_seek_position_us(130_000, parameters), expected);
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_unseekable_stream_derives_duration() {
    let (container, samples) = audio_only(8, 32);
    let container = container.unseekable().without_duration();
    let period = period(
        ByteArrayDataSource::new(container.build()),
        FakeExtractor::new(),
        ProgressiveConfig::default(),
    );
    let callback = TestCallback::auto_continue();

    prepare(&period, &callback);
    assert!(!period.is_seekable());
    assert_eq!(period.adjusted_seek_position_us(50_000, SeekParameters::CLOSEST_SYNC), 0);

    let streams = select_all(&period);
    period.continue_loading(0);
    assert_eq!(drain(&streams[0]), samples);
    assert_eq!(period.duration_us(), Some(7 * SAMPLE_STEP_US + 10_000));
    assert_eq!(period.seek_to_us(50_000), 0);
    period.release();
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[timeout(Duration::from_secs(10))]
fn test_seek_outside_buffer_reopens_at_sync_point(#[case] failing_reopens: u32) {
    const SEEK_US: i64 = 1_030_000;
    const SYNC_US: i64 = 1_000_000;

    let (container, audio, video) = audio_video(100);
    let sync_position = container.record_position(2, SYNC_US).unwrap();
    let inner = ByteArrayDataSource::new(container.build());
    let stats = inner.probe();
    let period = period(
        FlakyDataSource::new(inner).with_failing_reopens(failing_reopens),
        FakeExtractor::new().with_read_chunk(100),
        ProgressiveConfig::default()
            .with_continue_loading_check_interval_bytes(8 * 1024)
            .with_load_error_handling_policy(quick_retries()),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::manual();

    prepare(&period, &callback);
    let streams = select_all(&period);
    assert_eq!(period.seek_to_us(SEEK_US), SEEK_US);
    wait_for_event(
        &mut rx,
        &mut events,
        &PeriodEvent::Seeked {
            position_us: SEEK_US,
            in_buffer: false,
        }
        .into(),
    );

    // Loading restarts at the video keyframe before the target: the audio
    // sample sharing its timestamp precedes it in the stream, and audio
    // before the target is dropped.
    assert_eq!(drain_loading(&period, &streams[1]), video[50..].to_vec());
    assert_eq!(drain_loading(&period, &streams[0]), audio[52..].to_vec());
    assert_eq!(stats.opens(), vec![0, sync_position]);

    collect_events(&mut rx, &mut events);
    assert_eq!(load_errors(&events, true), failing_reopens as usize);
    period.maybe_throw_prepare_error().unwrap();
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_live_stream_failure_defers_retry_until_buffer_drains() {
    let (container, samples) = audio_only(20, 100);
    let container = container.unseekable().without_duration();
    let data_start = container.record_position(1, 0).unwrap();
    let failure_at = container.record_position(1, 8 * SAMPLE_STEP_US).unwrap() + 50;
    let inner = ByteArrayDataSource::new(container.build()).with_unknown_length();
    let stats = inner.probe();
    let period = period(
        FlakyDataSource::new(inner).with_read_failure_at(failure_at),
        FakeExtractor::new(),
        ProgressiveConfig::default()
            .with_continue_loading_check_interval_bytes(200)
            .with_load_error_handling_policy(quick_retries()),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::manual();

    prepare(&period, &callback);
    let streams = select_all(&period);
    wait_until("load error", || {
        period.continue_loading(0);
        collect_events(&mut rx, &mut events);
        load_errors(&events, false) > 0
    });

    // Nothing restarts while buffered samples remain.
    assert!(!period.continue_loading(0));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(stats.opens(), vec![0]);
    period.maybe_throw_prepare_error().unwrap();

    let requests = callback.continue_requests.load(Ordering::SeqCst);
    assert_eq!(read_buffered(&streams[0]), samples[..8].to_vec());
    wait_until("continue request", || {
        callback.continue_requests.load(Ordering::SeqCst) > requests
    });
    assert!(!streams[0].is_ready());
    assert_eq!(stats.opens(), vec![0]);

    assert!(period.continue_loading(0));
    wait_until("discontinuity", || {
        period.continue_loading(0);
        period.read_discontinuity() == Some(0)
    });
    assert_eq!(drain_loading(&period, &streams[0]), samples);
    assert_eq!(stats.opens(), vec![0, data_start]);
    period.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_seek_after_fatal_error_restarts_load() {
    let policy = Unimock::new((
        LoadErrorHandlingPolicyMock::retry_delay_for
            .each_call(matching!(_))
            .returns(None),
        LoadErrorHandlingPolicyMock::min_loadable_retry_count
            .each_call(matching!(_))
            .returns(3_u32),
    ));
    let (container, samples) = audio_only(20, 100);
    let failure_at = container.record_position(1, 8 * SAMPLE_STEP_US).unwrap() + 50;
    let restart_at = container.record_position(1, SAMPLE_STEP_US).unwrap();
    let inner = ByteArrayDataSource::new(container.build());
    let stats = inner.probe();
    let period = period(
        FlakyDataSource::new(inner).with_read_failure_at(failure_at),
        FakeExtractor::new(),
        ProgressiveConfig::default()
            .with_continue_loading_check_interval_bytes(200)
            .with_load_error_handling_policy(Arc::new(policy) as Arc<dyn LoadErrorHandlingPolicy>),
    );
    let mut rx = period.bus().subscribe();
    let mut events = Vec::new();
    let callback = TestCallback::manual();

    prepare(&period, &callback);
    let streams = select_all(&period);
    wait_until("fatal error", || {
        period.continue_loading(0);
        period.maybe_throw_prepare_error().is_err()
    });
    assert!(!period.continue_loading(0));

    // The target is buffered, but the period is idle: seeking resets and
    // clears the error instead of reusing the buffer.
    assert_eq!(period.seek_to_us(SAMPLE_STEP_US), SAMPLE_STEP_US);
    wait_for_event(
        &mut rx,
        &mut events,
        &PeriodEvent::Seeked {
            position_us: SAMPLE_STEP_US,
            in_buffer: false,
        }
        .into(),
    );
    period.maybe_throw_prepare_error().unwrap();
    assert!(period.continue_loading(0));
    assert_eq!(drain_loading(&period, &streams[0]), samples[1..].to_vec());
    assert_eq!(stats.opens(), vec![0, restart_at]);
    period.release();
}
