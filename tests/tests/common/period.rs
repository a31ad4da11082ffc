use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use lyra::prelude::*;

pub const WAIT: Duration = Duration::from_secs(10);

/// Counts callbacks and keeps loading whenever asked.
#[derive(Default)]
pub struct ContinueCallback {
    pub prepared: AtomicUsize,
    pub continue_requests: AtomicUsize,
}

impl PeriodCallback for ContinueCallback {
    fn on_prepared(&self, _period: &ProgressiveMediaPeriod) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_continue_loading_requested(&self, period: &ProgressiveMediaPeriod) {
        self.continue_requests.fetch_add(1, Ordering::SeqCst);
        period.continue_loading(0);
    }
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Prepares `period`, selects every track and lets it load.
pub fn prepare_and_select_all(period: &ProgressiveMediaPeriod) -> Vec<SampleStream> {
    let callback = Arc::new(ContinueCallback::default());
    period.prepare(Arc::clone(&callback) as Arc<dyn PeriodCallback>, 0);
    wait_until("prepared", || callback.prepared.load(Ordering::SeqCst) > 0);
    period.maybe_throw_prepare_error().unwrap();

    let count = period.track_groups().len();
    let selections: Vec<Option<usize>> = (0..count).map(Some).collect();
    let mut streams: Vec<Option<SampleStream>> = (0..count).map(|_| None).collect();
    let mut reset_flags = vec![false; count];
    period.select_tracks(
        &selections,
        &vec![false; count],
        &mut streams,
        &mut reset_flags,
        0,
    );
    period.continue_loading(0);
    streams.into_iter().map(Option::unwrap).collect()
}

/// Reads `stream` to its end-of-stream marker.
pub fn drain(stream: &SampleStream) -> Vec<(i64, Vec<u8>)> {
    let mut holder = FormatHolder::default();
    let mut buffer = DecoderInputBuffer::new();
    let mut samples = Vec::new();
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < deadline, "timed out reading track {}", stream.track());
        stream.maybe_throw_error().unwrap();
        match stream.read_data(&mut holder, &mut buffer, ReadFlags::NONE) {
            ReadResult::NothingRead => thread::sleep(Duration::from_millis(1)),
            ReadResult::FormatRead => {}
            ReadResult::BufferRead if buffer.is_end_of_stream() => return samples,
            ReadResult::BufferRead => samples.push((buffer.time_us, buffer.data.clone())),
        }
    }
}
