use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use lyra_loader::{
    LoadError, LoadErrorAction, LoadInfo, Loadable, Loader, LoaderCallback, LoaderConfig,
};
use lyra_platform::{Condvar, Mutex};
use rstest::rstest;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);
const FOREVER: Duration = Duration::from_secs(3600);

#[derive(Debug, PartialEq)]
enum Outcome {
    Completed { attempts: u32 },
    Canceled { released: bool },
    Error { error_count: u32, message: String },
    Released { load_returned: bool },
}

/// Fails its first `failures` attempts, then succeeds. With `block`, each
/// attempt waits for `cancel_load`.
struct TestLoadable {
    failures: u32,
    block: bool,
    panic: bool,
    attempts: AtomicU32,
    canceled: Mutex<bool>,
    wake: Condvar,
    returned: AtomicBool,
    started: Mutex<Option<mpsc::Sender<()>>>,
}

impl TestLoadable {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            block: false,
            panic: false,
            attempts: AtomicU32::new(0),
            canceled: Mutex::new(false),
            wake: Condvar::new(),
            returned: AtomicBool::new(false),
            started: Mutex::new(None),
        }
    }

    fn blocking(started: mpsc::Sender<()>) -> Self {
        Self {
            block: true,
            started: Mutex::new(Some(started)),
            ..Self::new(0)
        }
    }

    fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::new(0)
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Loadable for TestLoadable {
    fn load(&self) -> Result<(), LoadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(!self.panic, "boom");
        if self.block {
            if let Some(started) = self.started.lock().as_ref() {
                let _ = started.send(());
            }
            let mut canceled = self.canceled.lock();
            while !*canceled {
                self.wake.wait(&mut canceled);
            }
            // Give a release a moment to queue its hook.
            thread::sleep(Duration::from_millis(20));
            self.returned.store(true, Ordering::SeqCst);
            return Err(LoadError::Cancelled);
        }
        if attempt <= self.failures {
            return Err(io::Error::other(format!("attempt {attempt} failed")).into());
        }
        Ok(())
    }

    fn cancel_load(&self) {
        *self.canceled.lock() = true;
        self.wake.notify_all();
    }
}

type Decide = Box<dyn Fn(u32) -> LoadErrorAction + Send + Sync>;

struct Recorder {
    tx: Mutex<mpsc::Sender<Outcome>>,
    decide: Decide,
}

impl Recorder {
    fn new(decide: impl Fn(u32) -> LoadErrorAction + Send + Sync + 'static) -> (Arc<Self>, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Self {
            tx: Mutex::new(tx),
            decide: Box::new(decide),
        });
        (recorder, rx)
    }

    fn record(&self, outcome: Outcome) {
        let _ = self.tx.lock().send(outcome);
    }
}

impl LoaderCallback<TestLoadable> for Recorder {
    fn on_load_completed(&self, _loadable: &TestLoadable, info: &LoadInfo) {
        self.record(Outcome::Completed {
            attempts: info.attempts,
        });
    }

    fn on_load_canceled(&self, _loadable: &TestLoadable, _info: &LoadInfo, released: bool) {
        self.record(Outcome::Canceled { released });
    }

    fn on_load_error(
        &self,
        _loadable: &TestLoadable,
        _info: &LoadInfo,
        error: &Arc<LoadError>,
        error_count: u32,
    ) -> LoadErrorAction {
        self.record(Outcome::Error {
            error_count,
            message: error.to_string(),
        });
        (self.decide)(error_count)
    }
}

fn loader(name: &str) -> Loader<TestLoadable> {
    Loader::new(
        LoaderConfig::default()
            .with_name(name)
            .with_default_retry_delay(Duration::from_millis(1)),
    )
    .unwrap()
}

fn retry_now(_: u32) -> LoadErrorAction {
    LoadErrorAction::Retry {
        delay: Some(Duration::from_millis(1)),
    }
}

fn wait_until_idle(loader: &Loader<TestLoadable>) {
    while loader.is_loading() {
        thread::sleep(Duration::from_millis(1));
    }
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_completes_on_first_attempt() {
    let loader = loader("test-complete");
    let loadable = Arc::new(TestLoadable::new(0));
    let (callback, rx) = Recorder::new(retry_now);

    loader.start_loading(Arc::clone(&loadable), callback, 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Outcome::Completed { attempts: 1 });
    assert!(!loader.is_loading());
    assert!(loader.maybe_throw_error().is_ok());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_transient_failures_are_retried() {
    let loader = loader("test-transient");
    let loadable = Arc::new(TestLoadable::new(2));
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::Retry { delay: None });

    loader.start_loading(Arc::clone(&loadable), callback, 3);
    for error_count in 1..=2 {
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Outcome::Error { error_count: n, .. } if n == error_count
        ));
    }
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Outcome::Completed { attempts: 3 });
    assert_eq!(loadable.attempts(), 3);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[timeout(Duration::from_secs(10))]
fn test_retry_budget_surfaces_after_n_plus_one_attempts(#[case] min_retry_count: u32) {
    let loader = loader("test-budget");
    let loadable = Arc::new(TestLoadable::new(u32::MAX));
    let (callback, rx) = Recorder::new(move |error_count| {
        let delay = if error_count > min_retry_count {
            FOREVER
        } else {
            Duration::from_millis(1)
        };
        LoadErrorAction::Retry { delay: Some(delay) }
    });

    loader.start_loading(Arc::clone(&loadable), callback, min_retry_count);
    for _ in 0..min_retry_count {
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Error { .. }));
        assert!(loader.maybe_throw_error().is_ok());
    }
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Error { error_count, .. } if error_count == min_retry_count + 1
    ));

    match loader.maybe_throw_error() {
        Err(LoadError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, min_retry_count + 1);
            assert!(matches!(*source, LoadError::Io(_)));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(loadable.attempts(), min_retry_count + 1);
    assert!(loader.maybe_throw_error_with(min_retry_count + 1).is_ok());
    loader.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_reset_error_count_keeps_budget() {
    let loader = loader("test-reset");
    let loadable = Arc::new(TestLoadable::new(4));
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::RetryResetErrorCount {
        delay: Some(Duration::from_millis(1)),
    });

    loader.start_loading(Arc::clone(&loadable), callback, 2);
    let mut counts = Vec::new();
    loop {
        match rx.recv_timeout(WAIT).unwrap() {
            Outcome::Error { error_count, .. } => counts.push(error_count),
            Outcome::Completed { attempts } => {
                assert_eq!(attempts, 5);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(counts, vec![1, 2, 2, 2]);
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_dont_retry_fatal_is_surfaced() {
    let loader = loader("test-fatal");
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::DontRetryFatal);

    loader.start_loading(Arc::new(TestLoadable::new(1)), callback, 3);
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Error { error_count: 1, .. }));
    wait_until_idle(&loader);

    assert!(loader.has_fatal_error());
    assert!(matches!(loader.maybe_throw_error(), Err(LoadError::Fatal(_))));
    loader.clear_fatal_error();
    assert!(loader.maybe_throw_error().is_ok());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_dont_retry_ends_load_quietly() {
    let loader = loader("test-dont-retry");
    let loadable = Arc::new(TestLoadable::new(1));
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::DontRetry);

    loader.start_loading(Arc::clone(&loadable), callback, 0);
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Error { .. }));
    wait_until_idle(&loader);
    assert!(loader.maybe_throw_error().is_ok());
    assert_eq!(loadable.attempts(), 1);
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_cancel_running_load() {
    let loader = loader("test-cancel");
    let (started_tx, started_rx) = mpsc::channel();
    let (callback, rx) = Recorder::new(retry_now);

    loader.start_loading(Arc::new(TestLoadable::blocking(started_tx)), callback, 3);
    started_rx.recv_timeout(WAIT).unwrap();
    loader.cancel_loading();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Outcome::Canceled { released: false });
    assert!(rx.recv_timeout(QUIET).is_err(), "exactly one terminal outcome");
    assert!(!loader.is_loading());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_cancel_pending_retry() {
    let loader = loader("test-cancel-retry");
    let loadable = Arc::new(TestLoadable::new(u32::MAX));
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::Retry {
        delay: Some(FOREVER),
    });

    loader.start_loading(Arc::clone(&loadable), callback, 3);
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Error { .. }));
    loader.cancel_loading();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Outcome::Canceled { released: false });
    assert_eq!(loadable.attempts(), 1);
    assert!(loader.maybe_throw_error().is_ok());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_release_cancels_before_on_released() {
    let loader = loader("test-release");
    let (started_tx, started_rx) = mpsc::channel();
    let loadable = Arc::new(TestLoadable::blocking(started_tx));
    let (callback, rx) = Recorder::new(retry_now);

    loader.start_loading(Arc::clone(&loadable), Arc::clone(&callback) as Arc<dyn LoaderCallback<_>>, 3);
    started_rx.recv_timeout(WAIT).unwrap();

    let hook_recorder = Arc::clone(&callback);
    let hook_loadable = Arc::clone(&loadable);
    loader.release_with(move || {
        hook_recorder.record(Outcome::Released {
            load_returned: hook_loadable.returned.load(Ordering::SeqCst),
        });
    });

    // Delivered synchronously by `release_with`.
    assert_eq!(rx.try_recv().unwrap(), Outcome::Canceled { released: true });
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Outcome::Released { load_returned: true }
    );
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_release_when_idle_runs_hook() {
    let loader = loader("test-release-idle");
    let (tx, rx) = mpsc::channel();
    loader.release_with(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(WAIT).unwrap();
    loader.release();
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_panic_in_load_is_reported_as_unexpected() {
    let loader = loader("test-panic");
    let (callback, rx) = Recorder::new(|_| LoadErrorAction::DontRetry);

    loader.start_loading(Arc::new(TestLoadable::panicking()), callback, 3);
    match rx.recv_timeout(WAIT).unwrap() {
        Outcome::Error { message, .. } => assert!(message.contains("boom"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn test_loader_is_reusable_after_completion() {
    let loader = loader("test-reuse");
    let (callback, rx) = Recorder::new(retry_now);

    for _ in 0..3 {
        loader.start_loading(Arc::new(TestLoadable::new(0)), Arc::clone(&callback) as Arc<dyn LoaderCallback<_>>, 3);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Outcome::Completed { attempts: 1 });
        wait_until_idle(&loader);
    }
}

#[rstest]
#[should_panic(expected = "busy")]
fn test_start_while_loading_panics() {
    let loader = loader("test-busy");
    let (started_tx, _started_rx) = mpsc::channel();
    let (callback, _rx) = Recorder::new(retry_now);
    loader.start_loading(
        Arc::new(TestLoadable::blocking(started_tx)),
        Arc::clone(&callback) as Arc<dyn LoaderCallback<_>>,
        3,
    );
    loader.start_loading(Arc::new(TestLoadable::new(0)), callback, 3);
}
