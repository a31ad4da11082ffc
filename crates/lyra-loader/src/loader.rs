use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use lyra_looper::{Handler, Looper, Payload};
use lyra_platform::{Condvar, Mutex, ThreadPool};
use tracing::{debug, trace, warn};

use crate::{
    error::{LoadError, LoadResult, LoaderError},
    loadable::{LoadErrorAction, LoadInfo, Loadable, LoaderCallback},
    policy::DEFAULT_MIN_LOADABLE_RETRY_COUNT,
};

static NEXT_LOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Error counts above this stop growing the default backoff.
const MAX_BACKOFF_STEPS: u32 = 5;

/// Loader configuration.
#[derive(Clone)]
pub struct LoaderConfig {
    /// Name of the callback thread; the load thread gets a `-load` suffix.
    pub name: String,
    /// Retry budget used by [`Loader::maybe_throw_error`] when
    /// `start_loading` was given none.
    pub default_min_retry_count: u32,
    /// Backoff unit when a retry action carries no delay.
    pub default_retry_delay: Duration,
    /// Pool loads run on. A serial pool is created when `None`.
    pub thread_pool: Option<ThreadPool>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            name: "lyra-loader".to_owned(),
            default_min_retry_count: DEFAULT_MIN_LOADABLE_RETRY_COUNT,
            default_retry_delay: Duration::from_millis(100),
            thread_pool: None,
        }
    }
}

impl LoaderConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_default_min_retry_count(mut self, count: u32) -> Self {
        self.default_min_retry_count = count;
        self
    }

    #[must_use]
    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    /// Run loads on `pool`. Only a single-threaded pool keeps
    /// `release_with` ordered after the running load.
    #[must_use]
    pub fn with_thread_pool(mut self, pool: ThreadPool) -> Self {
        self.thread_pool = Some(pool);
        self
    }
}

impl fmt::Debug for LoaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderConfig")
            .field("name", &self.name)
            .field("default_min_retry_count", &self.default_min_retry_count)
            .field("default_retry_delay", &self.default_retry_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum LoaderMsg {
    /// A delayed retry is due.
    Start { load_id: u64 },
    /// An attempt returned, or a pending retry was cancelled.
    Finished { load_id: u64, result: LoadResult<()> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoaderMsgTag {
    Start,
    Finished,
}

impl Payload for LoaderMsg {
    type Tag = LoaderMsgTag;

    fn tag(&self) -> LoaderMsgTag {
        match self {
            Self::Start { .. } => LoaderMsgTag::Start,
            Self::Finished { .. } => LoaderMsgTag::Finished,
        }
    }
}

struct Task<L> {
    id: u64,
    loadable: Arc<L>,
    callback: Arc<dyn LoaderCallback<L>>,
    default_min_retry_count: u32,
    canceled: bool,
    current_error: Option<Arc<LoadError>>,
    error_count: u32,
    attempts: u32,
    started_at: Instant,
}

impl<L: Loadable> Task<L> {
    fn info(&self) -> LoadInfo {
        LoadInfo {
            load_id: self.id,
            attempts: self.attempts,
            elapsed: self.started_at.elapsed(),
            bytes_loaded: self.loadable.bytes_loaded(),
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct State<L> {
    task: Option<Task<L>>,
    /// An attempt is running on the pool.
    in_flight: bool,
    fatal_error: Option<Arc<LoadError>>,
    /// Runs once the in-flight attempt returns.
    release_hook: Option<ReleaseHook>,
    /// `on_load_error` is deciding what happens to the task.
    deciding: bool,
}

struct Inner<L> {
    name: String,
    default_min_retry_count: u32,
    default_retry_delay: Duration,
    state: Mutex<State<L>>,
    decided: Condvar,
    released: AtomicBool,
    pool: ThreadPool,
    looper: Looper<LoaderMsg>,
    handler: Handler<LoaderMsg>,
}

/// Runs one [`Loadable`] at a time.
///
/// Loads execute on the loader's pool; callbacks run on the loader's own
/// looper thread. Dropping a loader releases it.
pub struct Loader<L: Loadable> {
    inner: Arc<Inner<L>>,
}

impl<L: Loadable> Loader<L> {
    /// # Errors
    ///
    /// Fails when the callback thread or the load pool cannot be started.
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        let pool = match config.thread_pool {
            Some(pool) => pool,
            None => ThreadPool::serial(&format!("{}-load", config.name))?,
        };
        let looper = Looper::spawn(config.name.clone())?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<L>>| {
            let weak = weak.clone();
            let handler = Handler::new(&looper, move |msg: LoaderMsg| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_message(msg);
                }
            });
            Inner {
                name: config.name,
                default_min_retry_count: config.default_min_retry_count,
                default_retry_delay: config.default_retry_delay,
                state: Mutex::new(State {
                    task: None,
                    in_flight: false,
                    fatal_error: None,
                    release_hook: None,
                    deciding: false,
                }),
                decided: Condvar::new(),
                released: AtomicBool::new(false),
                pool,
                looper,
                handler,
            }
        });
        Ok(Self { inner })
    }

    /// Start `loadable`; returns its load id.
    ///
    /// `min_retry_count` is the budget [`maybe_throw_error`](Self::maybe_throw_error)
    /// applies to this load.
    ///
    /// # Panics
    ///
    /// Panics if a load is already in progress or the loader was released.
    /// Called while `on_load_error` runs on another thread, waits for the
    /// error action to be applied first.
    pub fn start_loading(
        &self,
        loadable: Arc<L>,
        callback: Arc<dyn LoaderCallback<L>>,
        min_retry_count: u32,
    ) -> u64 {
        let inner = &self.inner;
        assert!(
            !inner.released.load(Ordering::Acquire),
            "start_loading on released loader `{}`",
            inner.name
        );
        let id = NEXT_LOAD_ID.fetch_add(1, Ordering::Relaxed);
        let mut state = inner.state.lock();
        while state.deciding && state.task.is_some() {
            assert!(
                !inner.looper.is_current_thread(),
                "start_loading from on_load_error of loader `{}`",
                inner.name
            );
            inner.decided.wait(&mut state);
        }
        assert!(
            state.task.is_none(),
            "start_loading while loader `{}` is busy",
            inner.name
        );
        state.fatal_error = None;
        state.task = Some(Task {
            id,
            loadable,
            callback,
            default_min_retry_count: min_retry_count,
            canceled: false,
            current_error: None,
            error_count: 0,
            attempts: 0,
            started_at: Instant::now(),
        });
        debug!(loader = %inner.name, load_id = id, "Loader: start loading");
        inner.execute(&mut state);
        id
    }

    /// A load is running or waiting to be retried.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    #[must_use]
    pub fn has_fatal_error(&self) -> bool {
        self.inner.state.lock().fatal_error.is_some()
    }

    pub fn clear_fatal_error(&self) {
        self.inner.state.lock().fatal_error = None;
    }

    /// Surface the load error if the current load failed more often than
    /// its retry budget allows, or a fatal error was recorded.
    ///
    /// # Errors
    ///
    /// [`LoadError::Fatal`] or [`LoadError::RetriesExhausted`].
    pub fn maybe_throw_error(&self) -> LoadResult<()> {
        self.maybe_throw_error_inner(None)
    }

    /// Like [`maybe_throw_error`](Self::maybe_throw_error) with an explicit
    /// retry budget.
    ///
    /// # Errors
    ///
    /// [`LoadError::Fatal`] or [`LoadError::RetriesExhausted`].
    pub fn maybe_throw_error_with(&self, min_retry_count: u32) -> LoadResult<()> {
        self.maybe_throw_error_inner(Some(min_retry_count))
    }

    fn maybe_throw_error_inner(&self, min_retry_count: Option<u32>) -> LoadResult<()> {
        let state = self.inner.state.lock();
        if let Some(error) = &state.fatal_error {
            return Err(LoadError::Fatal(Arc::clone(error)));
        }
        let Some(task) = &state.task else {
            return Ok(());
        };
        let budget = min_retry_count.unwrap_or(task.default_min_retry_count);
        match &task.current_error {
            Some(error) if task.error_count > budget => Err(LoadError::RetriesExhausted {
                attempts: task.attempts,
                source: Arc::clone(error),
            }),
            _ => Ok(()),
        }
    }

    /// Ask the current load to stop. The callback then receives
    /// `on_load_canceled(.., released = false)` on the looper thread.
    pub fn cancel_loading(&self) {
        self.inner.cancel(false);
    }

    /// Cancel any load and stop the loader.
    ///
    /// A current load gets `on_load_canceled(.., released = true)` before
    /// this returns. No callback runs afterwards.
    pub fn release(&self) {
        self.release_inner(None);
    }

    /// Like [`release`](Self::release), then run `on_released` once the
    /// in-flight attempt, if any, has returned from `load`.
    pub fn release_with<F>(&self, on_released: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.release_inner(Some(Box::new(on_released)));
    }

    fn release_inner(&self, on_released: Option<ReleaseHook>) {
        let inner = &self.inner;
        if inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(loader = %inner.name, "Loader: release");
        inner.cancel(true);

        let run_now = {
            let mut state = inner.state.lock();
            if state.in_flight {
                state.release_hook = on_released;
                None
            } else {
                on_released
            }
        };
        if let Some(hook) = run_now {
            inner.pool.spawn(hook);
        }
        inner.looper.quit();
    }
}

impl<L: Loadable> Drop for Loader<L> {
    fn drop(&mut self) {
        self.release_inner(None);
    }
}

impl<L: Loadable> fmt::Debug for Loader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.inner.name)
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

impl<L: Loadable> Inner<L> {
    /// Run one attempt of the current task on the pool.
    fn execute(self: &Arc<Self>, state: &mut State<L>) {
        let Some(task) = state.task.as_mut() else {
            return;
        };
        task.current_error = None;
        task.attempts += 1;
        state.in_flight = true;

        let load_id = task.id;
        let attempt = task.attempts;
        let loadable = Arc::clone(&task.loadable);
        let inner = Arc::clone(self);
        trace!(loader = %self.name, load_id, attempt, "Loader: execute");

        self.pool.spawn(move || {
            let result = run_load(&*loadable);
            let hook = {
                let mut state = inner.state.lock();
                state.in_flight = false;
                state.release_hook.take()
            };
            if let Some(hook) = hook {
                hook();
            } else if inner
                .handler
                .send(LoaderMsg::Finished { load_id, result })
                .is_err()
            {
                trace!(loader = %inner.name, load_id, "Loader: result dropped after quit");
            }
        });
    }

    fn handle_message(self: &Arc<Self>, msg: LoaderMsg) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        match msg {
            LoaderMsg::Start { load_id } => {
                let mut state = self.state.lock();
                let due = state
                    .task
                    .as_ref()
                    .is_some_and(|task| task.id == load_id && !task.canceled);
                if due {
                    self.execute(&mut state);
                }
            }
            LoaderMsg::Finished { load_id, result } => self.on_finished(load_id, result),
        }
    }

    fn on_finished(self: &Arc<Self>, load_id: u64, result: LoadResult<()>) {
        let mut state = self.state.lock();
        let Some(task) = state.task.as_mut().filter(|task| task.id == load_id) else {
            return;
        };
        let info = task.info();

        if task.canceled || matches!(result, Err(LoadError::Cancelled)) {
            let Some(task) = state.task.take() else {
                return;
            };
            drop(state);
            debug!(loader = %self.name, load_id, "Loader: load canceled");
            task.callback.on_load_canceled(&task.loadable, &info, false);
            return;
        }

        match result {
            Ok(()) => {
                let Some(task) = state.task.take() else {
                    return;
                };
                drop(state);
                debug!(
                    loader = %self.name,
                    load_id,
                    attempts = info.attempts,
                    bytes = info.bytes_loaded,
                    "Loader: load completed"
                );
                task.callback.on_load_completed(&task.loadable, &info);
            }
            Err(error) => {
                let error = Arc::new(error);
                task.error_count += 1;
                task.current_error = Some(Arc::clone(&error));
                let error_count = task.error_count;
                let loadable = Arc::clone(&task.loadable);
                let callback = Arc::clone(&task.callback);
                state.deciding = true;
                drop(state);

                debug!(loader = %self.name, load_id, error_count, %error, "Loader: load error");
                let action = callback.on_load_error(&loadable, &info, &error, error_count);
                self.apply_error_action(load_id, action, error);
            }
        }
    }

    fn apply_error_action(self: &Arc<Self>, load_id: u64, action: LoadErrorAction, error: Arc<LoadError>) {
        let mut state = self.state.lock();
        state.deciding = false;
        self.decided.notify_all();
        let Some(task) = state.task.as_mut().filter(|task| task.id == load_id) else {
            return;
        };
        // Cancelled from inside the callback: its `Finished` is queued.
        if task.canceled {
            return;
        }

        let (reset, delay) = match action {
            LoadErrorAction::DontRetryFatal => {
                warn!(loader = %self.name, load_id, %error, "Loader: fatal load error");
                state.task = None;
                state.fatal_error = Some(error);
                return;
            }
            LoadErrorAction::DontRetry => {
                debug!(loader = %self.name, load_id, "Loader: not retrying");
                state.task = None;
                return;
            }
            LoadErrorAction::Retry { delay } => (false, delay),
            LoadErrorAction::RetryResetErrorCount { delay } => (true, delay),
        };

        if reset {
            task.error_count = 1;
        }
        let delay = delay.unwrap_or_else(|| self.backoff(task.error_count));
        debug!(
            loader = %self.name,
            load_id,
            error_count = task.error_count,
            delay_ms = delay.as_millis(),
            "Loader: retry scheduled"
        );
        if delay.is_zero() {
            self.execute(&mut state);
        } else if self
            .handler
            .send_delayed(LoaderMsg::Start { load_id }, delay)
            .is_err()
        {
            state.task = None;
        }
    }

    fn backoff(&self, error_count: u32) -> Duration {
        self.default_retry_delay
            .saturating_mul(error_count.clamp(1, MAX_BACKOFF_STEPS))
    }

    fn cancel(&self, released: bool) {
        let mut state = self.state.lock();
        let in_flight = state.in_flight;
        let Some(task) = state.task.as_mut() else {
            return;
        };
        task.canceled = true;
        task.current_error = None;
        let load_id = task.id;

        let interrupt = if in_flight {
            Some(Arc::clone(&task.loadable))
        } else {
            // Waiting for a retry: nothing runs, report through the looper.
            self.handler.remove_messages(LoaderMsgTag::Start);
            if !released
                && self
                    .handler
                    .send(LoaderMsg::Finished {
                        load_id,
                        result: Err(LoadError::Cancelled),
                    })
                    .is_err()
            {
                debug!(loader = %self.name, load_id, "Loader: cancel report dropped after quit");
            }
            None
        };

        let released_task = if released { state.task.take() } else { None };
        drop(state);

        debug!(loader = %self.name, load_id, released, "Loader: cancel");
        if let Some(loadable) = interrupt {
            loadable.cancel_load();
        }
        if let Some(task) = released_task {
            task.callback
                .on_load_canceled(&task.loadable, &task.info(), true);
        }
    }
}

fn run_load<L: Loadable>(loadable: &L) -> LoadResult<()> {
    panic::catch_unwind(AssertUnwindSafe(|| loadable.load()))
        .unwrap_or_else(|payload| Err(LoadError::Unexpected(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "load panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 100)]
    #[case(3, 300)]
    #[case(5, 500)]
    #[case(9, 500)]
    fn test_backoff_is_capped(#[case] error_count: u32, #[case] expected_ms: u64) {
        let delay = Duration::from_millis(100);
        let steps = error_count.clamp(1, MAX_BACKOFF_STEPS);
        assert_eq!(
            delay.saturating_mul(steps),
            Duration::from_millis(expected_ms)
        );
    }

    #[rstest]
    #[case(Box::new("boom") as Box<dyn Any + Send>, "boom")]
    #[case(Box::new(String::from("owned")) as Box<dyn Any + Send>, "owned")]
    #[case(Box::new(7_u8) as Box<dyn Any + Send>, "load panicked")]
    fn test_panic_message(#[case] payload: Box<dyn Any + Send>, #[case] expected: &str) {
        assert_eq!(panic_message(payload.as_ref()), expected);
    }

    #[test]
    fn test_message_tags() {
        assert_eq!(LoaderMsg::Start { load_id: 1 }.tag(), LoaderMsgTag::Start);
        assert_eq!(
            LoaderMsg::Finished {
                load_id: 1,
                result: Ok(())
            }
            .tag(),
            LoaderMsgTag::Finished
        );
    }
}
