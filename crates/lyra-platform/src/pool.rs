//! Execution context for blocking loads.
//!
//! A loader spawns every `Loadable::load` onto a [`ThreadPool`]. Loads block
//! on I/O for their whole lifetime, so they never run on the global rayon
//! pool: each pool here owns dedicated, named threads.

use std::{fmt, sync::Arc};

use tracing::debug;

/// Named pool of load threads.
///
/// Cloning shares the underlying threads. The threads exit once the last
/// clone is dropped and the queued work has finished.
#[derive(Clone)]
pub struct ThreadPool {
    name: Arc<str>,
    inner: Arc<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Single-threaded pool: work submitted to it runs strictly in
    /// submission order on a thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be started.
    pub fn serial(name: &str) -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::with_threads(name, 1)
    }

    /// Pool of `threads` workers named `name-0`, `name-1`, ...; a single
    /// worker is named plain `name`.
    ///
    /// Several loaders may share one of these to bound the number of
    /// concurrent loads.
    ///
    /// # Errors
    ///
    /// Returns an error if the threads cannot be started.
    pub fn with_threads(name: &str, threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threads = threads.max(1);
        let base = name.to_owned();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| {
                if threads == 1 {
                    base.clone()
                } else {
                    format!("{base}-{index}")
                }
            })
            .build()?;
        debug!(name, threads, "ThreadPool: created");
        Ok(Self {
            name: Arc::from(name),
            inner: Arc::new(pool),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.inner.current_num_threads()
    }

    /// Queue `f` on the pool.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.spawn(f);
    }

    /// True when called from one of this pool's threads.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.inner.current_thread_index().is_some()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("threads", &self.num_threads())
            .finish()
    }
}
