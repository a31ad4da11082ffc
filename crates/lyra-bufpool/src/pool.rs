use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

/// Trait for types that can be reused in a pool.
pub trait Reuse {
    /// Prepare this value for reuse.
    ///
    /// Must clear every field a new owner could observe. Returns `false` if
    /// the value should be dropped instead of kept in the free list.
    fn reuse(&mut self) -> bool;
}

/// Clears the vector and keeps its capacity.
impl<T> Reuse for Vec<T> {
    fn reuse(&mut self) -> bool {
        self.clear();
        self.capacity() > 0
    }
}

struct FreeList<T> {
    values: Vec<T>,
    capacity: usize,
}

impl<T: Reuse> FreeList<T> {
    fn put(&mut self, mut value: T) {
        if self.values.len() >= self.capacity {
            return;
        }
        if value.reuse() {
            self.values.push(value);
        }
    }
}

/// Bounded free list of reusable values.
///
/// Cloning is cheap; clones share one free list. Values beyond `capacity`
/// are dropped on return rather than kept.
pub struct Pool<T: Reuse> {
    free: Arc<Mutex<FreeList<T>>>,
}

impl<T: Reuse> Pool<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(FreeList {
                values: Vec::with_capacity(capacity.min(16)),
                capacity,
            })),
        }
    }

    /// Maximum number of values kept for reuse.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.lock().capacity
    }

    /// Number of values currently waiting in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().values.len()
    }

    /// Return a value to the free list.
    ///
    /// The value is reset via [`Reuse::reuse`] first. Dropped if the list is
    /// full.
    pub fn recycle(&self, value: T) {
        self.free.lock().put(value);
    }

    /// Wrap an externally created value so it returns here on drop.
    pub fn attach(&self, value: T) -> Pooled<T> {
        Pooled {
            value: Some(value),
            free: Arc::clone(&self.free),
        }
    }
}

impl<T: Reuse + Default> Pool<T> {
    /// Take a value from the free list, or create a default one.
    pub fn acquire(&self) -> Pooled<T> {
        self.acquire_with(|_| {})
    }

    /// Like [`acquire`](Self::acquire), then runs `init` on the value.
    pub fn acquire_with<F>(&self, init: F) -> Pooled<T>
    where
        F: FnOnce(&mut T),
    {
        let reused = self.free.lock().values.pop();
        let mut value = reused.unwrap_or_default();
        init(&mut value);
        self.attach(value)
    }
}

impl<T: Reuse> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            free: Arc::clone(&self.free),
        }
    }
}

impl<T: Reuse> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free = self.free.lock();
        f.debug_struct("Pool")
            .field("available", &free.values.len())
            .field("capacity", &free.capacity)
            .finish()
    }
}

/// Owned RAII guard for a pooled value.
///
/// Returns the value to its pool on drop. A value is either in the free list
/// or inside exactly one guard, never both.
pub struct Pooled<T: Reuse> {
    value: Option<T>,
    free: Arc<Mutex<FreeList<T>>>,
}

impl<T: Reuse> Pooled<T> {
    /// Detach the value; it will not return to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the value was already taken (should not happen in normal use).
    pub fn into_inner(mut self) -> T {
        self.value.take().expect("Pooled value already taken")
    }
}

impl<T: Reuse> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.free.lock().put(value);
        }
    }
}

impl<T: Reuse> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("Pooled value already taken")
    }
}

impl<T: Reuse> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("Pooled value already taken")
    }
}

impl<T: Reuse + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => fmt::Debug::fmt(v, f),
            None => write!(f, "<taken>"),
        }
    }
}
