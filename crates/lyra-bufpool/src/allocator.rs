use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::trace;

/// Default length of one chunk.
pub const DEFAULT_INDIVIDUAL_ALLOCATION_LENGTH: usize = 64 * 1024;

/// Configuration for [`Allocator`].
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Length in bytes of every chunk handed out.
    pub individual_allocation_length: usize,
    /// Chunks created up front and parked in the free list.
    pub initial_allocation_count: usize,
    /// Drop every cached chunk when [`Allocator::reset`] is called.
    pub trim_on_reset: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            individual_allocation_length: DEFAULT_INDIVIDUAL_ALLOCATION_LENGTH,
            initial_allocation_count: 0,
            trim_on_reset: true,
        }
    }
}

impl AllocatorConfig {
    /// Set chunk length.
    #[must_use]
    pub fn with_individual_allocation_length(mut self, length: usize) -> Self {
        self.individual_allocation_length = length;
        self
    }

    /// Set the number of chunks created up front.
    #[must_use]
    pub fn with_initial_allocation_count(mut self, count: usize) -> Self {
        self.initial_allocation_count = count;
        self
    }

    /// Set whether `reset` trims cached chunks.
    #[must_use]
    pub fn with_trim_on_reset(mut self, trim: bool) -> Self {
        self.trim_on_reset = trim;
        self
    }
}

/// Identity of one leased chunk.
///
/// `generation` changes every time the slot is released, so an id kept
/// past its release no longer matches the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationId {
    pub index: u32,
    pub generation: u32,
}

struct Slot {
    generation: u32,
    leased: bool,
    /// Cached chunk while the slot is free.
    chunk: Option<Box<[u8]>>,
}

struct Arena {
    length: usize,
    trim_on_reset: bool,
    slots: Vec<Slot>,
    /// Free slots that still cache a chunk.
    free: Vec<u32>,
    /// Free slots whose chunk was trimmed away.
    vacant: Vec<u32>,
    leased: usize,
}

impl Arena {
    fn lease(&mut self) -> (AllocationId, Box<[u8]>) {
        let length = self.length;
        let (index, chunk) = if let Some(index) = self.free.pop() {
            let chunk = self.slots[index as usize]
                .chunk
                .take()
                .unwrap_or_else(|| vec![0; length].into_boxed_slice());
            (index, chunk)
        } else if let Some(index) = self.vacant.pop() {
            (index, vec![0; length].into_boxed_slice())
        } else {
            let index = u32::try_from(self.slots.len()).expect("allocator slot count overflow");
            self.slots.push(Slot {
                generation: 0,
                leased: false,
                chunk: None,
            });
            (index, vec![0; length].into_boxed_slice())
        };

        let slot = &mut self.slots[index as usize];
        slot.leased = true;
        self.leased += 1;
        (
            AllocationId {
                index,
                generation: slot.generation,
            },
            chunk,
        )
    }

    fn give_back(&mut self, id: AllocationId, chunk: Box<[u8]>) {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .unwrap_or_else(|| panic!("release of unknown allocation {id:?}"));
        assert!(
            slot.leased && slot.generation == id.generation,
            "stale or double release of allocation {id:?} (slot generation {}, leased {})",
            slot.generation,
            slot.leased
        );
        slot.leased = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.chunk = Some(chunk);
        self.leased -= 1;
        self.free.push(id.index);
    }

    fn trim(&mut self, target_bytes: usize) {
        let target_count = target_bytes.div_ceil(self.length.max(1));
        let keep = target_count.saturating_sub(self.leased);
        while self.free.len() > keep {
            let Some(index) = self.free.pop() else {
                break;
            };
            self.slots[index as usize].chunk = None;
            self.vacant.push(index);
        }
    }
}

/// Shared arena of fixed-length byte chunks.
///
/// Cloning is cheap; clones lease from the same arena. Every operation takes
/// the arena lock, so sample stores on different threads may share one
/// allocator.
#[derive(Clone)]
pub struct Allocator {
    arena: Arc<Mutex<Arena>>,
}

impl Allocator {
    /// # Panics
    ///
    /// Panics if `individual_allocation_length` is zero.
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        assert!(
            config.individual_allocation_length > 0,
            "allocation length must be positive"
        );
        let mut arena = Arena {
            length: config.individual_allocation_length,
            trim_on_reset: config.trim_on_reset,
            slots: Vec::with_capacity(config.initial_allocation_count),
            free: Vec::with_capacity(config.initial_allocation_count),
            vacant: Vec::new(),
            leased: 0,
        };
        for index in 0..config.initial_allocation_count {
            arena.slots.push(Slot {
                generation: 0,
                leased: false,
                chunk: Some(vec![0; config.individual_allocation_length].into_boxed_slice()),
            });
            arena
                .free
                .push(u32::try_from(index).expect("allocator slot count overflow"));
        }
        Self {
            arena: Arc::new(Mutex::new(arena)),
        }
    }

    /// Lease one chunk. Reuses a cached chunk when one is free.
    pub fn allocate(&self) -> Allocation {
        let (id, chunk) = self.arena.lock().lease();
        trace!(index = id.index, generation = id.generation, "Allocator: lease");
        Allocation {
            id,
            data: Some(chunk),
            arena: Arc::downgrade(&self.arena),
        }
    }

    /// Return a chunk to the arena.
    ///
    /// # Panics
    ///
    /// Panics if `allocation` was leased from a different allocator.
    pub fn release(&self, allocation: Allocation) {
        assert!(
            Weak::ptr_eq(&allocation.arena, &Arc::downgrade(&self.arena)),
            "allocation {:?} released to a foreign allocator",
            allocation.id
        );
        drop(allocation);
    }

    /// Return several chunks at once.
    pub fn release_all<I>(&self, allocations: I)
    where
        I: IntoIterator<Item = Allocation>,
    {
        for allocation in allocations {
            self.release(allocation);
        }
    }

    /// Drop cached chunks until at most `target_bytes` worth of chunks
    /// (leased plus cached) remain. Leased chunks are never touched.
    pub fn trim(&self, target_bytes: usize) {
        let mut arena = self.arena.lock();
        let before = arena.free.len();
        arena.trim(target_bytes);
        trace!(
            target_bytes,
            dropped = before - arena.free.len(),
            "Allocator: trim"
        );
    }

    /// Trim every cached chunk if configured to.
    pub fn reset(&self) {
        let mut arena = self.arena.lock();
        if arena.trim_on_reset {
            arena.trim(0);
        }
    }

    /// Bytes currently leased out.
    #[must_use]
    pub fn total_bytes_allocated(&self) -> usize {
        let arena = self.arena.lock();
        arena.leased * arena.length
    }

    /// Number of cached chunks ready for reuse.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.arena.lock().free.len()
    }

    #[must_use]
    pub fn individual_allocation_length(&self) -> usize {
        self.arena.lock().length
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("Allocator")
            .field("length", &arena.length)
            .field("leased", &arena.leased)
            .field("cached", &arena.free.len())
            .finish()
    }
}

/// One leased chunk.
///
/// Returns to its allocator on drop if not released explicitly. The chunk is
/// exclusively owned while leased, so stale reads through it cannot happen.
pub struct Allocation {
    id: AllocationId,
    data: Option<Box<[u8]>>,
    arena: Weak<Mutex<Arena>>,
}

impl Allocation {
    #[must_use]
    pub fn id(&self) -> AllocationId {
        self.id
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let Some(chunk) = self.data.take() else {
            return;
        };
        // Allocator already gone: the chunk just frees.
        if let Some(arena) = self.arena.upgrade() {
            arena.lock().give_back(self.id, chunk);
        }
    }
}

impl Deref for Allocation {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("Allocation already returned")
    }
}

impl DerefMut for Allocation {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("Allocation already returned")
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("len", &self.data.as_ref().map_or(0, |d| d.len()))
            .finish()
    }
}
