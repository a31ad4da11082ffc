//! Memory reuse for the lyra hot paths.
//!
//! Two independent facilities live here:
//!
//! - [`Pool`]: a bounded free list of reusable values handed out as RAII
//!   [`Pooled`] guards. The scheduler keeps its messages in one.
//! - [`Allocator`]: an arena of fixed-length byte chunks addressed by a
//!   generation-checked [`AllocationId`]. Sample stores lease chunks from a
//!   shared allocator and return them on discard.
//!
//! ## Example
//!
//! ```
//! use lyra_bufpool::{Allocator, AllocatorConfig, Pool};
//!
//! let pool = Pool::<Vec<u8>>::new(8);
//! let mut buf = pool.acquire();
//! buf.extend_from_slice(b"hello");
//! drop(buf); // back in the free list
//! assert_eq!(pool.available(), 1);
//!
//! let allocator = Allocator::new(AllocatorConfig::default().with_individual_allocation_length(4));
//! let chunk = allocator.allocate();
//! assert_eq!(chunk.len(), 4);
//! allocator.release(chunk);
//! ```

#![forbid(unsafe_code)]

mod allocator;
mod pool;

pub use allocator::{Allocation, AllocationId, Allocator, AllocatorConfig};
pub use pool::{Pool, Pooled, Reuse};
