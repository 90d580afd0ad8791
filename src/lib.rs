//! Heterogeneous FIFO queues over paged storage.
//!
//! This library stores values of arbitrary, dynamically varying types
//! in tightly packed, page-backed storage, in FIFO order. Four queue
//! variants share a single data layout, element lifecycle and
//! transactional put/consume model, differing only in synchronization
//! policy:
//!
//! - [`HeterQueue`] — single-threaded; control words are plain memory
//!   accesses.
//! - [`MutexQueue`] — one mutex around every operation.
//! - [`SpinQueue`] — the same, with a spinlock.
//! - [`LfQueue`] — lock-free producers and consumers over atomic
//!   head/tail pointers, with pin-counted page reclamation.
//!
//! Elements are described at runtime by a [`RuntimeType`]: one
//! pointer to a static per-type feature table (see
//! [`runtime_type`]). Storage comes from a [`PagedAllocator`] handing
//! out fixed-size, size-aligned, zeroed pages (see [`page_alloc`]).
//!
//! # Example
//!
//! ```
//! use hetq::HeterQueue;
//!
//! let mut queue = HeterQueue::new();
//! queue.push(7i32)?;
//! queue.push(String::from("paged"))?;
//!
//! let consume = queue.try_start_consume().unwrap();
//! assert_eq!(*consume.element::<i32>(), 7);
//! consume.commit();
//!
//! let consume = queue.try_start_consume().unwrap();
//! assert_eq!(consume.element::<String>(), "paged");
//! consume.commit();
//! assert!(queue.empty());
//! # Ok::<(), hetq::Error>(())
//! ```
//!
//! # Module organization
//!
//! Foundation: [`error`], [`progress`], [`page_alloc`],
//! [`runtime_type`]. Shared layout: control blocks and element
//! packing (internal). Queue variants: [`heter_queue`],
//! [`mutex_queue`], [`spin_queue`], [`lf_queue`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Foundation
// =============================================================================

/// Error types for queue and allocator operations.
pub mod error;

/// Progress guarantees, consistency models and cardinalities.
pub mod progress;

/// Paged allocator with pin-counted reclamation.
pub mod page_alloc;

/// Runtime type erasure through per-type feature tables.
pub mod runtime_type;

// =============================================================================
// Shared internals
// =============================================================================

mod backoff;
mod control;

/// Test-and-test-and-set spinlock backing [`SpinQueue`].
pub mod spinlock;

// =============================================================================
// Queue variants
// =============================================================================

/// Single-threaded heterogeneous FIFO queue.
pub mod heter_queue;

/// Mutex-protected heterogeneous FIFO queue.
pub mod mutex_queue;

/// Spin-locking heterogeneous FIFO queue.
pub mod spin_queue;

mod lf_head;
mod lf_tail;

/// Lock-free heterogeneous FIFO queue.
pub mod lf_queue;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use heter_queue::HeterQueue;
pub use lf_queue::{LfQueue, RelaxedLfQueue, SpscLfQueue};
pub use mutex_queue::MutexQueue;
pub use page_alloc::{DefaultAllocator, PageAllocator, PagedAllocator, DEFAULT_PAGE_SIZE};
pub use progress::ProgressGuarantee;
pub use runtime_type::{DefaultFeatures, RuntimeType};
pub use spin_queue::SpinQueue;
