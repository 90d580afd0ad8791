//! Progress guarantees, memory-consistency models and cardinalities.
//!
//! Concurrent queue variants are parameterized three ways:
//!
//! - a per-call [`ProgressGuarantee`] bounding the worst-case behaviour
//!   of a single operation under contention;
//! - a type-level [`ConsistencyModel`] selecting the memory orderings
//!   used on the tail, head and control words;
//! - type-level [`Cardinality`] markers describing how many threads
//!   produce or consume, used to tune contention handling.

use core::sync::atomic::Ordering;

/// Caller-supplied bound on the worst-case behaviour of an operation.
///
/// Ordered from weakest to strongest: an operation that satisfies a
/// stronger guarantee satisfies all weaker ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressGuarantee {
    /// The calling thread may block, typically inside the system
    /// allocator while a new page is obtained.
    Blocking,
    /// The operation completes in a bounded number of steps if all
    /// other threads are suspended. No blocking allocation.
    ObstructionFree,
    /// In case of contention some thread completes in a finite number
    /// of steps. No blocking allocation; page switches may only reuse
    /// pages already in the free list.
    LockFree,
    /// The operation completes in a bounded number of its own steps:
    /// a single reservation attempt, no page switch.
    WaitFree,
}

impl ProgressGuarantee {
    /// Whether this guarantee permits calling into the system allocator.
    #[inline]
    #[must_use]
    pub fn allows_blocking_alloc(self) -> bool {
        self == ProgressGuarantee::Blocking
    }

    /// Whether this guarantee permits retrying a failed reservation.
    #[inline]
    #[must_use]
    pub fn allows_retry(self) -> bool {
        self < ProgressGuarantee::WaitFree
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Selects the memory orderings used by the lock-free queue.
///
/// Implemented by [`Sequential`] and [`Relaxed`]; not implementable
/// outside the crate.
pub trait ConsistencyModel: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    /// Ordering for loads of shared words.
    const LOAD: Ordering;
    /// Ordering for publishing stores.
    const STORE: Ordering;
    /// Success ordering for read-modify-write operations.
    const RMW: Ordering;
    /// Failure ordering for compare-exchange operations.
    const CAS_FAILURE: Ordering;
}

/// All puts and consumes appear in a single total order consistent
/// with each thread's program order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sequential;

impl sealed::Sealed for Sequential {}
impl ConsistencyModel for Sequential {
    const LOAD: Ordering = Ordering::SeqCst;
    const STORE: Ordering = Ordering::SeqCst;
    const RMW: Ordering = Ordering::SeqCst;
    const CAS_FAILURE: Ordering = Ordering::SeqCst;
}

/// Puts are ordered per producer but not across producers; consumes
/// observe them in some order consistent with each producer's order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relaxed;

impl sealed::Sealed for Relaxed {}
impl ConsistencyModel for Relaxed {
    const LOAD: Ordering = Ordering::Acquire;
    const STORE: Ordering = Ordering::Release;
    const RMW: Ordering = Ordering::AcqRel;
    const CAS_FAILURE: Ordering = Ordering::Acquire;
}

/// Declares how many threads act on one side of a queue.
///
/// The reservation algorithm is identical either way; a [`Single`]
/// marker only disables exponential backoff, since an uncontended CAS
/// never retries.
pub trait Cardinality: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    /// True when several threads may operate on this side concurrently.
    const CONTENDED: bool;
}

/// One thread on this side of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Single;

impl sealed::Sealed for Single {}
impl Cardinality for Single {
    const CONTENDED: bool = false;
}

/// Any number of threads on this side of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Multi;

impl sealed::Sealed for Multi {}
impl Cardinality for Multi {
    const CONTENDED: bool = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarantee_ordering() {
        assert!(ProgressGuarantee::Blocking < ProgressGuarantee::ObstructionFree);
        assert!(ProgressGuarantee::ObstructionFree < ProgressGuarantee::LockFree);
        assert!(ProgressGuarantee::LockFree < ProgressGuarantee::WaitFree);
    }

    #[test]
    fn test_blocking_alloc_policy() {
        assert!(ProgressGuarantee::Blocking.allows_blocking_alloc());
        assert!(!ProgressGuarantee::LockFree.allows_blocking_alloc());
        assert!(!ProgressGuarantee::WaitFree.allows_blocking_alloc());
    }

    #[test]
    fn test_retry_policy() {
        assert!(ProgressGuarantee::Blocking.allows_retry());
        assert!(ProgressGuarantee::LockFree.allows_retry());
        assert!(!ProgressGuarantee::WaitFree.allows_retry());
    }

    #[test]
    fn test_cardinality_flags() {
        assert!(!Single::CONTENDED);
        assert!(Multi::CONTENDED);
    }
}
