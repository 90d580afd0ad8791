//! Lock-free heterogeneous FIFO queue.
//!
//! The concurrent centrepiece of the crate: any number of producers
//! and consumers share the queue through `&self`, synchronized only
//! by atomics on the tail, the head and the per-slot control words.
//! Storage, layout and element lifecycle match the other variants.
//!
//! ```
//! use hetq::LfQueue;
//!
//! let queue = LfQueue::new();
//! std::thread::scope(|s| {
//!     s.spawn(|| queue.push(1u32).unwrap());
//!     s.spawn(|| {
//!         while !queue.try_consume() {
//!             std::thread::yield_now();
//!         }
//!     });
//! });
//! ```
//!
//! Type parameters select the element feature list, the allocator,
//! producer and consumer [cardinalities](crate::progress::Cardinality)
//! and the [consistency model](crate::progress::ConsistencyModel).

use core::alloc::Layout;
use core::ptr;

use crate::error::{Error, Result};
use crate::lf_head::LfHead;
use crate::page_alloc::{DefaultAllocator, PagedAllocator, MAX_POOLED_PAGE_SIZE};
use crate::progress::{Cardinality, ConsistencyModel, Multi, ProgressGuarantee, Sequential, Single};
use crate::progress::Relaxed;
use crate::runtime_type::{
    DefaultFeatures, FCopyConstruct, FDefaultConstruct, FMoveConstruct, FTypeId, HasFeature,
    ListOf, QueueFeatures, RuntimeType,
};

/// Lock-free heterogeneous FIFO queue.
pub struct LfQueue<
    L: QueueFeatures = DefaultFeatures,
    A: PagedAllocator = DefaultAllocator,
    P: Cardinality = Multi,
    C: Cardinality = Multi,
    M: ConsistencyModel = Sequential,
> {
    inner: LfHead<L, A, P, C, M>,
}

/// Lock-free queue with relaxed (per-producer) ordering.
pub type RelaxedLfQueue<L = DefaultFeatures, A = DefaultAllocator> =
    LfQueue<L, A, Multi, Multi, Relaxed>;

/// Lock-free queue tuned for one producer and one consumer.
pub type SpscLfQueue<L = DefaultFeatures, A = DefaultAllocator> =
    LfQueue<L, A, Single, Single, Sequential>;

// Elements can only enter through `T: Send` bounds (or unsafe dyn
// puts), so moving or sharing the queue across threads is sound.
unsafe impl<L, A, P, C, M> Send for LfQueue<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator + Send,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
}
unsafe impl<L, A, P, C, M> Sync for LfQueue<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator + Sync,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
}

impl<L, A, P, C, M> Default for LfQueue<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<L, A, P, C, M> LfQueue<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    // Consumers pin pages speculatively, which requires freed pages to
    // stay mapped; only pooled page sizes guarantee that.
    const PAGE_OK: () = assert!(
        A::PAGE_SIZE <= MAX_POOLED_PAGE_SIZE,
        "lock-free queues require a pooled page size (at most 1 MiB)"
    );

    /// Create an empty queue with a default allocator.
    ///
    /// # Panics
    ///
    /// Aborts via the global allocation error hook if the first page
    /// cannot be allocated.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }

    /// Create an empty queue over the given allocator.
    ///
    /// # Panics
    ///
    /// Aborts via the global allocation error hook if the first page
    /// cannot be allocated.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        let () = Self::PAGE_OK;
        match LfHead::with_allocator(alloc) {
            Ok(inner) => Self { inner },
            Err(_) => std::alloc::handle_alloc_error(unsafe {
                Layout::from_size_align_unchecked(A::PAGE_SIZE, A::PAGE_SIZE)
            }),
        }
    }

    /// Largest payload size (at minimal alignment) stored inside a
    /// page; anything bigger goes through the external allocator.
    #[must_use]
    pub fn inline_limit() -> usize {
        crate::control::max_inline_size::<L>(A::PAGE_SIZE, crate::lf_tail::UNIT)
    }

    // -- producers ---------------------------------------------------------

    /// Append a value, committing immediately.
    pub fn push<T>(&self, value: T) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
    {
        self.start_push(value)?.commit();
        Ok(())
    }

    /// Append the value produced by `f`, committing immediately. A
    /// panic in `f` tombstones the slot and resumes.
    pub fn emplace_with<T, F>(&self, f: F) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
        F: FnOnce() -> T,
    {
        self.start_emplace_with(f)?.commit();
        Ok(())
    }

    /// Append a value under the given progress guarantee. `Ok(false)`
    /// means the guarantee could not be met under current contention
    /// (or would have required a blocking page allocation); the queue
    /// is unchanged and the call may be repeated.
    pub fn try_push<T>(&self, guarantee: ProgressGuarantee, value: T) -> Result<bool>
    where
        L: ListOf<T>,
        T: Send,
    {
        let rtype = RuntimeType::<L>::make::<T>();
        let outcome = self.inner.tail.begin_put(
            Layout::new::<T>(),
            rtype,
            |dst, v| unsafe { ptr::write(dst.cast::<T>(), v) },
            value,
            guarantee,
        );
        match outcome {
            Ok((slot, _)) => {
                self.inner.tail.commit_slot(slot);
                Ok(true)
            }
            Err(Error::WouldBlock) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Begin a put transaction holding `value`. The element becomes
    /// observable only on [`PutTransaction::commit`]; dropping the
    /// transaction tombstones it.
    pub fn start_push<T>(&self, value: T) -> Result<PutTransaction<'_, L, A, P, C, M>>
    where
        L: ListOf<T>,
        T: Send,
    {
        self.start_emplace_with(move || value)
    }

    /// Begin a put transaction whose element is produced by `f`.
    pub fn start_emplace_with<T, F>(&self, f: F) -> Result<PutTransaction<'_, L, A, P, C, M>>
    where
        L: ListOf<T>,
        T: Send,
        F: FnOnce() -> T,
    {
        let rtype = RuntimeType::<L>::make::<T>();
        let (slot, element) = self.inner.tail.begin_put(
            Layout::new::<T>(),
            rtype,
            |dst, f| unsafe { ptr::write(dst.cast::<T>(), f()) },
            f,
            ProgressGuarantee::Blocking,
        )?;
        Ok(PutTransaction {
            queue: self,
            slot,
            element,
            done: false,
        })
    }

    /// Append a default-constructed element of a runtime type.
    pub fn dyn_push(&self, rtype: RuntimeType<L>) -> Result<()>
    where
        L: HasFeature<FDefaultConstruct>,
    {
        let (slot, _) = self.inner.tail.begin_put(
            rtype.layout(),
            rtype,
            |dst, rt: RuntimeType<L>| unsafe { rt.default_construct(dst) },
            rtype,
            ProgressGuarantee::Blocking,
        )?;
        self.inner.tail.commit_slot(slot);
        Ok(())
    }

    /// Append a copy of the erased value at `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a live value of the type `rtype` describes,
    /// and that type must be `Send`.
    pub unsafe fn dyn_push_copy(&self, rtype: RuntimeType<L>, src: *const u8) -> Result<()>
    where
        L: HasFeature<FCopyConstruct>,
    {
        let (slot, _) = self.inner.tail.begin_put(
            rtype.layout(),
            rtype,
            |dst, (rt, src): (RuntimeType<L>, *const u8)| unsafe { rt.copy_construct(dst, src) },
            (rtype, src),
            ProgressGuarantee::Blocking,
        )?;
        self.inner.tail.commit_slot(slot);
        Ok(())
    }

    /// Append the erased value at `src`, leaving `src` moved-from.
    ///
    /// # Safety
    ///
    /// `src` must point to a live value of the type `rtype` describes,
    /// that type must be `Send`, and the caller must not use the
    /// value afterwards except to free its storage.
    pub unsafe fn dyn_push_move(&self, rtype: RuntimeType<L>, src: *mut u8) -> Result<()>
    where
        L: HasFeature<FMoveConstruct>,
    {
        let (slot, _) = self.inner.tail.begin_put(
            rtype.layout(),
            rtype,
            |dst, (rt, src): (RuntimeType<L>, *mut u8)| unsafe { rt.move_construct(dst, src) },
            (rtype, src),
            ProgressGuarantee::Blocking,
        )?;
        self.inner.tail.commit_slot(slot);
        Ok(())
    }

    // -- consumers ---------------------------------------------------------

    /// Begin consuming the oldest observable element. Dropping the
    /// returned handle releases the claim so another consumer can
    /// take the element.
    pub fn try_start_consume(&self) -> Option<ConsumeOperation<'_, L, A, P, C, M>> {
        let slot = self.inner.start_consume()?;
        Some(ConsumeOperation {
            queue: self,
            slot,
            done: false,
        })
    }

    /// Consume and destroy the oldest observable element. Returns
    /// whether an element was consumed.
    pub fn try_consume(&self) -> bool {
        match self.inner.start_consume() {
            Some(slot) => {
                self.inner.finish_consume(slot, true);
                true
            }
            None => false,
        }
    }

    /// Whether no committed element was observable. Advisory: under
    /// concurrency the answer may be stale by the time it returns.
    #[must_use]
    pub fn empty(&self) -> bool {
        match self.inner.start_consume() {
            Some(slot) => {
                self.inner.cancel_consume(slot);
                false
            }
            None => true,
        }
    }

    /// Consume and destroy every observable element.
    pub fn clear(&self) {
        while self.try_consume() {}
    }
}

impl<L, A, P, C, M> Drop for LfQueue<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

/// An in-progress put on an [`LfQueue`]. The slot is reserved and
/// BUSY; other threads proceed around it. `commit` publishes,
/// `cancel` or drop tombstones.
pub struct PutTransaction<'a, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    queue: &'a LfQueue<L, A, P, C, M>,
    slot: *mut u8,
    element: *mut u8,
    done: bool,
}

impl<L, A, P, C, M> PutTransaction<'_, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    /// Address of the element under construction.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        self.element
    }

    /// The element, typed.
    ///
    /// # Panics
    ///
    /// In debug builds, if `T` is not the element's type.
    pub fn element<T: 'static>(&mut self) -> &mut T
    where
        L: HasFeature<FTypeId>,
    {
        debug_assert!(self.rtype().is::<T>(), "wrong element type");
        unsafe { &mut *self.element.cast::<T>() }
    }

    /// The runtime type of the element.
    #[must_use]
    pub fn rtype(&self) -> RuntimeType<L> {
        unsafe { crate::control::type_ptr::<L>(self.slot).read() }
    }

    /// Reserve extra bytes sharing the element's lifecycle.
    pub fn raw_allocate(&mut self, layout: Layout) -> Result<*mut u8> {
        self.queue.inner.tail.raw_allocate(layout)
    }

    /// Reserve and fill extra bytes with a copy of `src`. The copies
    /// are never dropped, hence the `Copy` bound.
    pub fn raw_allocate_copy<T: Copy>(&mut self, src: &[T]) -> Result<*mut T> {
        let layout = Layout::array::<T>(src.len()).map_err(|_| Error::OutOfMemory)?;
        let dst = self.raw_allocate(layout)?.cast::<T>();
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(dst)
    }

    /// Publish the element.
    pub fn commit(mut self) {
        self.queue.inner.tail.commit_slot(self.slot);
        self.done = true;
    }

    /// Tombstone the slot, destroying the element.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        unsafe {
            let rtype = crate::control::type_ptr::<L>(self.slot).read();
            rtype.destroy(self.element);
        }
        self.queue.inner.tail.cancel_slot(self.slot);
        self.done = true;
    }
}

impl<L, A, P, C, M> Drop for PutTransaction<'_, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    fn drop(&mut self) {
        if !self.done {
            self.cancel_in_place();
        }
    }
}

/// An in-progress consume on an [`LfQueue`]. Holds a pin on the
/// element's page for its whole lifetime.
pub struct ConsumeOperation<'a, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    queue: &'a LfQueue<L, A, P, C, M>,
    slot: *mut u8,
    done: bool,
}

impl<L, A, P, C, M> ConsumeOperation<'_, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    /// The runtime type of the element being consumed.
    #[must_use]
    pub fn complete_type(&self) -> RuntimeType<L> {
        self.queue.inner.slot_type(self.slot)
    }

    /// Address of the element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        self.queue.inner.slot_element(self.slot)
    }

    /// Address of the element's storage before alignment: the raw
    /// payload area for inline elements, the external block
    /// otherwise.
    #[must_use]
    pub fn unaligned_element_ptr(&self) -> *mut u8 {
        self.queue.inner.slot_storage(self.slot)
    }

    /// The element, typed.
    ///
    /// # Panics
    ///
    /// In debug builds, if `T` is not the element's type.
    pub fn element<T: 'static>(&self) -> &T
    where
        L: HasFeature<FTypeId>,
    {
        debug_assert!(self.complete_type().is::<T>(), "wrong element type");
        unsafe { &*self.element_ptr().cast::<T>() }
    }

    /// Destroy the element and retire the slot.
    pub fn commit(mut self) {
        self.queue.inner.finish_consume(self.slot, true);
        self.done = true;
    }

    /// Retire the slot without destroying the element; the caller has
    /// taken ownership of the value (for example by reading it out).
    pub fn commit_nodestroy(mut self) {
        self.queue.inner.finish_consume(self.slot, false);
        self.done = true;
    }

    /// Release the claim, restoring the element for any consumer.
    pub fn cancel(mut self) {
        self.queue.inner.cancel_consume(self.slot);
        self.done = true;
    }
}

impl<L, A, P, C, M> Drop for ConsumeOperation<'_, L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    fn drop(&mut self) {
        if !self.done {
            self.queue.inner.cancel_consume(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::testing::CountingAllocator;
    use crate::page_alloc::PageAllocator;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    type SmallLfQueue = LfQueue<DefaultFeatures, PageAllocator<4096>>;
    type CountedLfQueue = LfQueue<DefaultFeatures, CountingAllocator<4096>>;

    #[test]
    fn test_heterogeneous_sequence() {
        let queue = LfQueue::<DefaultFeatures>::new();
        queue.push(1i32).unwrap();
        queue.push(String::from("hello")).unwrap();
        queue.push(3.14f64).unwrap();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<i32>(), 1);
        op.commit();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.element::<String>(), "hello");
        op.commit();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<f64>(), 3.14);
        op.commit();
        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
    }

    #[test]
    fn test_cancelled_put_leaves_queue_empty() {
        let queue = LfQueue::<DefaultFeatures>::new();
        drop(queue.start_push(42i32).unwrap());
        assert!(queue.try_start_consume().is_none());
        assert!(queue.empty());
    }

    #[test]
    fn test_consume_cancel_restores_element() {
        let queue = LfQueue::<DefaultFeatures>::new();
        queue.push(9i32).unwrap();
        let op = queue.try_start_consume().unwrap();
        op.cancel();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<i32>(), 9);
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_commit_nodestroy() {
        let queue = LfQueue::<DefaultFeatures>::new();
        queue.push(String::from("taken")).unwrap();
        let op = queue.try_start_consume().unwrap();
        let value = unsafe { op.element_ptr().cast::<String>().read() };
        op.commit_nodestroy();
        assert_eq!(value, "taken");
        assert!(queue.empty());
    }

    #[test]
    fn test_page_overflow_and_reclamation() {
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let queue = CountedLfQueue::with_allocator(queue_alloc);

        let mut pushed = 0u64;
        while counters.page_allocs() < 2 {
            queue.push(0u8).unwrap();
            pushed += 1;
        }
        assert_eq!(counters.live_pages(), 2);

        let mut consumed = 0u64;
        let mut first_page_released_at = None;
        while queue.try_consume() {
            consumed += 1;
            if first_page_released_at.is_none() && counters.live_pages() == 1 {
                first_page_released_at = Some(consumed);
            }
        }
        assert_eq!(consumed, pushed);
        assert!(first_page_released_at.unwrap() < consumed);
        drop(queue);
        assert_eq!(counters.live_pages(), 0);
    }

    #[test]
    fn test_external_payload() {
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let queue = CountedLfQueue::with_allocator(queue_alloc);

        assert!(4096 > SmallLfQueue::inline_limit());
        queue.push([7u8; 4096]).unwrap();

        let op = queue.try_start_consume().unwrap();
        // The payload lives outside the page holding the control block.
        assert!(!PageAllocator::<4096>::same_page(op.slot, op.element_ptr()));
        assert_eq!(op.element::<[u8; 4096]>()[100], 7);
        op.commit();

        drop(queue);
        assert!(counters.balanced_blocks());
        assert_eq!(counters.live_pages(), 0);
    }

    #[test]
    fn test_constructor_panic_tombstones_slot() {
        let queue = LfQueue::<DefaultFeatures>::new();
        let mut made = 0u32;
        for n in 1..=5u32 {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                queue.emplace_with(|| {
                    if n == 3 {
                        panic!("third construction fails");
                    }
                    n
                })
            }));
            if outcome.is_ok() {
                made += 1;
            }
        }
        assert_eq!(made, 4);

        let mut seen = Vec::new();
        while let Some(op) = queue.try_start_consume() {
            seen.push(*op.element::<u32>());
            op.commit();
        }
        assert_eq!(seen, vec![1, 2, 4, 5]);
        assert!(queue.empty());
    }

    #[test]
    fn test_try_push_wait_free_refuses_page_switch() {
        let queue = SmallLfQueue::new();
        // 62 one-unit slots fill the page's payload region exactly.
        let usable_units =
            (4096 - crate::page_alloc::PAGE_HEADER_SIZE) / crate::lf_tail::UNIT - 1;
        for _ in 0..usable_units {
            assert_eq!(queue.try_push(ProgressGuarantee::WaitFree, 1u64), Ok(true));
        }
        // The next put needs a page switch, which wait-free refuses.
        assert_eq!(queue.try_push(ProgressGuarantee::WaitFree, 1u64), Ok(false));
        // A blocking put performs the switch.
        assert_eq!(queue.try_push(ProgressGuarantee::Blocking, 1u64), Ok(true));
        queue.clear();
        assert!(queue.empty());
    }

    #[test]
    fn test_mpmc_no_loss_no_duplication() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;

        let queue = SmallLfQueue::new();
        let consumed_count = AtomicU64::new(0);
        let consumed_sum = AtomicU64::new(0);
        let seen = StdMutex::new(HashSet::new());

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    let base = p * PER_PRODUCER;
                    for i in 0..PER_PRODUCER {
                        queue.push(base + i).unwrap();
                    }
                });
            }
            for _ in 0..4 {
                let queue = &queue;
                let consumed_count = &consumed_count;
                let consumed_sum = &consumed_sum;
                let seen = &seen;
                s.spawn(move || loop {
                    if consumed_count.load(Ordering::SeqCst) >= PRODUCERS * PER_PRODUCER {
                        break;
                    }
                    if let Some(op) = queue.try_start_consume() {
                        let value = *op.element::<u64>();
                        op.commit();
                        consumed_sum.fetch_add(value, Ordering::SeqCst);
                        assert!(seen.lock().unwrap().insert(value), "duplicate consume");
                        consumed_count.fetch_add(1, Ordering::SeqCst);
                    } else {
                        std::thread::yield_now();
                    }
                });
            }
        });

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed_count.load(Ordering::SeqCst), total);
        assert_eq!(consumed_sum.load(Ordering::SeqCst), (0..total).sum::<u64>());
        assert_eq!(seen.lock().unwrap().len(), total as usize);
        assert!(queue.empty());
    }

    #[test]
    fn test_relaxed_consistency_preserves_per_producer_order() {
        let queue = RelaxedLfQueue::<DefaultFeatures>::new();

        std::thread::scope(|s| {
            for p in 0..2u64 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 1..=5_000u64 {
                        queue.push((p, i)).unwrap();
                    }
                });
            }
            // A single consumer observes each producer's values in
            // that producer's order.
            let queue = &queue;
            s.spawn(move || {
                let mut last_seen = [0u64, 0u64];
                let mut remaining = 10_000u64;
                while remaining > 0 {
                    match queue.try_start_consume() {
                        Some(op) => {
                            let (p, i) = *op.element::<(u64, u64)>();
                            op.commit();
                            assert!(
                                last_seen[p as usize] < i,
                                "producer {p} reordered: {} before {i}",
                                last_seen[p as usize]
                            );
                            last_seen[p as usize] = i;
                            remaining -= 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            });
        });
        assert!(queue.empty());
    }

    #[test]
    fn test_spsc_alias() {
        let queue = SpscLfQueue::<DefaultFeatures>::new();
        std::thread::scope(|s| {
            let producer = &queue;
            s.spawn(move || {
                for i in 0..10_000u32 {
                    producer.push(i).unwrap();
                }
            });
            let consumer = &queue;
            s.spawn(move || {
                let mut expected = 0u32;
                while expected < 10_000 {
                    if let Some(op) = consumer.try_start_consume() {
                        assert_eq!(*op.element::<u32>(), expected);
                        op.commit();
                        expected += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
        });
        assert!(queue.empty());
    }

    #[test]
    fn test_clear_and_drop_run_destructors() {
        use std::sync::Arc;
        let tracker = Arc::new(());
        let queue = LfQueue::<DefaultFeatures>::new();
        for _ in 0..100 {
            queue.push(Arc::clone(&tracker)).unwrap();
        }
        assert_eq!(Arc::strong_count(&tracker), 101);
        queue.clear();
        assert_eq!(Arc::strong_count(&tracker), 1);

        for _ in 0..100 {
            queue.push(Arc::clone(&tracker)).unwrap();
        }
        drop(queue);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_raw_allocate() {
        let queue = LfQueue::<DefaultFeatures>::new();
        let mut t = queue.start_push(5u32).unwrap();
        let extra = t.raw_allocate_copy(&[9u64, 8, 7]).unwrap();
        unsafe {
            assert_eq!(*extra, 9);
            assert_eq!(*extra.add(2), 7);
        }
        t.commit();
        assert!(queue.try_consume());
        assert!(queue.empty());
    }

    #[test]
    fn test_dyn_pushes() {
        use crate::feature_list;
        use crate::runtime_type::{
            FAlign, FCopyConstruct, FDefaultConstruct, FDestroy, FMoveConstruct, FSize, FTypeId,
        };

        feature_list! {
            struct DynFeatures: FSize, FAlign, FTypeId, FDestroy,
                FMoveConstruct, FCopyConstruct, FDefaultConstruct;
        }

        let queue = LfQueue::<DynFeatures>::new();
        let rtype = RuntimeType::<DynFeatures>::make::<u32>();
        queue.dyn_push(rtype).unwrap();
        let src = 31u32;
        unsafe {
            queue
                .dyn_push_copy(rtype, (&src as *const u32).cast())
                .unwrap();
        }

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u32>(), 0);
        op.commit();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u32>(), 31);
        op.commit();
        assert!(queue.empty());
    }
}
