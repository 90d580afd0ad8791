//! Mutex-protected heterogeneous FIFO queue.
//!
//! Shares the single-threaded core's layout and lifecycle; a single
//! mutex protects head, tail and all control words, and is held for
//! the whole duration of a put or consume transaction — the
//! transaction handles own the guard.

use core::alloc::Layout;
use core::ptr;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::heter_queue::{cancel_claim, commit_slot, tombstone_slot, HeterQueue};
use crate::page_alloc::{DefaultAllocator, PagedAllocator};
use crate::progress::ProgressGuarantee;
use crate::runtime_type::{
    DefaultFeatures, FCopyConstruct, FDefaultConstruct, FMoveConstruct, FTypeId, HasFeature,
    ListOf, QueueFeatures, RuntimeType,
};
use crate::control::{control, element_of, element_offset, external_ptr, type_ptr, SlotFlags};
use core::sync::atomic::Ordering;

/// Heterogeneous FIFO queue protected by a mutex.
///
/// All operations take `&self`; any number of producer and consumer
/// threads may share the queue. Elements must be `Send`.
pub struct MutexQueue<L: QueueFeatures = DefaultFeatures, A: PagedAllocator = DefaultAllocator> {
    inner: Mutex<HeterQueue<L, A>>,
}

// Elements can only enter through `T: Send` bounds (or unsafe dyn
// puts), so moving or sharing the queue across threads is sound.
unsafe impl<L: QueueFeatures, A: PagedAllocator + Send> Send for MutexQueue<L, A> {}
unsafe impl<L: QueueFeatures, A: PagedAllocator + Send> Sync for MutexQueue<L, A> {}

impl<L: QueueFeatures, A: PagedAllocator> Default for MutexQueue<L, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: QueueFeatures, A: PagedAllocator> MutexQueue<L, A> {
    /// Create an empty queue with a default allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }

    /// Create an empty queue over the given allocator.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            inner: Mutex::new(HeterQueue::with_allocator(alloc)),
        }
    }

    /// Largest payload size stored inline; see
    /// [`HeterQueue::inline_limit`].
    #[must_use]
    pub fn inline_limit() -> usize {
        HeterQueue::<L, A>::inline_limit()
    }

    fn lock(&self) -> MutexGuard<'_, HeterQueue<L, A>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a value, committing immediately.
    pub fn push<T>(&self, value: T) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
    {
        self.lock().push(value)
    }

    /// Append the value produced by `f`, committing immediately. A
    /// panic in `f` tombstones the slot and resumes.
    pub fn emplace_with<T, F>(&self, f: F) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
        F: FnOnce() -> T,
    {
        self.lock().emplace_with(f)
    }

    /// Append a value if the guarantee's constraints allow it now.
    /// Any guarantee other than [`ProgressGuarantee::Blocking`]
    /// refuses to wait for the mutex: `Ok(false)` means the lock was
    /// contended.
    pub fn try_push<T>(&self, guarantee: ProgressGuarantee, value: T) -> Result<bool>
    where
        L: ListOf<T>,
        T: Send,
    {
        if guarantee == ProgressGuarantee::Blocking {
            self.lock().push(value)?;
            return Ok(true);
        }
        match self.inner.try_lock() {
            Ok(mut queue) => {
                queue.push(value)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Begin a put transaction. The mutex stays locked until the
    /// transaction is committed, cancelled or dropped.
    pub fn start_push<T>(&self, value: T) -> Result<PutTransaction<'_, L, A>>
    where
        L: ListOf<T>,
        T: Send,
    {
        self.start_emplace_with(move || value)
    }

    /// Begin a put transaction whose element is produced by `f`.
    pub fn start_emplace_with<T, F>(&self, f: F) -> Result<PutTransaction<'_, L, A>>
    where
        L: ListOf<T>,
        T: Send,
        F: FnOnce() -> T,
    {
        let mut guard = self.lock();
        let rtype = RuntimeType::<L>::make::<T>();
        let (slot, element) = guard.begin_put(
            Layout::new::<T>(),
            rtype,
            |dst, f| unsafe { ptr::write(dst.cast::<T>(), f()) },
            f,
        )?;
        Ok(PutTransaction {
            guard,
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
        self.lock().dyn_push(rtype)
    }

    /// Append a copy of the erased value at `src`.
    ///
    /// # Safety
    ///
    /// As [`HeterQueue::dyn_push_copy`]; additionally the value must
    /// be of a `Send` type.
    pub unsafe fn dyn_push_copy(&self, rtype: RuntimeType<L>, src: *const u8) -> Result<()>
    where
        L: HasFeature<FCopyConstruct>,
    {
        unsafe { self.lock().dyn_push_copy(rtype, src) }
    }

    /// Append the erased value at `src`, leaving it moved-from.
    ///
    /// # Safety
    ///
    /// As [`HeterQueue::dyn_push_move`]; additionally the value must
    /// be of a `Send` type.
    pub unsafe fn dyn_push_move(&self, rtype: RuntimeType<L>, src: *mut u8) -> Result<()>
    where
        L: HasFeature<FMoveConstruct>,
    {
        unsafe { self.lock().dyn_push_move(rtype, src) }
    }

    /// Begin consuming the oldest element, if any. The mutex stays
    /// locked until the handle is resolved.
    pub fn try_start_consume(&self) -> Option<ConsumeOperation<'_, L, A>> {
        let mut guard = self.lock();
        let slot = guard.claim_consume()?;
        Some(ConsumeOperation {
            guard,
            slot,
            done: false,
        })
    }

    /// Consume and destroy the oldest element. Returns whether an
    /// element was consumed.
    pub fn try_consume(&self) -> bool {
        self.lock().try_consume()
    }

    /// Whether no committed element is waiting. Advisory under
    /// concurrency.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.lock().empty()
    }

    /// Consume and destroy every element present.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// An in-progress put on a [`MutexQueue`]; owns the lock.
pub struct PutTransaction<'a, L: QueueFeatures, A: PagedAllocator> {
    guard: MutexGuard<'a, HeterQueue<L, A>>,
    slot: *mut u8,
    element: *mut u8,
    done: bool,
}

impl<L: QueueFeatures, A: PagedAllocator> PutTransaction<'_, L, A> {
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
        unsafe { type_ptr::<L>(self.slot).read() }
    }

    /// Reserve extra bytes sharing the element's lifecycle.
    pub fn raw_allocate(&mut self, layout: Layout) -> Result<*mut u8> {
        self.guard.raw_allocate_in(layout)
    }

    /// Reserve and fill extra bytes with a copy of `src`.
    pub fn raw_allocate_copy<T: Copy>(&mut self, src: &[T]) -> Result<*mut T> {
        let layout = Layout::array::<T>(src.len()).map_err(|_| crate::Error::OutOfMemory)?;
        let dst = self.raw_allocate(layout)?.cast::<T>();
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(dst)
    }

    /// Publish the element and release the lock.
    pub fn commit(mut self) {
        unsafe { commit_slot(self.slot) };
        self.done = true;
    }

    /// Tombstone the slot, destroying the element, and release the
    /// lock.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        unsafe {
            let rtype = type_ptr::<L>(self.slot).read();
            rtype.destroy(self.element);
            tombstone_slot(self.slot);
        }
        self.done = true;
    }
}

impl<L: QueueFeatures, A: PagedAllocator> Drop for PutTransaction<'_, L, A> {
    fn drop(&mut self) {
        if !self.done {
            self.cancel_in_place();
        }
    }
}

/// An in-progress consume on a [`MutexQueue`]; owns the lock.
pub struct ConsumeOperation<'a, L: QueueFeatures, A: PagedAllocator> {
    guard: MutexGuard<'a, HeterQueue<L, A>>,
    slot: *mut u8,
    done: bool,
}

impl<L: QueueFeatures, A: PagedAllocator> ConsumeOperation<'_, L, A> {
    /// The runtime type of the element being consumed.
    #[must_use]
    pub fn complete_type(&self) -> RuntimeType<L> {
        unsafe { type_ptr::<L>(self.slot).read() }
    }

    /// Address of the element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        let word = unsafe { control(self.slot).next.load(Ordering::Relaxed) };
        unsafe { element_of::<L>(self.slot, word, self.complete_type().alignment()) }
    }

    /// Address of the element's storage before alignment.
    #[must_use]
    pub fn unaligned_element_ptr(&self) -> *mut u8 {
        let word = unsafe { control(self.slot).next.load(Ordering::Relaxed) };
        if word & SlotFlags::EXTERNAL.bits() != 0 {
            unsafe { (*external_ptr::<L>(self.slot)).block }
        } else {
            self.slot.wrapping_add(element_offset::<L>())
        }
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

    /// Destroy the element, retire the slot and release the lock.
    pub fn commit(mut self) {
        let slot = self.slot;
        self.guard.finish_consume(slot, true);
        self.done = true;
    }

    /// Retire the slot without destroying the element and release the
    /// lock.
    pub fn commit_nodestroy(mut self) {
        let slot = self.slot;
        self.guard.finish_consume(slot, false);
        self.done = true;
    }

    /// Release the claim, restoring the element, and release the
    /// lock.
    pub fn cancel(mut self) {
        unsafe { cancel_claim(self.slot) };
        self.done = true;
    }
}

impl<L: QueueFeatures, A: PagedAllocator> Drop for ConsumeOperation<'_, L, A> {
    fn drop(&mut self) {
        if !self.done {
            unsafe { cancel_claim(self.slot) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_basic_roundtrip() {
        let queue = MutexQueue::<DefaultFeatures>::new();
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
    }

    #[test]
    fn test_transaction_holds_lock() {
        let queue = MutexQueue::<DefaultFeatures>::new();
        let t = queue.start_push(1u32).unwrap();
        // A non-blocking push must observe the held lock.
        assert_eq!(
            queue.try_push(ProgressGuarantee::LockFree, 2u32),
            Ok(false)
        );
        t.commit();
        assert_eq!(queue.try_push(ProgressGuarantee::LockFree, 2u32), Ok(true));
        assert!(queue.try_consume());
        assert!(queue.try_consume());
        assert!(!queue.try_consume());
    }

    #[test]
    fn test_cancelled_put_is_invisible() {
        let queue = MutexQueue::<DefaultFeatures>::new();
        drop(queue.start_push(42i32).unwrap());
        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
    }

    #[test]
    fn test_producers_and_consumers() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2_000;

        let queue = MutexQueue::<DefaultFeatures>::new();
        let consumed_sum = AtomicU64::new(0);
        let consumed_count = AtomicU64::new(0);

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
                let consumed_sum = &consumed_sum;
                let consumed_count = &consumed_count;
                s.spawn(move || loop {
                    if consumed_count.load(Ordering::SeqCst) >= PRODUCERS * PER_PRODUCER {
                        break;
                    }
                    if let Some(op) = queue.try_start_consume() {
                        consumed_sum.fetch_add(*op.element::<u64>(), Ordering::SeqCst);
                        op.commit();
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
        assert!(queue.empty());
    }
}
