//! Spin-locking heterogeneous FIFO queue.
//!
//! The lock-based variant for short critical sections: identical in
//! shape to [`MutexQueue`](crate::MutexQueue) but guarded by the
//! crate's test-and-test-and-set [`SpinLock`], which is cheaper than a
//! mutex when contention windows are a handful of pointer updates and
//! threads are not oversubscribed.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::control::{control, element_of, element_offset, external_ptr, type_ptr, SlotFlags};
use crate::error::Result;
use crate::heter_queue::{cancel_claim, commit_slot, tombstone_slot, HeterQueue};
use crate::page_alloc::{DefaultAllocator, PagedAllocator};
use crate::progress::ProgressGuarantee;
use crate::runtime_type::{
    DefaultFeatures, FCopyConstruct, FDefaultConstruct, FMoveConstruct, FTypeId, HasFeature,
    ListOf, QueueFeatures, RuntimeType,
};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// Heterogeneous FIFO queue protected by a spinlock.
pub struct SpinQueue<L: QueueFeatures = DefaultFeatures, A: PagedAllocator = DefaultAllocator> {
    inner: SpinLock<HeterQueue<L, A>>,
}

// Elements can only enter through `T: Send` bounds (or unsafe dyn
// puts), so moving or sharing the queue across threads is sound.
unsafe impl<L: QueueFeatures, A: PagedAllocator + Send> Send for SpinQueue<L, A> {}
unsafe impl<L: QueueFeatures, A: PagedAllocator + Send> Sync for SpinQueue<L, A> {}

impl<L: QueueFeatures, A: PagedAllocator> Default for SpinQueue<L, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: QueueFeatures, A: PagedAllocator> SpinQueue<L, A> {
    /// Create an empty queue with a default allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }

    /// Create an empty queue over the given allocator.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            inner: SpinLock::new(HeterQueue::with_allocator(alloc)),
        }
    }

    /// Largest payload size stored inline; see
    /// [`HeterQueue::inline_limit`].
    #[must_use]
    pub fn inline_limit() -> usize {
        HeterQueue::<L, A>::inline_limit()
    }

    /// Append a value, committing immediately.
    pub fn push<T>(&self, value: T) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
    {
        self.inner.lock().push(value)
    }

    /// Append the value produced by `f`, committing immediately. A
    /// panic in `f` tombstones the slot and resumes.
    pub fn emplace_with<T, F>(&self, f: F) -> Result<()>
    where
        L: ListOf<T>,
        T: Send,
        F: FnOnce() -> T,
    {
        self.inner.lock().emplace_with(f)
    }

    /// Append a value if the guarantee's constraints allow it now.
    /// Any guarantee other than [`ProgressGuarantee::Blocking`]
    /// refuses to spin on the lock: `Ok(false)` means it was
    /// contended.
    pub fn try_push<T>(&self, guarantee: ProgressGuarantee, value: T) -> Result<bool>
    where
        L: ListOf<T>,
        T: Send,
    {
        if guarantee == ProgressGuarantee::Blocking {
            self.inner.lock().push(value)?;
            return Ok(true);
        }
        match self.inner.try_lock() {
            Some(mut queue) => {
                queue.push(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Begin a put transaction. The lock stays held until the
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
        let mut guard = self.inner.lock();
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
        self.inner.lock().dyn_push(rtype)
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
        unsafe { self.inner.lock().dyn_push_copy(rtype, src) }
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
        unsafe { self.inner.lock().dyn_push_move(rtype, src) }
    }

    /// Begin consuming the oldest element, if any. The lock stays
    /// held until the handle is resolved.
    pub fn try_start_consume(&self) -> Option<ConsumeOperation<'_, L, A>> {
        let mut guard = self.inner.lock();
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
        self.inner.lock().try_consume()
    }

    /// Whether no committed element is waiting. Advisory under
    /// concurrency.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.inner.lock().empty()
    }

    /// Consume and destroy every element present.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// An in-progress put on a [`SpinQueue`]; owns the lock.
pub struct PutTransaction<'a, L: QueueFeatures, A: PagedAllocator> {
    guard: SpinLockGuard<'a, HeterQueue<L, A>>,
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

/// An in-progress consume on a [`SpinQueue`]; owns the lock.
pub struct ConsumeOperation<'a, L: QueueFeatures, A: PagedAllocator> {
    guard: SpinLockGuard<'a, HeterQueue<L, A>>,
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
