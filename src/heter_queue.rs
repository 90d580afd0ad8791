//! Single-threaded heterogeneous FIFO queue.
//!
//! The baseline variant: same page layout, control words and element
//! lifecycle as the concurrent queues, but every operation takes
//! `&mut self`, so the control words are accessed with relaxed atomics
//! that compile to plain loads and stores. The BUSY/DEAD bits are
//! still maintained — transactions rely on them — they just cost no
//! synchronization.
//!
//! Values of different types go in, tightly packed, in FIFO order:
//!
//! ```
//! use hetq::HeterQueue;
//!
//! let mut queue = HeterQueue::new();
//! queue.push(42i32).unwrap();
//! queue.push(String::from("hello")).unwrap();
//!
//! let consume = queue.try_start_consume().unwrap();
//! assert_eq!(*consume.element::<i32>(), 42);
//! consume.commit();
//! ```

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::control::{
    control, element_of, element_offset, end_control, external_ptr, first_slot, max_inline_size,
    max_inline_units, payload_ptr, required_units, type_ptr, ExternalBlock, SlotFlags,
    COMPACT_UNIT, FLAGS_MASK,
};
use crate::error::Result;
use crate::page_alloc::{DefaultAllocator, PagedAllocator};
use crate::progress::ProgressGuarantee;
use crate::runtime_type::{
    DefaultFeatures, FCopyConstruct, FDefaultConstruct, FMoveConstruct, FTypeId, HasFeature,
    ListOf, QueueFeatures, RuntimeType,
};

const UNIT: usize = COMPACT_UNIT;

/// Single-threaded heterogeneous FIFO queue.
///
/// `L` is the feature list of the element descriptors, `A` the page
/// allocator. The first page is allocated on first use.
pub struct HeterQueue<L: QueueFeatures = DefaultFeatures, A: PagedAllocator = DefaultAllocator> {
    /// Next slot a consumer will consider.
    head: *mut u8,
    /// Next allocation address inside the tail page.
    tail: *mut u8,
    alloc: A,
    _features: PhantomData<L>,
}

impl<L: QueueFeatures, A: PagedAllocator> Default for HeterQueue<L, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: QueueFeatures, A: PagedAllocator> HeterQueue<L, A> {
    /// Create an empty queue with a default allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }

    /// Create an empty queue over the given allocator.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            alloc,
            _features: PhantomData,
        }
    }

    /// Largest payload size (at minimal alignment) stored inside a
    /// page; anything bigger goes through the external allocator.
    #[must_use]
    pub fn inline_limit() -> usize {
        max_inline_size::<L>(A::PAGE_SIZE, UNIT)
    }

    // -- producer ----------------------------------------------------------

    /// Append a value, committing immediately.
    pub fn push<T>(&mut self, value: T) -> Result<()>
    where
        L: ListOf<T>,
    {
        self.start_push(value)?.commit();
        Ok(())
    }

    /// Append the value produced by `f`, committing immediately.
    ///
    /// If `f` panics the slot is tombstoned and the panic resumes; the
    /// queue stays consistent.
    pub fn emplace_with<T, F>(&mut self, f: F) -> Result<()>
    where
        L: ListOf<T>,
        F: FnOnce() -> T,
    {
        self.start_emplace_with(f)?.commit();
        Ok(())
    }

    /// Append a value under the given progress guarantee. With a
    /// single thread there is no contention to wait on, so every
    /// guarantee is met and the value is always accepted (barring
    /// allocation failure).
    pub fn try_push<T>(&mut self, _guarantee: ProgressGuarantee, value: T) -> Result<bool>
    where
        L: ListOf<T>,
    {
        self.push(value)?;
        Ok(true)
    }

    /// Begin a put transaction holding `value`. The element becomes
    /// observable only on [`PutTransaction::commit`]; dropping the
    /// transaction cancels it.
    pub fn start_push<T>(&mut self, value: T) -> Result<PutTransaction<'_, L, A>>
    where
        L: ListOf<T>,
    {
        self.start_emplace_with(move || value)
    }

    /// Begin a put transaction whose element is produced by `f`.
    pub fn start_emplace_with<T, F>(&mut self, f: F) -> Result<PutTransaction<'_, L, A>>
    where
        L: ListOf<T>,
        F: FnOnce() -> T,
    {
        let rtype = RuntimeType::<L>::make::<T>();
        let (slot, element) = self.begin_put(
            Layout::new::<T>(),
            rtype,
            |dst, f| unsafe { ptr::write(dst.cast::<T>(), f()) },
            f,
        )?;
        Ok(PutTransaction {
            queue: self,
            slot,
            element,
        })
    }

    /// Append a default-constructed element of a runtime type.
    pub fn dyn_push(&mut self, rtype: RuntimeType<L>) -> Result<()>
    where
        L: HasFeature<FDefaultConstruct>,
    {
        let (slot, _) = self.begin_put(
            rtype.layout(),
            rtype,
            |dst, rt: RuntimeType<L>| unsafe { rt.default_construct(dst) },
            rtype,
        )?;
        unsafe { commit_slot(slot) };
        Ok(())
    }

    /// Append a copy of the erased value at `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a live value of the type `rtype` describes.
    pub unsafe fn dyn_push_copy(&mut self, rtype: RuntimeType<L>, src: *const u8) -> Result<()>
    where
        L: HasFeature<FCopyConstruct>,
    {
        let (slot, _) = self.begin_put(
            rtype.layout(),
            rtype,
            |dst, (rt, src): (RuntimeType<L>, *const u8)| unsafe { rt.copy_construct(dst, src) },
            (rtype, src),
        )?;
        unsafe { commit_slot(slot) };
        Ok(())
    }

    /// Append the erased value at `src`, leaving `src` moved-from.
    ///
    /// # Safety
    ///
    /// `src` must point to a live value of the type `rtype` describes;
    /// the caller must not use it afterwards except to free its
    /// storage.
    pub unsafe fn dyn_push_move(&mut self, rtype: RuntimeType<L>, src: *mut u8) -> Result<()>
    where
        L: HasFeature<FMoveConstruct>,
    {
        let (slot, _) = self.begin_put(
            rtype.layout(),
            rtype,
            |dst, (rt, src): (RuntimeType<L>, *mut u8)| unsafe { rt.move_construct(dst, src) },
            (rtype, src),
        )?;
        unsafe { commit_slot(slot) };
        Ok(())
    }

    /// Allocate a slot, store the runtime type and construct the
    /// payload with `construct`. On success the slot is BUSY and
    /// unpublished; on panic inside `construct` it is tombstoned.
    /// Returns the slot and element addresses. Shared with the
    /// lock-wrapped variants.
    pub(crate) fn begin_put<C>(
        &mut self,
        layout: Layout,
        rtype: RuntimeType<L>,
        construct: impl FnOnce(*mut u8, C),
        ctx: C,
    ) -> Result<(*mut u8, *mut u8)> {
        let units = required_units::<L>(layout.size(), layout.align(), UNIT);
        if units <= max_inline_units(A::PAGE_SIZE, UNIT) {
            let slot = self.alloc_slot(units, SlotFlags::BUSY)?;
            unsafe { type_ptr::<L>(slot).write(rtype) };
            let element = payload_ptr::<L>(slot, layout.align());
            let guard = Tombstone { slot };
            construct(element, ctx);
            mem::forget(guard);
            Ok((slot, element))
        } else {
            let record_units = required_units::<L>(
                mem::size_of::<ExternalBlock>(),
                mem::align_of::<ExternalBlock>(),
                UNIT,
            );
            let slot = self.alloc_slot(record_units, SlotFlags::BUSY | SlotFlags::EXTERNAL)?;
            unsafe { type_ptr::<L>(slot).write(rtype) };
            let block = match self.alloc.allocate(layout) {
                Ok(block) => block.as_ptr(),
                Err(e) => {
                    unsafe { tombstone_slot(slot) };
                    return Err(e);
                }
            };
            unsafe {
                external_ptr::<L>(slot).write(ExternalBlock {
                    block,
                    size: layout.size(),
                    align: layout.align(),
                });
            }
            let guard = Tombstone { slot };
            construct(block, ctx);
            mem::forget(guard);
            Ok((slot, block))
        }
    }

    /// Bump-allocate `units` units, switching pages when the current
    /// one is exhausted. The slot's control word is initialized to the
    /// following slot plus `flags`.
    fn alloc_slot(&mut self, units: usize, flags: SlotFlags) -> Result<*mut u8> {
        debug_assert!(units <= max_inline_units(A::PAGE_SIZE, UNIT));
        if self.tail.is_null() {
            let first = first_slot(self.init_page()?);
            self.head = first;
            self.tail = first;
        }
        loop {
            let page = A::page_base(self.tail);
            let end = end_control(page, A::PAGE_SIZE, UNIT);
            let new_tail = self.tail.wrapping_add(units * UNIT);
            if new_tail <= end {
                let slot = self.tail;
                self.tail = new_tail;
                unsafe {
                    control(slot)
                        .next
                        .store(new_tail as usize | flags.bits(), Ordering::Relaxed);
                }
                return Ok(slot);
            }
            // Pad the remainder of the page with a tombstone, then
            // link a fresh page through the sentinel.
            if self.tail != end {
                unsafe {
                    control(self.tail)
                        .next
                        .store(end as usize | SlotFlags::DEAD.bits(), Ordering::Relaxed);
                }
                self.tail = end;
            }
            let new_page = self.init_page()?;
            let next = first_slot(new_page);
            unsafe {
                control(end)
                    .next
                    .store(next as usize | SlotFlags::DEAD.bits(), Ordering::Relaxed);
            }
            self.tail = next;
        }
    }

    /// Allocate a page and mark its sentinel "no successor".
    fn init_page(&mut self) -> Result<*mut u8> {
        let page = self.alloc.allocate_page_zeroed()?.as_ptr();
        unsafe {
            control(end_control(page, A::PAGE_SIZE, UNIT))
                .next
                .store(SlotFlags::NEXT_PAGE_INVALID.bits(), Ordering::Relaxed);
        }
        Ok(page)
    }

    // -- consumer ----------------------------------------------------------

    /// Begin consuming the oldest element, if any. Dropping the
    /// returned handle releases the element back to the queue.
    pub fn try_start_consume(&mut self) -> Option<ConsumeOperation<'_, L, A>> {
        let slot = self.claim_consume()?;
        Some(ConsumeOperation { queue: self, slot })
    }

    /// Claim the oldest live slot: advance past tombstones, mark it
    /// BUSY and return it. Shared with the lock-wrapped variants.
    pub(crate) fn claim_consume(&mut self) -> Option<*mut u8> {
        self.advance_head();
        if self.head.is_null() || self.head == self.tail {
            return None;
        }
        let word = unsafe { control(self.head).next.load(Ordering::Relaxed) };
        debug_assert_eq!(word & (SlotFlags::BUSY | SlotFlags::DEAD).bits(), 0);
        unsafe {
            control(self.head)
                .next
                .store(word | SlotFlags::BUSY.bits(), Ordering::Relaxed);
        }
        Some(self.head)
    }

    /// Retire a claimed slot, optionally destroying the element, then
    /// advance the head. Shared with the lock-wrapped variants.
    pub(crate) fn finish_consume(&mut self, slot: *mut u8, destroy: bool) {
        unsafe {
            if destroy {
                let rtype = type_ptr::<L>(slot).read();
                let word = control(slot).next.load(Ordering::Relaxed);
                rtype.destroy(element_of::<L>(slot, word, rtype.alignment()));
            }
            tombstone_slot(slot);
        }
        self.advance_head();
    }

    /// Reserve extra bytes tied to the current tail position; see
    /// [`PutTransaction::raw_allocate`].
    pub(crate) fn raw_allocate_in(&mut self, layout: Layout) -> Result<*mut u8> {
        let units = required_units::<L>(layout.size(), layout.align(), UNIT);
        if units <= max_inline_units(A::PAGE_SIZE, UNIT) {
            let slot = self.alloc_slot(units, SlotFlags::DEAD)?;
            Ok(payload_ptr::<L>(slot, layout.align()))
        } else {
            let record_units = required_units::<L>(
                mem::size_of::<ExternalBlock>(),
                mem::align_of::<ExternalBlock>(),
                UNIT,
            );
            let slot = self.alloc_slot(record_units, SlotFlags::DEAD | SlotFlags::EXTERNAL)?;
            let block = self.alloc.allocate(layout)?.as_ptr();
            unsafe {
                external_ptr::<L>(slot).write(ExternalBlock {
                    block,
                    size: layout.size(),
                    align: layout.align(),
                });
            }
            Ok(block)
        }
    }

    /// Consume and destroy the oldest element. Returns whether an
    /// element was consumed.
    pub fn try_consume(&mut self) -> bool {
        match self.try_start_consume() {
            Some(op) => {
                op.commit();
                true
            }
            None => false,
        }
    }

    /// Whether no committed element is waiting.
    #[must_use]
    pub fn empty(&self) -> bool {
        if self.head.is_null() {
            return true;
        }
        let mut slot = self.head;
        loop {
            if slot == self.tail {
                return true;
            }
            let word = unsafe { control(slot).next.load(Ordering::Relaxed) };
            let flags = SlotFlags::from_bits_truncate(word & FLAGS_MASK);
            if flags.contains(SlotFlags::NEXT_PAGE_INVALID) {
                return true;
            }
            if !flags.intersects(SlotFlags::BUSY | SlotFlags::DEAD) {
                return false;
            }
            slot = (word & !FLAGS_MASK) as *mut u8;
        }
    }

    /// Consume and destroy every element.
    pub fn clear(&mut self) {
        while self.try_consume() {}
    }

    /// Skip the head past dead slots, zeroing them, releasing external
    /// tombstone payloads and returning drained pages to the
    /// allocator.
    fn advance_head(&mut self) {
        loop {
            if self.head.is_null() || self.head == self.tail {
                return;
            }
            let word = unsafe { control(self.head).next.load(Ordering::Relaxed) };
            let flags = SlotFlags::from_bits_truncate(word & FLAGS_MASK);
            let next = (word & !FLAGS_MASK) as *mut u8;
            if !flags.contains(SlotFlags::DEAD) {
                // Live element (or, transiently, a slot under
                // consumption): the head stays here.
                return;
            }
            let page = A::page_base(self.head);
            if self.head == end_control(page, A::PAGE_SIZE, UNIT) {
                if flags.contains(SlotFlags::NEXT_PAGE_INVALID) {
                    return;
                }
                // Crossing into the successor page: the old one is
                // fully drained. Zero its sentinel and give it back.
                unsafe {
                    ptr::write_bytes(self.head, 0, UNIT);
                    if self.alloc.unpin_page(page) == 1 {
                        self.alloc.deallocate_page_zeroed(page);
                    }
                }
                self.head = next;
            } else {
                if flags.contains(SlotFlags::EXTERNAL) {
                    unsafe { release_external::<L, A>(&self.alloc, self.head) };
                }
                unsafe {
                    ptr::write_bytes(self.head, 0, next as usize - self.head as usize);
                }
                self.head = next;
            }
        }
    }
}

impl<L: QueueFeatures, A: PagedAllocator> Drop for HeterQueue<L, A> {
    fn drop(&mut self) {
        self.clear();
        if self.tail.is_null() {
            return;
        }
        // After clear() the head caught up with the tail and every
        // earlier page has been returned; only the tail page remains.
        let page = A::page_base(self.tail);
        debug_assert!(A::same_page(self.head, self.tail));
        unsafe {
            ptr::write_bytes(end_control(page, A::PAGE_SIZE, UNIT), 0, UNIT);
            if self.alloc.unpin_page(page) == 1 {
                self.alloc.deallocate_page_zeroed(page);
            }
        }
    }
}

/// Publish a BUSY slot: clear BUSY, leaving the bare next pointer.
pub(crate) unsafe fn commit_slot(slot: *mut u8) {
    let word = unsafe { control(slot).next.load(Ordering::Relaxed) };
    debug_assert_eq!(
        word & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
        SlotFlags::BUSY.bits()
    );
    unsafe {
        control(slot)
            .next
            .store(word & !SlotFlags::BUSY.bits(), Ordering::Relaxed);
    }
}

/// Tombstone a BUSY slot: clear BUSY, set DEAD.
pub(crate) unsafe fn tombstone_slot(slot: *mut u8) {
    let word = unsafe { control(slot).next.load(Ordering::Relaxed) };
    debug_assert_eq!(
        word & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
        SlotFlags::BUSY.bits()
    );
    unsafe {
        control(slot)
            .next
            .store(
                (word & !SlotFlags::BUSY.bits()) | SlotFlags::DEAD.bits(),
                Ordering::Relaxed,
            );
    }
}

/// Free the external payload block recorded in `slot`.
pub(crate) unsafe fn release_external<L: QueueFeatures, A: PagedAllocator>(
    alloc: &A,
    slot: *mut u8,
) {
    unsafe {
        let record = external_ptr::<L>(slot).read();
        let layout = Layout::from_size_align_unchecked(record.size, record.align);
        alloc.deallocate(record.block, layout);
    }
}

/// Cancels a BUSY slot if the payload constructor unwinds.
struct Tombstone {
    slot: *mut u8,
}

impl Drop for Tombstone {
    fn drop(&mut self) {
        unsafe { tombstone_slot(self.slot) };
    }
}

// ---------------------------------------------------------------------------
// Transaction handles
// ---------------------------------------------------------------------------

/// An in-progress put on a [`HeterQueue`]. The element exists but is
/// not yet observable; `commit` publishes it, `cancel` or drop
/// tombstones it.
pub struct PutTransaction<'a, L: QueueFeatures, A: PagedAllocator> {
    queue: &'a mut HeterQueue<L, A>,
    slot: *mut u8,
    element: *mut u8,
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

    /// Reserve extra bytes sharing the element's lifecycle: the block
    /// is reclaimed when the surrounding storage is, after the element
    /// is consumed.
    pub fn raw_allocate(&mut self, layout: Layout) -> Result<*mut u8> {
        self.queue.raw_allocate_in(layout)
    }

    /// Reserve and fill extra bytes with a copy of `src`. The copies
    /// are never dropped, hence the `Copy` bound.
    pub fn raw_allocate_copy<T: Copy>(&mut self, src: &[T]) -> Result<*mut T> {
        let layout = Layout::array::<T>(src.len()).map_err(|_| crate::Error::OutOfMemory)?;
        let dst = self.raw_allocate(layout)?.cast::<T>();
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(dst)
    }

    /// Publish the element.
    pub fn commit(self) {
        unsafe { commit_slot(self.slot) };
        mem::forget(self);
    }

    /// Tombstone the slot, destroying the element.
    pub fn cancel(self) {
        unsafe {
            let rtype = type_ptr::<L>(self.slot).read();
            rtype.destroy(self.element);
            tombstone_slot(self.slot);
        }
        mem::forget(self);
    }
}

impl<L: QueueFeatures, A: PagedAllocator> Drop for PutTransaction<'_, L, A> {
    fn drop(&mut self) {
        unsafe {
            let rtype = type_ptr::<L>(self.slot).read();
            rtype.destroy(self.element);
            tombstone_slot(self.slot);
        }
    }
}

/// An in-progress consume on a [`HeterQueue`]. `commit` destroys and
/// retires the element, `commit_nodestroy` retires it without running
/// its destructor, `cancel` or drop puts it back.
pub struct ConsumeOperation<'a, L: QueueFeatures, A: PagedAllocator> {
    queue: &'a mut HeterQueue<L, A>,
    slot: *mut u8,
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

    /// Address of the element's storage before alignment: the raw
    /// payload area for inline elements, the external block otherwise.
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

    /// Destroy the element and retire the slot.
    pub fn commit(self) {
        self.retire(true);
    }

    /// Retire the slot without destroying the element; the caller has
    /// taken ownership of the value (for example by reading it out).
    pub fn commit_nodestroy(self) {
        self.retire(false);
    }

    fn retire(self, destroy: bool) {
        let mut this = mem::ManuallyDrop::new(self);
        let slot = this.slot;
        this.queue.finish_consume(slot, destroy);
    }

    /// Release the claim, restoring the element for a later consume.
    pub fn cancel(self) {
        unsafe { cancel_claim(self.slot) };
        mem::forget(self);
    }
}

impl<L: QueueFeatures, A: PagedAllocator> Drop for ConsumeOperation<'_, L, A> {
    fn drop(&mut self) {
        unsafe { cancel_claim(self.slot) };
    }
}

/// Undo a consumer's claim: clear BUSY, leaving the slot live.
pub(crate) unsafe fn cancel_claim(slot: *mut u8) {
    let word = unsafe { control(slot).next.load(Ordering::Relaxed) };
    debug_assert_eq!(
        word & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
        SlotFlags::BUSY.bits()
    );
    unsafe {
        control(slot)
            .next
            .store(word & !SlotFlags::BUSY.bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::testing::CountingAllocator;
    use crate::page_alloc::PageAllocator;

    type SmallQueue = HeterQueue<DefaultFeatures, PageAllocator<4096>>;
    type CountedQueue = HeterQueue<DefaultFeatures, CountingAllocator<4096>>;

    #[test]
    fn test_heterogeneous_sequence() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        queue.push(1i32).unwrap();
        queue.push(String::from("hello")).unwrap();
        queue.push(3.14f64).unwrap();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<i32>(), 1);
        op.commit();

        let op = queue.try_start_consume().unwrap();
        assert!(op.complete_type().is::<String>());
        assert_eq!(op.element::<String>(), "hello");
        op.commit();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<f64>(), 3.14);
        op.commit();

        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
    }

    #[test]
    fn test_try_push_always_accepts() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        assert_eq!(queue.try_push(ProgressGuarantee::WaitFree, 1u32), Ok(true));
        assert_eq!(queue.try_push(ProgressGuarantee::LockFree, 2u32), Ok(true));
        assert_eq!(queue.try_push(ProgressGuarantee::Blocking, 3u32), Ok(true));

        for expected in 1..=3u32 {
            let op = queue.try_start_consume().unwrap();
            assert_eq!(*op.element::<u32>(), expected);
            op.commit();
        }
        assert!(queue.empty());
    }

    #[test]
    fn test_cancelled_put_leaves_queue_empty() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let t = queue.start_push(42i32).unwrap();
        drop(t);
        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
    }

    #[test]
    fn test_explicit_cancel_destroys_element() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let value = std::rc::Rc::new(7);
        let witness = std::rc::Rc::clone(&value);
        let t = queue.start_push(value).unwrap();
        t.cancel();
        assert_eq!(std::rc::Rc::strong_count(&witness), 1);
        assert!(queue.empty());
    }

    #[test]
    fn test_commit_then_consume_roundtrip() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let mut t = queue.start_push(10u64).unwrap();
        *t.element::<u64>() += 5;
        t.commit();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u64>(), 15);
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_consume_cancel_restores_element() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        queue.push(9i32).unwrap();

        let op = queue.try_start_consume().unwrap();
        op.cancel();
        assert!(!queue.empty());

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<i32>(), 9);
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_commit_nodestroy_transfers_ownership() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        queue.push(String::from("owned")).unwrap();

        let op = queue.try_start_consume().unwrap();
        let taken = unsafe { op.element_ptr().cast::<String>().read() };
        op.commit_nodestroy();
        assert_eq!(taken, "owned");
        assert!(queue.empty());
    }

    #[test]
    fn test_page_overflow_and_reclamation() {
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let mut queue = CountedQueue::with_allocator(queue_alloc);

        let mut pushed = 0usize;
        while counters.page_allocs() < 2 {
            queue.push(0u8).unwrap();
            pushed += 1;
        }
        assert_eq!(counters.live_pages(), 2);

        let mut consumed = 0usize;
        let mut first_page_released_at = None;
        while queue.try_consume() {
            consumed += 1;
            if first_page_released_at.is_none() && counters.live_pages() == 1 {
                first_page_released_at = Some(consumed);
            }
        }
        assert_eq!(consumed, pushed);
        // The first page went back before the queue was fully drained.
        assert!(first_page_released_at.unwrap() < consumed);
        drop(queue);
        assert_eq!(counters.live_pages(), 0);
    }

    #[test]
    fn test_exact_fill_defers_page_switch() {
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let mut queue = CountedQueue::with_allocator(queue_alloc);

        // Units available before the sentinel; () costs one unit,
        // [u8; 16] costs two.
        let usable_units = (4096 - crate::page_alloc::PAGE_HEADER_SIZE) / UNIT - 1;
        queue.push(()).unwrap();
        for _ in 0..(usable_units - 1) / 2 {
            queue.push([0u8; 16]).unwrap();
        }
        // The page is exactly full; no second page yet.
        assert_eq!(counters.page_allocs(), 1);
        queue.push(()).unwrap();
        assert_eq!(counters.page_allocs(), 2);

        queue.clear();
        assert!(queue.empty());
    }

    #[test]
    fn test_inline_boundary() {
        let limit = SmallQueue::inline_limit();
        assert_eq!(limit, 2000);

        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let mut queue = CountedQueue::with_allocator(queue_alloc);

        queue.push([7u8; 2000]).unwrap();
        assert_eq!(counters.block_allocs.load(std::sync::atomic::Ordering::SeqCst), 0);

        queue.push([8u8; 2001]).unwrap();
        assert_eq!(counters.block_allocs.load(std::sync::atomic::Ordering::SeqCst), 1);

        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.element::<[u8; 2000]>()[0], 7);
        op.commit();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.element::<[u8; 2001]>()[0], 8);
        op.commit();

        drop(queue);
        assert!(counters.balanced_blocks());
        assert_eq!(counters.live_pages(), 0);
    }

    #[test]
    fn test_external_payload_roundtrip() {
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let mut queue =
            HeterQueue::<DefaultFeatures, CountingAllocator<4096>>::with_allocator(queue_alloc);

        let big = vec![42u8; 3000];
        queue.push([0u8; 3000]).unwrap();
        queue.push(big.clone()).unwrap(); // Vec header is small: inline

        let op = queue.try_start_consume().unwrap();
        let word = unsafe { control(op.slot).next.load(Ordering::Relaxed) };
        assert!(word & SlotFlags::EXTERNAL.bits() != 0);
        assert!(!PageAllocator::<4096>::same_page(op.slot, op.element_ptr()));
        assert_eq!(op.element::<[u8; 3000]>()[5], 0);
        op.commit();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.element::<Vec<u8>>(), &big);
        op.commit();

        drop(queue);
        assert!(counters.balanced_blocks());
    }

    #[test]
    fn test_constructor_panic_tombstones_slot() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let mut made = 0u32;
        let mut push_nth = |queue: &mut HeterQueue<DefaultFeatures>, n: u32| {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                queue.emplace_with(|| {
                    if n == 3 {
                        panic!("third construction fails");
                    }
                    n
                })
            }));
            if result.is_ok() {
                made += 1;
            }
        };
        for n in 1..=5 {
            push_nth(&mut queue, n);
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
    fn test_dyn_puts() {
        use crate::feature_list;
        use crate::runtime_type::{
            FAlign, FCopyConstruct, FDefaultConstruct, FDestroy, FMoveConstruct, FSize, FTypeId,
        };

        feature_list! {
            struct DynFeatures: FSize, FAlign, FTypeId, FDestroy,
                FMoveConstruct, FCopyConstruct, FDefaultConstruct;
        }

        let mut queue = HeterQueue::<DynFeatures>::new();
        let rtype = RuntimeType::<DynFeatures>::make::<u32>();
        queue.dyn_push(rtype).unwrap();

        let src = 55u32;
        unsafe {
            queue
                .dyn_push_copy(rtype, (&src as *const u32).cast())
                .unwrap();
        }
        let mut moved = String::from("moved in");
        let string_type = RuntimeType::<DynFeatures>::make::<String>();
        unsafe {
            queue
                .dyn_push_move(string_type, (&mut moved as *mut String).cast())
                .unwrap();
            mem::forget(moved);
        }

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u32>(), 0);
        op.commit();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u32>(), 55);
        op.commit();
        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.element::<String>(), "moved in");
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_raw_allocate_shares_lifecycle() {
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let mut t = queue.start_push(1u32).unwrap();
        let extra = t
            .raw_allocate(Layout::from_size_align(48, 8).unwrap())
            .unwrap();
        unsafe { ptr::write_bytes(extra, 0xEE, 48) };
        let copied = t.raw_allocate_copy(&[1u16, 2, 3]).unwrap();
        unsafe {
            assert_eq!(*copied, 1);
            assert_eq!(*copied.add(2), 3);
        }
        t.commit();

        let op = queue.try_start_consume().unwrap();
        assert_eq!(*op.element::<u32>(), 1);
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_clear_runs_destructors() {
        use std::rc::Rc;
        let mut queue = HeterQueue::<DefaultFeatures>::new();
        let tracker = Rc::new(());
        for _ in 0..10 {
            queue.push(Rc::clone(&tracker)).unwrap();
        }
        assert_eq!(Rc::strong_count(&tracker), 11);
        queue.clear();
        assert_eq!(Rc::strong_count(&tracker), 1);
        assert!(queue.empty());
    }

    #[test]
    fn test_drop_releases_everything() {
        use std::rc::Rc;
        let queue_alloc = CountingAllocator::<4096>::default();
        let counters = std::sync::Arc::clone(&queue_alloc.counters);
        let tracker = Rc::new(());
        {
            let mut queue = CountedQueue::with_allocator(queue_alloc);
            for _ in 0..500 {
                queue.push(Rc::clone(&tracker)).unwrap();
            }
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
        assert_eq!(counters.live_pages(), 0);
    }

    #[test]
    fn test_many_pages_fifo_order() {
        let mut queue = SmallQueue::new();
        for i in 0..10_000u32 {
            queue.push(i).unwrap();
        }
        for i in 0..10_000u32 {
            let op = queue.try_start_consume().unwrap();
            assert_eq!(*op.element::<u32>(), i);
            op.commit();
        }
        assert!(queue.empty());
    }
}
