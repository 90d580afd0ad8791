//! Lock-free queue: consumer side.
//!
//! Consumers pin the page containing the head (re-reading the head
//! after pinning, because the page may have been recycled in
//! between), walk the control-block chain forward, and claim the
//! first live slot by CAS on its control word. The head itself is
//! advanced lazily and cooperatively: whichever consumer retires a
//! slot tries to push the head past every leading tombstone, zeroing
//! the slots it passes and retiring drained pages.
//!
//! A zero control word means a producer has reserved the slot but not
//! yet linked it. Reaching one, a consumer scans backward from the
//! end-of-page sentinel toward its position (crossing pages along
//! sentinel links, pin discipline maintained) for any non-zero word
//! up to the observed tail. Finding none proves the queue is empty at
//! this observation; finding one means a put is in flight, so the
//! stuck word is re-read and, if still unpublished, the consume
//! reports empty rather than waiting on the slow producer.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::AtomicUsize;

use crossbeam_utils::CachePadded;

use crate::control::{
    control, element_of, end_control, external_ptr, first_slot, type_ptr, SlotFlags, FLAGS_MASK,
    TYPE_OFFSET,
};
use crate::error::Result;
use crate::lf_tail::{LfTail, UNIT};
use crate::page_alloc::PagedAllocator;
use crate::progress::{Cardinality, ConsistencyModel};
use crate::runtime_type::{QueueFeatures, RuntimeType};

/// Consumer half of the lock-free queue, layered over the producer
/// half.
pub(crate) struct LfHead<L, A, P, C, M> {
    pub(crate) tail: LfTail<L, A, P, M>,
    head: CachePadded<AtomicUsize>,
    _marker: PhantomData<C>,
}

impl<L, A, P, C, M> LfHead<L, A, P, C, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    C: Cardinality,
    M: ConsistencyModel,
{
    pub(crate) fn with_allocator(alloc: A) -> Result<Self> {
        let tail = LfTail::with_allocator(alloc)?;
        let head = tail.tail_for_consumers() as usize;
        Ok(Self {
            tail,
            head: CachePadded::new(AtomicUsize::new(head)),
            _marker: PhantomData,
        })
    }

    /// Pin the page holding the head. The head is re-read after
    /// pinning: if it moved to another page in between, the pinned
    /// page may already have been recycled, so the pin is released
    /// and the protocol restarts.
    fn pin_head(&self) -> *mut u8 {
        let mut head = self.head.load(M::LOAD) as *mut u8;
        loop {
            unsafe { self.tail.allocator().pin_page(head) };
            let reread = self.head.load(M::LOAD) as *mut u8;
            if A::same_page(head, reread) {
                return reread;
            }
            self.tail.release_pin(head);
            head = reread;
        }
    }

    /// Claim the oldest live slot, returning it with its page pinned
    /// (the pin travels with the consume operation). `None` means no
    /// committed element was observable.
    pub(crate) fn start_consume(&self) -> Option<*mut u8> {
        let mut slot = self.pin_head();
        loop {
            let word = unsafe { control(slot).next.load(M::LOAD) };
            if word & !SlotFlags::NEXT_PAGE_INVALID.bits() != 0 {
                if word & (SlotFlags::BUSY | SlotFlags::DEAD).bits() == 0 {
                    let claimed = unsafe {
                        control(slot)
                            .next
                            .compare_exchange(
                                word,
                                word | SlotFlags::BUSY.bits(),
                                M::RMW,
                                M::CAS_FAILURE,
                            )
                            .is_ok()
                    };
                    if claimed {
                        return Some(slot);
                    }
                    debug_assert!(C::CONTENDED, "claim lost without concurrent consumers");
                    continue;
                }
                // The pointer bits of a published word never change;
                // only its flags do, so a stale word still links
                // correctly.
                let next = (word & !FLAGS_MASK) as *mut u8;
                debug_assert!(!next.is_null());
                if A::same_page(slot, next) {
                    slot = next;
                } else {
                    match self.cross_page(slot, next) {
                        Some(entered) => slot = entered,
                        None => slot = self.pin_head(),
                    }
                }
            } else {
                // Reserved-but-unlinked slot, or a sentinel with no
                // successor.
                let tail = self.tail.tail_for_consumers();
                if slot == tail || !self.scan_for_nonzero(slot, tail) {
                    self.tail.release_pin(slot);
                    return None;
                }
                // Something is in flight; if our own word is still
                // unpublished the element is not yet observable.
                let again = unsafe { control(slot).next.load(M::LOAD) };
                if again & !SlotFlags::NEXT_PAGE_INVALID.bits() == 0 {
                    self.tail.release_pin(slot);
                    return None;
                }
            }
        }
    }

    /// Move the walk from `slot`'s page to `next`'s page, keeping the
    /// pin discipline: pin the destination, then verify the source
    /// page has not been retired (which would mean the head crossed
    /// it and the link may lead into recycled memory). On success the
    /// old pin is dropped and `next` returned; on failure both pins
    /// are dropped and the caller restarts from the head.
    fn cross_page(&self, slot: *mut u8, next: *mut u8) -> Option<*mut u8> {
        unsafe { self.tail.allocator().pin_page(next) };
        if unsafe { self.tail.allocator().page_is_retired(slot) } {
            self.tail.release_pin(next);
            self.tail.release_pin(slot);
            None
        } else {
            self.tail.release_pin(slot);
            Some(next)
        }
    }

    /// Backward scan for any non-zero control word in `(stuck, tail]`,
    /// following sentinel links across pages. The caller holds a pin
    /// on `stuck`'s page, which is never released here.
    fn scan_for_nonzero(&self, stuck: *mut u8, tail: *mut u8) -> bool {
        // Pin held on pages after the first while they are scanned.
        let mut extra_pin: Option<*mut u8> = None;
        let mut page = A::page_base(stuck);
        // Scan the first page strictly above the stuck slot.
        let mut lowest = stuck.wrapping_add(UNIT);
        loop {
            let end = end_control(page, A::PAGE_SIZE, UNIT);
            let in_tail_page = A::same_page(page, tail as *const u8);
            let limit = if in_tail_page && tail < end { tail } else { end };
            let mut curr = limit;
            let mut found = false;
            while curr > lowest {
                curr = curr.wrapping_sub(UNIT);
                let word = unsafe { control(curr).next.load(M::LOAD) };
                if word != 0 {
                    found = true;
                    break;
                }
            }
            if found || in_tail_page {
                if let Some(p) = extra_pin {
                    self.tail.release_pin(p);
                }
                return found;
            }
            // Nothing here; follow the sentinel into the next page.
            let word = unsafe { control(end).next.load(M::LOAD) };
            let next = (word & !FLAGS_MASK) as *mut u8;
            if next.is_null() {
                // No successor yet the tail is elsewhere: a page
                // switch is in flight.
                if let Some(p) = extra_pin {
                    self.tail.release_pin(p);
                }
                return true;
            }
            unsafe { self.tail.allocator().pin_page(next) };
            let stale = unsafe { self.tail.allocator().page_is_retired(page) };
            if let Some(p) = extra_pin {
                self.tail.release_pin(p);
            }
            if stale {
                // The territory behind us was drained; report
                // "in flight" and let the walk restart from the head.
                self.tail.release_pin(next);
                return true;
            }
            extra_pin = Some(next);
            page = A::page_base(next);
            lowest = first_slot(page);
        }
    }

    /// Retire a claimed slot (optionally destroying its element),
    /// advance the head cooperatively and drop the consume pin.
    pub(crate) fn finish_consume(&self, slot: *mut u8, destroy: bool) {
        unsafe {
            let word = control(slot).next.load(M::LOAD);
            let rtype = type_ptr::<L>(slot).read();
            if destroy {
                rtype.destroy(element_of::<L>(slot, word, rtype.alignment()));
            }
            if word & SlotFlags::EXTERNAL.bits() != 0 {
                // Free the external block now and blank the record so
                // the head advance does not free it again.
                let record = &mut *external_ptr::<L>(slot);
                if !record.block.is_null() {
                    let layout =
                        core::alloc::Layout::from_size_align_unchecked(record.size, record.align);
                    self.tail.allocator().deallocate(record.block, layout);
                    record.block = ptr::null_mut();
                }
            }
        }
        // BUSY -> DEAD in one atomic step.
        let delta = SlotFlags::DEAD.bits() - SlotFlags::BUSY.bits();
        let prev = unsafe { control(slot).next.fetch_add(delta, M::RMW) };
        debug_assert_eq!(
            prev & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
            SlotFlags::BUSY.bits()
        );
        self.advance_head();
        self.tail.release_pin(slot);
    }

    /// Release a claim without consuming: clear BUSY and drop the
    /// consume pin; the element becomes claimable again.
    pub(crate) fn cancel_consume(&self, slot: *mut u8) {
        let prev = unsafe {
            control(slot)
                .next
                .fetch_sub(SlotFlags::BUSY.bits(), M::RMW)
        };
        debug_assert_eq!(
            prev & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
            SlotFlags::BUSY.bits()
        );
        self.tail.release_pin(slot);
    }

    /// Push the head past leading tombstones. Each slot passed is
    /// zeroed (keeping the page's reuse cheap and the "empty page is
    /// zeroed" contract intact); each page crossed is retired. Losing
    /// a head CAS means another consumer is advancing — give up, the
    /// work is theirs.
    fn advance_head(&self) {
        let mut head = self.pin_head();
        loop {
            let word = unsafe { control(head).next.load(M::LOAD) };
            let flags = word & FLAGS_MASK;
            if flags & (SlotFlags::BUSY | SlotFlags::DEAD).bits() != SlotFlags::DEAD.bits() {
                break;
            }
            let next = (word & !FLAGS_MASK) as *mut u8;
            if next.is_null() {
                break;
            }
            if A::same_page(head, next) {
                if self
                    .head
                    .compare_exchange(head as usize, next as usize, M::RMW, M::CAS_FAILURE)
                    .is_err()
                {
                    break;
                }
                unsafe {
                    if flags & SlotFlags::EXTERNAL.bits() != 0 {
                        let record = external_ptr::<L>(head).read();
                        if !record.block.is_null() {
                            let layout = core::alloc::Layout::from_size_align_unchecked(
                                record.size,
                                record.align,
                            );
                            self.tail.allocator().deallocate(record.block, layout);
                        }
                    }
                    self.zero_region(head, next);
                }
                head = next;
            } else {
                // `head` is the sentinel; cross into the next page and
                // retire this one.
                if self
                    .head
                    .compare_exchange(head as usize, next as usize, M::RMW, M::CAS_FAILURE)
                    .is_err()
                {
                    break;
                }
                let old_page = A::page_base(head);
                unsafe {
                    // The new page cannot be reclaimed: the head now
                    // points into it and it is not retired.
                    self.tail.allocator().pin_page(next);
                    self.tail.allocator().mark_retired(old_page);
                }
                self.tail.release_pin(old_page); // the liveness pin
                self.tail.release_pin(old_page); // our walk pin
                head = next;
            }
        }
        self.tail.release_pin(head);
    }

    /// Zero a retired slot region. Backward scans read the word at
    /// every unit boundary concurrently, so those are cleared with
    /// atomic stores; the bytes in between belong to the retired
    /// payload and nobody else reads them.
    ///
    /// # Safety
    ///
    /// `[start, end)` must be a retired slot region the head has
    /// passed, inside one pinned page.
    unsafe fn zero_region(&self, start: *mut u8, end: *mut u8) {
        let mut unit = start;
        while unit < end {
            unsafe {
                control(unit).next.store(0, M::STORE);
                let gap = unit.add(TYPE_OFFSET);
                let gap_end = if unit.add(UNIT) < end { unit.add(UNIT) } else { end };
                ptr::write_bytes(gap, 0, gap_end as usize - gap as usize);
            }
            unit = unit.wrapping_add(UNIT);
        }
    }

    /// Read-only access for handles: the runtime type of a claimed
    /// slot.
    pub(crate) fn slot_type(&self, slot: *mut u8) -> RuntimeType<L> {
        unsafe { type_ptr::<L>(slot).read() }
    }

    /// The element address of a claimed slot.
    pub(crate) fn slot_element(&self, slot: *mut u8) -> *mut u8 {
        unsafe {
            let word = control(slot).next.load(M::LOAD);
            element_of::<L>(slot, word, self.slot_type(slot).alignment())
        }
    }

    /// The raw storage address of a claimed slot (unaligned payload
    /// area, or the external block).
    pub(crate) fn slot_storage(&self, slot: *mut u8) -> *mut u8 {
        unsafe {
            let word = control(slot).next.load(M::LOAD);
            if word & SlotFlags::EXTERNAL.bits() != 0 {
                (*external_ptr::<L>(slot)).block
            } else {
                slot.wrapping_add(crate::control::element_offset::<L>())
            }
        }
    }

    /// Tear down in exclusive mode: consume whatever is left, push
    /// the head past any trailing tombstones (releasing their pages),
    /// then release the final page.
    pub(crate) fn destroy(&mut self) {
        while let Some(slot) = self.start_consume() {
            self.finish_consume(slot, true);
        }
        self.advance_head();
        let head = self.head.load(M::LOAD) as *mut u8;
        let page = A::page_base(head);
        unsafe { self.tail.allocator().mark_retired(page) };
        self.tail.release_pin(page);
    }
}
