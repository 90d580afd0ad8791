//! Lock-free queue: producer side.
//!
//! Producers share one atomic tail pointer and reserve slots by CAS,
//! bump-allocating in units within the current page. A reservation
//! that does not fit pads the remainder of the page with a tombstone
//! and retries; a reservation that lands exactly on the end-of-page
//! sentinel performs the page switch: one producer wins a CAS on the
//! sentinel word to install a fresh page, losers adopt the winner's
//! page.
//!
//! Immediately after winning the tail CAS, the producer stores the
//! slot's control word (the link to the following slot, plus flags).
//! Consumers rely on that store happening before any other write into
//! the slot: a zero word means "reserved but not yet linked".

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::AtomicUsize;

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::control::{
    control, end_control, external_ptr, first_slot, max_inline_units, payload_ptr, required_units,
    type_ptr, ExternalBlock, SlotFlags, CONCURRENT_UNIT, FLAGS_MASK,
};
use crate::error::{Error, Result};
use crate::page_alloc::PagedAllocator;
use crate::progress::{Cardinality, ConsistencyModel, ProgressGuarantee};
use crate::runtime_type::{QueueFeatures, RuntimeType};

pub(crate) const UNIT: usize = CONCURRENT_UNIT;

/// Producer half of the lock-free queue: the shared tail pointer plus
/// the allocator, and the page-pinning helpers both halves use.
pub(crate) struct LfTail<L, A, P, M> {
    tail: CachePadded<AtomicUsize>,
    alloc: A,
    _marker: PhantomData<(L, P, M)>,
}

impl<L, A, P, M> LfTail<L, A, P, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    M: ConsistencyModel,
{
    /// Create the tail with its first page. The page's allocation pin
    /// doubles as the queue's liveness pin on it.
    pub(crate) fn with_allocator(alloc: A) -> Result<Self> {
        let page = alloc.allocate_page_zeroed()?.as_ptr();
        unsafe {
            control(end_control(page, A::PAGE_SIZE, UNIT))
                .next
                .store(SlotFlags::NEXT_PAGE_INVALID.bits(), M::STORE);
        }
        Ok(Self {
            tail: CachePadded::new(AtomicUsize::new(first_slot(page) as usize)),
            alloc,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The tail as consumers may observe it (advisory).
    #[inline]
    pub(crate) fn tail_for_consumers(&self) -> *mut u8 {
        self.tail.load(M::LOAD) as *mut u8
    }

    /// Drop a pin; the unpinner that takes the count to zero on a
    /// retired page reclaims it.
    pub(crate) fn release_pin(&self, ptr: *mut u8) {
        let page = A::page_base(ptr);
        unsafe {
            if self.alloc.unpin_page(page) == 1 && self.alloc.take_retired(page) {
                ptr::write_bytes(end_control(page, A::PAGE_SIZE, UNIT), 0, UNIT);
                self.alloc.deallocate_page_zeroed(page);
            }
        }
    }

    /// Reserve `units` units of storage. The claimed slot's word is
    /// published as the following slot's address plus `flags` before
    /// this returns.
    pub(crate) fn allocate_slot(
        &self,
        units: usize,
        flags: SlotFlags,
        guarantee: ProgressGuarantee,
    ) -> Result<*mut u8> {
        debug_assert!(units <= max_inline_units(A::PAGE_SIZE, UNIT));
        let mut backoff = Backoff::new();
        let mut tail = self.tail.load(M::LOAD) as *mut u8;
        loop {
            let page = A::page_base(tail);
            let end = end_control(page, A::PAGE_SIZE, UNIT);
            let bumped = tail.wrapping_add(units * UNIT);
            let (slot, new_tail, padding) = if bumped <= end {
                (tail, bumped, false)
            } else if tail != end {
                // Pad the remainder of the page with a tombstone.
                (tail, end, true)
            } else {
                if !guarantee.allows_retry() {
                    // Wait-free puts never attempt a page switch.
                    return Err(Error::WouldBlock);
                }
                match self.next_page(&mut tail, guarantee)? {
                    Some(first) => (first, first.wrapping_add(units * UNIT), false),
                    None => {
                        // The tail was stale or a switch is in flight;
                        // `tail` has been refreshed.
                        if P::CONTENDED {
                            backoff.relax();
                        }
                        continue;
                    }
                }
            };
            // Strong CAS: a spurious failure would make a wait-free
            // put report contention that never happened.
            match self.tail.compare_exchange(
                tail as usize,
                new_tail as usize,
                M::RMW,
                M::CAS_FAILURE,
            ) {
                Ok(_) => {
                    let word_flags = if padding { SlotFlags::DEAD } else { flags };
                    unsafe {
                        control(slot)
                            .next
                            .store(new_tail as usize | word_flags.bits(), M::STORE);
                    }
                    if !padding {
                        return Ok(slot);
                    }
                    tail = self.tail.load(M::LOAD) as *mut u8;
                }
                Err(observed) => {
                    if !guarantee.allows_retry() {
                        return Err(Error::WouldBlock);
                    }
                    if P::CONTENDED {
                        backoff.wait();
                    }
                    tail = observed as *mut u8;
                }
            }
        }
    }

    /// Resolve the successor of the page whose sentinel `*tail`
    /// points at, installing a fresh page if there is none yet.
    ///
    /// Returns the successor's first slot, or `None` after refreshing
    /// `*tail` when the observed tail was stale.
    fn next_page(
        &self,
        tail: &mut *mut u8,
        guarantee: ProgressGuarantee,
    ) -> Result<Option<*mut u8>> {
        let end_block = *tail;
        debug_assert_eq!(
            end_block,
            end_control(A::page_base(end_block), A::PAGE_SIZE, UNIT)
        );
        // Transient pin: the observed tail may be stale and its page
        // already recycled, which the reload below detects.
        unsafe { self.alloc.pin_page(end_block) };
        let current = self.tail.load(M::LOAD) as *mut u8;
        if current != end_block {
            *tail = current;
            self.release_pin(end_block);
            return Ok(None);
        }
        let word = unsafe { control(end_block).next.load(M::LOAD) };
        let out = if word == SlotFlags::NEXT_PAGE_INVALID.bits() {
            match self.install_page(end_block, guarantee) {
                Ok(first) => Some(first),
                Err(e) => {
                    self.release_pin(end_block);
                    return Err(e);
                }
            }
        } else if word == 0 {
            None
        } else {
            Some((word & !FLAGS_MASK) as *mut u8)
        };
        self.release_pin(end_block);
        Ok(out)
    }

    /// Allocate a fresh page and publish it through `end_block`'s
    /// sentinel word. Losers of the publication CAS adopt the
    /// winner's page.
    fn install_page(&self, end_block: *mut u8, guarantee: ProgressGuarantee) -> Result<*mut u8> {
        let page = if guarantee.allows_blocking_alloc() {
            self.alloc.allocate_page_zeroed()?.as_ptr()
        } else {
            self.alloc.try_allocate_page_zeroed()?.as_ptr()
        };
        unsafe {
            control(end_control(page, A::PAGE_SIZE, UNIT))
                .next
                .store(SlotFlags::NEXT_PAGE_INVALID.bits(), M::STORE);
        }
        let first = first_slot(page);
        match unsafe {
            control(end_block).next.compare_exchange(
                SlotFlags::NEXT_PAGE_INVALID.bits(),
                first as usize | SlotFlags::DEAD.bits(),
                M::RMW,
                M::CAS_FAILURE,
            )
        } {
            Ok(_) => Ok(first),
            Err(observed) => {
                // Another producer linked its page first; give ours
                // back untouched and follow the winner.
                unsafe {
                    control(end_control(page, A::PAGE_SIZE, UNIT))
                        .next
                        .store(0, M::STORE);
                    self.alloc.deallocate_page_zeroed(page);
                }
                Ok((observed & !FLAGS_MASK) as *mut u8)
            }
        }
    }

    /// Clear BUSY on a claimed slot, publishing the element.
    pub(crate) fn commit_slot(&self, slot: *mut u8) {
        let prev = unsafe {
            control(slot)
                .next
                .fetch_sub(SlotFlags::BUSY.bits(), M::RMW)
        };
        debug_assert_eq!(
            prev & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
            SlotFlags::BUSY.bits()
        );
    }

    /// Turn a claimed slot into a tombstone: clear BUSY, set DEAD.
    pub(crate) fn cancel_slot(&self, slot: *mut u8) {
        let delta = SlotFlags::DEAD.bits() - SlotFlags::BUSY.bits();
        let prev = unsafe { control(slot).next.fetch_add(delta, M::RMW) };
        debug_assert_eq!(
            prev & (SlotFlags::BUSY | SlotFlags::DEAD).bits(),
            SlotFlags::BUSY.bits()
        );
    }

    /// Allocate a slot, store the runtime type and construct the
    /// payload. On success the slot is BUSY and unpublished; a panic
    /// inside `construct` tombstones it.
    pub(crate) fn begin_put<C>(
        &self,
        layout: Layout,
        rtype: RuntimeType<L>,
        construct: impl FnOnce(*mut u8, C),
        ctx: C,
        guarantee: ProgressGuarantee,
    ) -> Result<(*mut u8, *mut u8)> {
        let units = required_units::<L>(layout.size(), layout.align(), UNIT);
        if units <= max_inline_units(A::PAGE_SIZE, UNIT) {
            let slot = self.allocate_slot(units, SlotFlags::BUSY, guarantee)?;
            unsafe { type_ptr::<L>(slot).write(rtype) };
            let element = payload_ptr::<L>(slot, layout.align());
            let guard = CancelOnUnwind { tail: self, slot };
            construct(element, ctx);
            mem::forget(guard);
            Ok((slot, element))
        } else {
            if !guarantee.allows_blocking_alloc() {
                return Err(Error::WouldBlock);
            }
            let record_units = required_units::<L>(
                mem::size_of::<ExternalBlock>(),
                mem::align_of::<ExternalBlock>(),
                UNIT,
            );
            let slot =
                self.allocate_slot(record_units, SlotFlags::BUSY | SlotFlags::EXTERNAL, guarantee)?;
            unsafe { type_ptr::<L>(slot).write(rtype) };
            let block = match self.alloc.allocate(layout) {
                Ok(block) => block.as_ptr(),
                Err(e) => {
                    self.cancel_slot(slot);
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
            let guard = CancelOnUnwind { tail: self, slot };
            construct(block, ctx);
            mem::forget(guard);
            Ok((slot, block))
        }
    }

    /// Reserve extra bytes published as tombstones; they are
    /// reclaimed with the surrounding storage.
    pub(crate) fn raw_allocate(&self, layout: Layout) -> Result<*mut u8> {
        let units = required_units::<L>(layout.size(), layout.align(), UNIT);
        if units <= max_inline_units(A::PAGE_SIZE, UNIT) {
            let slot = self.allocate_slot(units, SlotFlags::DEAD, ProgressGuarantee::Blocking)?;
            Ok(payload_ptr::<L>(slot, layout.align()))
        } else {
            let record_units = required_units::<L>(
                mem::size_of::<ExternalBlock>(),
                mem::align_of::<ExternalBlock>(),
                UNIT,
            );
            let slot = self.allocate_slot(
                record_units,
                SlotFlags::DEAD | SlotFlags::EXTERNAL,
                ProgressGuarantee::Blocking,
            )?;
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
}

/// Tombstones a BUSY slot if the payload constructor unwinds.
struct CancelOnUnwind<'a, L, A, P, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    M: ConsistencyModel,
{
    tail: &'a LfTail<L, A, P, M>,
    slot: *mut u8,
}

impl<L, A, P, M> Drop for CancelOnUnwind<'_, L, A, P, M>
where
    L: QueueFeatures,
    A: PagedAllocator,
    P: Cardinality,
    M: ConsistencyModel,
{
    fn drop(&mut self) {
        self.tail.cancel_slot(self.slot);
    }
}
