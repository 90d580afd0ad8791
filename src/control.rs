//! Control-block and element layout.
//!
//! Every queued element is preceded by a control block whose single
//! word encodes the address of the next control block plus state bits
//! in the low bits. The inline runtime type follows the word, then the
//! payload (aligned to its own type), or an [`ExternalBlock`] record
//! when the payload lives outside the page.
//!
//! Allocation happens in fixed *units*. A unit is large enough for the
//! flag bits to fit under any control-block address, for the runtime
//! type, and (in the concurrent variants) for a whole cache line so
//! neighbouring slots don't false-share. The last unit of every page
//! is the end-of-page sentinel: a control block whose word holds the
//! successor page address plus [`SlotFlags::DEAD`], or
//! [`SlotFlags::NEXT_PAGE_INVALID`] while there is no successor yet.

use core::sync::atomic::AtomicUsize;

use bitflags::bitflags;

use crate::page_alloc::PAGE_HEADER_SIZE;
use crate::runtime_type::{FeatureList, RuntimeType};

bitflags! {
    /// State bits packed into the low bits of a control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SlotFlags: usize {
        /// The element is being constructed or consumed.
        const BUSY = 0b0001;
        /// The slot holds no live element. Terminal: never cleared.
        const DEAD = 0b0010;
        /// The payload is stored in a separately allocated block.
        const EXTERNAL = 0b0100;
        /// Sentinel marker: the page has no successor yet.
        const NEXT_PAGE_INVALID = 0b1000;
    }
}

/// Mask selecting every flag bit of a control word.
pub(crate) const FLAGS_MASK: usize = SlotFlags::all().bits();

/// Unit size of the single-threaded variant: enough for the flag
/// bits, a pointer and the runtime type.
pub(crate) const COMPACT_UNIT: usize = 16;

/// Unit size of the concurrent variants: one cache line, so slots
/// written by different threads never share one.
pub(crate) const CONCURRENT_UNIT: usize = 64;

/// A control block: one pointer-sized word.
///
/// The single-threaded variant uses relaxed loads and stores, which
/// compile to plain memory accesses; the concurrent variants CAS it.
#[repr(C)]
pub(crate) struct ControlBlock {
    pub next: AtomicUsize,
}

/// Offset of the runtime type within a slot.
pub(crate) const TYPE_OFFSET: usize = core::mem::size_of::<ControlBlock>();

/// Indirection record stored in place of an oversized payload.
#[repr(C)]
pub(crate) struct ExternalBlock {
    pub block: *mut u8,
    pub size: usize,
    pub align: usize,
}

/// Offset of the payload (or external record) within a slot, before
/// alignment padding.
pub(crate) const fn element_offset<L: FeatureList>() -> usize {
    TYPE_OFFSET + core::mem::size_of::<RuntimeType<L>>()
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Units a slot occupies for a payload of `size`/`align`, including
/// the control word, the runtime type and worst-case alignment
/// padding.
#[inline]
pub(crate) const fn required_units<L: FeatureList>(
    size: usize,
    align: usize,
    unit: usize,
) -> usize {
    let type_align = core::mem::align_of::<RuntimeType<L>>();
    let mut bytes = element_offset::<L>() + size;
    if align > type_align {
        bytes += align - type_align;
    }
    (bytes + unit - 1) / unit
}

/// Number of allocation units in a page's payload region, sentinel
/// included.
#[inline]
pub(crate) const fn unit_capacity(page_size: usize, unit: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / unit
}

/// Largest number of units a slot may occupy inline: half the page,
/// so two arbitrary inline slots always fit one page.
#[inline]
pub(crate) const fn max_inline_units(page_size: usize, unit: usize) -> usize {
    unit_capacity(page_size, unit) / 2
}

/// Largest payload size (at minimal alignment) stored inline.
#[inline]
pub(crate) const fn max_inline_size<L: FeatureList>(page_size: usize, unit: usize) -> usize {
    max_inline_units(page_size, unit) * unit - element_offset::<L>()
}

/// First slot of a page.
#[inline]
pub(crate) fn first_slot(page: *mut u8) -> *mut u8 {
    page.wrapping_add(PAGE_HEADER_SIZE)
}

/// The end-of-page sentinel: the last unit of the page.
#[inline]
pub(crate) fn end_control(page: *mut u8, page_size: usize, unit: usize) -> *mut u8 {
    page.wrapping_add(PAGE_HEADER_SIZE + (unit_capacity(page_size, unit) - 1) * unit)
}

/// View a slot address as its control block.
#[inline]
pub(crate) unsafe fn control<'a>(slot: *mut u8) -> &'a ControlBlock {
    unsafe { &*slot.cast::<ControlBlock>() }
}

/// Address of the runtime type stored in a slot.
#[inline]
pub(crate) fn type_ptr<L: FeatureList>(slot: *mut u8) -> *mut RuntimeType<L> {
    slot.wrapping_add(TYPE_OFFSET).cast()
}

/// Address of a slot's payload storage for a payload of `align`.
#[inline]
pub(crate) fn payload_ptr<L: FeatureList>(slot: *mut u8, align: usize) -> *mut u8 {
    align_up(slot as usize + element_offset::<L>(), align) as *mut u8
}

/// Address of the external record of a slot flagged
/// [`SlotFlags::EXTERNAL`].
#[inline]
pub(crate) fn external_ptr<L: FeatureList>(slot: *mut u8) -> *mut ExternalBlock {
    payload_ptr::<L>(slot, core::mem::align_of::<ExternalBlock>()).cast()
}

/// The element address of a slot, given its control word and runtime
/// type alignment: the inline payload, or the external block's target.
#[inline]
pub(crate) unsafe fn element_of<L: FeatureList>(
    slot: *mut u8,
    word: usize,
    align: usize,
) -> *mut u8 {
    if word & SlotFlags::EXTERNAL.bits() != 0 {
        unsafe { (*external_ptr::<L>(slot)).block }
    } else {
        payload_ptr::<L>(slot, align)
    }
}
