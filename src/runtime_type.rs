//! Runtime type erasure through per-type feature tables.
//!
//! Queues in this crate store values of arbitrary types without
//! knowing them at the call site. Each stored element is preceded by a
//! [`RuntimeType`]: a single pointer to a static table of "feature"
//! entries (size, alignment, destroy, copy, ...) generated once per
//! concrete type.
//!
//! The set of features carried by a descriptor is chosen at the type
//! level. A feature list is a nominal type declared with
//! [`feature_list!`], naming the [`Feature`]s its table contains.
//! [`DefaultFeatures`] covers what the queues and most callers need;
//! custom lists can drop capabilities (for example copy-construction,
//! to store non-`Clone` types) or add user-defined features.
//!
//! ```
//! use hetq::runtime_type::{DefaultFeatures, RuntimeType};
//!
//! let rt: RuntimeType<DefaultFeatures> = RuntimeType::make::<String>();
//! assert_eq!(rt.size(), core::mem::size_of::<String>());
//! assert!(rt.is::<String>());
//! ```

use core::alloc::Layout;
use core::any::TypeId;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ptr;
use std::collections::hash_map::DefaultHasher;

/// A capability that a feature table can carry for an erased type.
///
/// A feature contributes one [`Entry`](Feature::Entry) — typically a
/// function pointer or a constant — to the tables of every list that
/// names it.
pub trait Feature: 'static {
    /// The value this feature stores in a table.
    type Entry: Copy + Send + Sync + 'static;
}

/// The binding of a [`Feature`] to a concrete type.
///
/// Implemented for every `T` the feature supports; the bounds on the
/// implementation are the feature's requirements (`FCopyConstruct`
/// requires `T: Clone`, and so on).
pub trait FeatureOf<T>: Feature {
    /// The entry describing `T`.
    const ENTRY: Self::Entry;
}

/// A nominal list of features, declared with [`feature_list!`].
pub trait FeatureList: 'static {
    /// The table type holding one entry per listed feature.
    type Table: Copy + Send + Sync + 'static;
}

/// A feature list whose every feature supports `T`.
pub trait ListOf<T>: FeatureList {
    /// The static table describing `T`.
    const TABLE: Self::Table;
}

/// Retrieval of a single feature's entry from a list's table.
pub trait HasFeature<F: Feature>: FeatureList {
    /// Extract `F`'s entry from a table of this list.
    fn entry(table: &Self::Table) -> F::Entry;
}

/// The features every queue variant requires of its element
/// descriptors.
pub trait QueueFeatures:
    FeatureList + HasFeature<FSize> + HasFeature<FAlign> + HasFeature<FDestroy>
{
}

impl<L> QueueFeatures for L where
    L: FeatureList + HasFeature<FSize> + HasFeature<FAlign> + HasFeature<FDestroy>
{
}

// ---------------------------------------------------------------------------
// Built-in features
// ---------------------------------------------------------------------------

/// Size in bytes of the erased type.
pub struct FSize;

impl Feature for FSize {
    type Entry = usize;
}

impl<T> FeatureOf<T> for FSize {
    const ENTRY: usize = core::mem::size_of::<T>();
}

/// Alignment in bytes of the erased type.
pub struct FAlign;

impl Feature for FAlign {
    type Entry = usize;
}

impl<T> FeatureOf<T> for FAlign {
    const ENTRY: usize = core::mem::align_of::<T>();
}

/// The [`TypeId`] of the erased type.
pub struct FTypeId;

impl Feature for FTypeId {
    type Entry = fn() -> TypeId;
}

impl<T: 'static> FeatureOf<T> for FTypeId {
    const ENTRY: fn() -> TypeId = TypeId::of::<T>;
}

/// The diagnostic name of the erased type.
pub struct FTypeName;

impl Feature for FTypeName {
    type Entry = fn() -> &'static str;
}

impl<T> FeatureOf<T> for FTypeName {
    const ENTRY: fn() -> &'static str = core::any::type_name::<T>;
}

/// In-place destruction. Required not to unwind.
pub struct FDestroy;

impl Feature for FDestroy {
    type Entry = unsafe fn(*mut u8);
}

unsafe fn destroy_erased<T>(obj: *mut u8) {
    unsafe { ptr::drop_in_place(obj.cast::<T>()) }
}

impl<T> FeatureOf<T> for FDestroy {
    const ENTRY: unsafe fn(*mut u8) = destroy_erased::<T>;
}

/// Move-construction from `src` into uninitialized `dst`, leaving
/// `src` logically uninitialized. A Rust move is a bitwise transfer,
/// so this entry never unwinds.
pub struct FMoveConstruct;

impl Feature for FMoveConstruct {
    type Entry = unsafe fn(dst: *mut u8, src: *mut u8);
}

unsafe fn move_erased<T>(dst: *mut u8, src: *mut u8) {
    unsafe { ptr::write(dst.cast::<T>(), ptr::read(src.cast::<T>())) }
}

impl<T> FeatureOf<T> for FMoveConstruct {
    const ENTRY: unsafe fn(*mut u8, *mut u8) = move_erased::<T>;
}

/// Copy-construction from `src` into uninitialized `dst`. May unwind
/// if the type's `clone` does.
pub struct FCopyConstruct;

impl Feature for FCopyConstruct {
    type Entry = unsafe fn(dst: *mut u8, src: *const u8);
}

unsafe fn copy_erased<T: Clone>(dst: *mut u8, src: *const u8) {
    unsafe { ptr::write(dst.cast::<T>(), (*src.cast::<T>()).clone()) }
}

impl<T: Clone> FeatureOf<T> for FCopyConstruct {
    const ENTRY: unsafe fn(*mut u8, *const u8) = copy_erased::<T>;
}

/// Default-construction into uninitialized `dst`.
pub struct FDefaultConstruct;

impl Feature for FDefaultConstruct {
    type Entry = unsafe fn(dst: *mut u8);
}

unsafe fn default_erased<T: Default>(dst: *mut u8) {
    unsafe { ptr::write(dst.cast::<T>(), T::default()) }
}

impl<T: Default> FeatureOf<T> for FDefaultConstruct {
    const ENTRY: unsafe fn(*mut u8) = default_erased::<T>;
}

/// Equality comparison of two erased values of the same type.
pub struct FEqual;

impl Feature for FEqual {
    type Entry = unsafe fn(*const u8, *const u8) -> bool;
}

unsafe fn equal_erased<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
    unsafe { *a.cast::<T>() == *b.cast::<T>() }
}

impl<T: PartialEq> FeatureOf<T> for FEqual {
    const ENTRY: unsafe fn(*const u8, *const u8) -> bool = equal_erased::<T>;
}

/// Hashing of an erased value.
pub struct FHash;

impl Feature for FHash {
    type Entry = unsafe fn(*const u8) -> u64;
}

unsafe fn hash_erased<T: Hash>(obj: *const u8) -> u64 {
    let mut state = DefaultHasher::new();
    unsafe { (*obj.cast::<T>()).hash(&mut state) };
    state.finish()
}

impl<T: Hash> FeatureOf<T> for FHash {
    const ENTRY: unsafe fn(*const u8) -> u64 = hash_erased::<T>;
}

// ---------------------------------------------------------------------------
// List declaration
// ---------------------------------------------------------------------------

/// Declares a feature list: a zero-sized nominal type whose table
/// holds one entry per listed feature, in order.
///
/// ```
/// use hetq::feature_list;
/// use hetq::runtime_type::{FAlign, FDestroy, FSize, FTypeId, RuntimeType};
///
/// feature_list! {
///     /// Descriptors for types that are neither `Clone` nor `Default`.
///     pub struct MinimalFeatures: FSize, FAlign, FTypeId, FDestroy;
/// }
///
/// struct NotClone(#[allow(dead_code)] Vec<u8>);
/// let rt: RuntimeType<MinimalFeatures> = RuntimeType::make::<NotClone>();
/// assert!(rt.is::<NotClone>());
/// ```
///
/// Listing the same feature twice fails to compile with a conflicting
/// implementation error.
#[macro_export]
macro_rules! feature_list {
    ($(#[$meta:meta])* $vis:vis struct $name:ident: $($feature:ty),+ $(,)?;) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        $vis struct $name;

        impl $crate::runtime_type::FeatureList for $name {
            type Table = $crate::feature_list!(@table $($feature),+);
        }

        impl<ErasedT> $crate::runtime_type::ListOf<ErasedT> for $name
        where
            $($feature: $crate::runtime_type::FeatureOf<ErasedT>,)+
        {
            const TABLE: <Self as $crate::runtime_type::FeatureList>::Table =
                $crate::feature_list!(@entries ErasedT; $($feature),+);
        }

        $crate::feature_list!(@has $name, table, (table); $($feature),+);
    };
    (@table $f:ty) => {
        (<$f as $crate::runtime_type::Feature>::Entry, ())
    };
    (@table $f:ty, $($rest:ty),+) => {
        (<$f as $crate::runtime_type::Feature>::Entry, $crate::feature_list!(@table $($rest),+))
    };
    (@entries $t:ident; $f:ty) => {
        (<$f as $crate::runtime_type::FeatureOf<$t>>::ENTRY, ())
    };
    (@entries $t:ident; $f:ty, $($rest:ty),+) => {
        (
            <$f as $crate::runtime_type::FeatureOf<$t>>::ENTRY,
            $crate::feature_list!(@entries $t; $($rest),+),
        )
    };
    (@has $name:ident, $table:ident, ($($acc:tt)+); $f:ty) => {
        impl $crate::runtime_type::HasFeature<$f> for $name {
            #[inline]
            fn entry(
                $table: &<Self as $crate::runtime_type::FeatureList>::Table,
            ) -> <$f as $crate::runtime_type::Feature>::Entry {
                ($($acc)+).0
            }
        }
    };
    (@has $name:ident, $table:ident, ($($acc:tt)+); $f:ty, $($rest:ty),+) => {
        impl $crate::runtime_type::HasFeature<$f> for $name {
            #[inline]
            fn entry(
                $table: &<Self as $crate::runtime_type::FeatureList>::Table,
            ) -> <$f as $crate::runtime_type::Feature>::Entry {
                ($($acc)+).0
            }
        }
        $crate::feature_list!(@has $name, $table, (($($acc)+).1); $($rest),+);
    };
}

feature_list! {
    /// The default feature set: size, alignment, type identity and
    /// name, destruction, move- and copy-construction. Storable types
    /// must be `Clone + 'static`; use a custom list to lift the
    /// `Clone` requirement.
    pub struct DefaultFeatures: FSize, FAlign, FTypeId, FTypeName, FDestroy,
        FMoveConstruct, FCopyConstruct;
}

// ---------------------------------------------------------------------------
// RuntimeType
// ---------------------------------------------------------------------------

/// A runtime type descriptor: one pointer to a static feature table.
///
/// `RuntimeType` is a word-sized `Copy` value. An *empty* descriptor
/// (no table) is the moved-from/default state; every accessor other
/// than [`is_empty`](Self::is_empty) and [`is`](Self::is) panics on
/// it.
pub struct RuntimeType<L: FeatureList = DefaultFeatures> {
    table: Option<&'static L::Table>,
}

impl<L: FeatureList> RuntimeType<L> {
    /// The empty descriptor.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self { table: None }
    }

    /// The descriptor of `T`.
    #[inline]
    #[must_use]
    pub fn make<T>() -> Self
    where
        L: ListOf<T>,
    {
        Self {
            table: Some(&<L as ListOf<T>>::TABLE),
        }
    }

    /// Whether this descriptor is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_none()
    }

    #[inline]
    fn table(&self) -> &'static L::Table {
        match self.table {
            Some(table) => table,
            None => panic!("operation on an empty runtime type"),
        }
    }

    /// Retrieve a feature entry by tag.
    #[inline]
    pub fn feature<F: Feature>(&self) -> F::Entry
    where
        L: HasFeature<F>,
    {
        <L as HasFeature<F>>::entry(self.table())
    }

    /// Size in bytes of the described type.
    #[inline]
    pub fn size(&self) -> usize
    where
        L: HasFeature<FSize>,
    {
        self.feature::<FSize>()
    }

    /// Alignment in bytes of the described type.
    #[inline]
    pub fn alignment(&self) -> usize
    where
        L: HasFeature<FAlign>,
    {
        self.feature::<FAlign>()
    }

    /// Memory layout of the described type.
    #[inline]
    pub fn layout(&self) -> Layout
    where
        L: HasFeature<FSize> + HasFeature<FAlign>,
    {
        // Size and alignment come from a real Rust type, so they
        // always form a valid layout.
        unsafe { Layout::from_size_align_unchecked(self.size(), self.alignment()) }
    }

    /// The [`TypeId`] of the described type.
    #[inline]
    pub fn type_id(&self) -> TypeId
    where
        L: HasFeature<FTypeId>,
    {
        (self.feature::<FTypeId>())()
    }

    /// The diagnostic name of the described type.
    #[inline]
    pub fn type_name(&self) -> &'static str
    where
        L: HasFeature<FTypeName>,
    {
        (self.feature::<FTypeName>())()
    }

    /// Whether this descriptor describes exactly `T`. An empty
    /// descriptor matches no type.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool
    where
        L: HasFeature<FTypeId>,
    {
        !self.is_empty() && self.type_id() == TypeId::of::<T>()
    }

    /// Destroy the value at `obj` in place. Never unwinds.
    ///
    /// # Safety
    ///
    /// `obj` must point to a live value of the described type; the
    /// value must not be used afterwards.
    #[inline]
    pub unsafe fn destroy(&self, obj: *mut u8)
    where
        L: HasFeature<FDestroy>,
    {
        unsafe { (self.feature::<FDestroy>())(obj) }
    }

    /// Move-construct from `src` into `dst`. Never unwinds.
    ///
    /// # Safety
    ///
    /// `dst` must be valid, suitably aligned uninitialized storage;
    /// `src` must hold a live value of the described type, considered
    /// moved-from afterwards.
    #[inline]
    pub unsafe fn move_construct(&self, dst: *mut u8, src: *mut u8)
    where
        L: HasFeature<FMoveConstruct>,
    {
        unsafe { (self.feature::<FMoveConstruct>())(dst, src) }
    }

    /// Copy-construct from `src` into `dst`. May unwind.
    ///
    /// # Safety
    ///
    /// `dst` must be valid, suitably aligned uninitialized storage;
    /// `src` must hold a live value of the described type.
    #[inline]
    pub unsafe fn copy_construct(&self, dst: *mut u8, src: *const u8)
    where
        L: HasFeature<FCopyConstruct>,
    {
        unsafe { (self.feature::<FCopyConstruct>())(dst, src) }
    }

    /// Default-construct a value into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid, suitably aligned uninitialized storage.
    #[inline]
    pub unsafe fn default_construct(&self, dst: *mut u8)
    where
        L: HasFeature<FDefaultConstruct>,
    {
        unsafe { (self.feature::<FDefaultConstruct>())(dst) }
    }

    /// Compare two erased values of the described type.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to live values of the described type.
    #[inline]
    pub unsafe fn are_equal(&self, a: *const u8, b: *const u8) -> bool
    where
        L: HasFeature<FEqual>,
    {
        unsafe { (self.feature::<FEqual>())(a, b) }
    }

    /// Hash an erased value of the described type.
    ///
    /// # Safety
    ///
    /// `obj` must refer to a live value of the described type.
    #[inline]
    pub unsafe fn hash(&self, obj: *const u8) -> u64
    where
        L: HasFeature<FHash>,
    {
        unsafe { (self.feature::<FHash>())(obj) }
    }
}

impl<L: FeatureList> Clone for RuntimeType<L> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: FeatureList> Copy for RuntimeType<L> {}

impl<L: FeatureList> Default for RuntimeType<L> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Equality of descriptors. Table-pointer identity is the fast path;
/// distinct table instances for the same type (the compiler may
/// duplicate promoted statics across codegen units) fall back to the
/// type id, so equal types always compare equal.
impl<L> PartialEq for RuntimeType<L>
where
    L: FeatureList + HasFeature<FTypeId>,
{
    fn eq(&self, other: &Self) -> bool {
        match (self.table, other.table) {
            (Some(a), Some(b)) => ptr::eq(a, b) || self.type_id() == other.type_id(),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<L> Eq for RuntimeType<L> where L: FeatureList + HasFeature<FTypeId> {}

impl<L> fmt::Debug for RuntimeType<L>
where
    L: FeatureList + HasFeature<FTypeName>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table {
            Some(_) => write!(f, "RuntimeType({})", self.type_name()),
            None => write!(f, "RuntimeType(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_size_and_alignment() {
        let rt: RuntimeType = RuntimeType::make::<u64>();
        assert_eq!(rt.size(), 8);
        assert_eq!(rt.alignment(), 8);
        assert_eq!(rt.layout(), Layout::new::<u64>());
    }

    #[test]
    fn test_identity() {
        let a: RuntimeType = RuntimeType::make::<String>();
        let b: RuntimeType = RuntimeType::make::<String>();
        let c: RuntimeType = RuntimeType::make::<u32>();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is::<String>());
        assert!(!a.is::<u32>());
        assert!(a.type_name().contains("String"));
    }

    #[test]
    fn test_empty() {
        let rt: RuntimeType = RuntimeType::empty();
        assert!(rt.is_empty());
        assert!(!rt.is::<u32>());
        assert_eq!(rt, RuntimeType::empty());
        assert_ne!(rt, RuntimeType::make::<u32>());
    }

    #[test]
    #[should_panic(expected = "empty runtime type")]
    fn test_empty_accessor_panics() {
        let rt: RuntimeType = RuntimeType::empty();
        let _ = rt.size();
    }

    #[test]
    fn test_copy_and_destroy() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Clone)]
        struct Tracked(#[allow(dead_code)] u32);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let rt: RuntimeType = RuntimeType::make::<Tracked>();
        let src = Tracked(7);
        let mut dst = MaybeUninit::<Tracked>::uninit();
        unsafe {
            rt.copy_construct(dst.as_mut_ptr().cast(), (&src as *const Tracked).cast());
            rt.destroy(dst.as_mut_ptr().cast());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        drop(src);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_move_construct() {
        let rt: RuntimeType = RuntimeType::make::<String>();
        let mut src = String::from("moved");
        let mut dst = MaybeUninit::<String>::uninit();
        unsafe {
            rt.move_construct(dst.as_mut_ptr().cast(), (&mut src as *mut String).cast());
            let out = dst.assume_init();
            assert_eq!(out, "moved");
            core::mem::forget(src);
        }
    }

    feature_list! {
        struct RichFeatures: FSize, FAlign, FTypeId, FDestroy,
            FMoveConstruct, FCopyConstruct, FDefaultConstruct, FEqual, FHash;
    }

    #[test]
    fn test_default_equal_hash_features() {
        let rt: RuntimeType<RichFeatures> = RuntimeType::make::<u64>();
        let mut slot = MaybeUninit::<u64>::uninit();
        unsafe {
            rt.default_construct(slot.as_mut_ptr().cast());
            assert_eq!(slot.assume_init(), 0);
            let a = 5u64;
            let b = 5u64;
            let c = 9u64;
            assert!(rt.are_equal((&a as *const u64).cast(), (&b as *const u64).cast()));
            assert!(!rt.are_equal((&a as *const u64).cast(), (&c as *const u64).cast()));
            assert_eq!(
                rt.hash((&a as *const u64).cast()),
                rt.hash((&b as *const u64).cast())
            );
        }
    }

    feature_list! {
        struct NoCopyFeatures: FSize, FAlign, FTypeId, FDestroy, FMoveConstruct;
    }

    #[test]
    fn test_non_clone_type_with_custom_list() {
        struct Opaque(#[allow(dead_code)] Vec<u8>);
        let rt: RuntimeType<NoCopyFeatures> = RuntimeType::make::<Opaque>();
        assert_eq!(rt.size(), core::mem::size_of::<Opaque>());
        assert!(rt.is::<Opaque>());
    }

    #[test]
    fn test_descriptor_is_word_sized() {
        assert_eq!(
            core::mem::size_of::<RuntimeType<DefaultFeatures>>(),
            core::mem::size_of::<usize>()
        );
    }
}
