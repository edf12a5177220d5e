//! Per-class method tables.
//!
//! A `MethodTable` binds method names to executable artifacts for one
//! class or module. It sits on the critical path of every method call,
//! so the design is asymmetric: lookups are lock-free and may run from
//! any thread at any time, while mutations (store, alias, remove,
//! resize) serialize on a per-table mutex.
//!
//! # Concurrency
//!
//! The bin array is published through an atomic pointer. Readers take an
//! acquire snapshot of the array, derive the bin count from the snapshot
//! itself, and walk a forward-linked bucket chain; writers prepend new
//! buckets and publish with release stores, so a chain a reader captured
//! is always fully initialized. A lookup racing a store may observe the
//! old or the new binding, and a lookup racing a resize may miss a name
//! that was concurrently rehashed; both are admissible stale results,
//! never torn ones.
//!
//! The table exclusively owns its buckets. Unlinked buckets and
//! superseded bin arrays are retired to a graveyard and freed when the
//! table drops, so a reader holding `&MethodTable` can never observe a
//! dangling chain. Retired memory is bounded: arrays only ever double,
//! and removals are rare next to lookups.

use crate::class::ClassId;
use beryl_core::{Symbol, Value, ValueCell};
use beryl_gc::ObjectMark;
use parking_lot::Mutex;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Minimum bin count; `create` never goes below this.
pub const MIN_BINS: usize = 16;

// =============================================================================
// Visibility
// =============================================================================

/// Dispatch visibility of a method-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Visibility {
    /// Callable from anywhere.
    Public = 0,
    /// Callable only with an implicit receiver.
    Private = 1,
    /// Callable only from instances of the defining class tree.
    Protected = 2,
    /// Explicitly removed for dispatch; the bucket still occupies its name.
    Undef = 3,
}

impl Visibility {
    #[inline]
    fn from_u8(raw: u8) -> Visibility {
        match raw {
            0 => Visibility::Public,
            1 => Visibility::Private,
            2 => Visibility::Protected,
            _ => Visibility::Undef,
        }
    }
}

// =============================================================================
// Bucket
// =============================================================================

/// One name binding in a method table.
///
/// Buckets chain forward through `next` within a bin; they never point
/// back at the table. All mutable fields are single pointer-sized atomic
/// slots, so a lock-free reader sees each field untorn.
pub struct Bucket {
    name: Symbol,
    visibility: AtomicU8,
    method_id: ValueCell,
    method: ValueCell,
    scope: ValueCell,
    serial: AtomicU64,
    next: AtomicPtr<Bucket>,
}

impl Bucket {
    fn new(
        name: Symbol,
        method_id: Value,
        method: Value,
        scope: Value,
        serial: u64,
        visibility: Visibility,
    ) -> Bucket {
        Bucket {
            name,
            visibility: AtomicU8::new(visibility as u8),
            method_id: ValueCell::new(method_id),
            method: ValueCell::new(method),
            scope: ValueCell::new(scope),
            serial: AtomicU64::new(serial),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The bound name.
    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// Current visibility.
    #[inline]
    pub fn visibility(&self) -> Visibility {
        Visibility::from_u8(self.visibility.load(Ordering::Acquire))
    }

    /// The late-bind token identifying the method artifact.
    #[inline]
    pub fn method_id(&self) -> Value {
        self.method_id.get()
    }

    /// The materialized method object. May be the installable token
    /// itself, a block of compiled code, or a sentinel.
    #[inline]
    pub fn method(&self) -> Value {
        self.method.get()
    }

    /// The scope the method was defined under.
    #[inline]
    pub fn scope(&self) -> Value {
        self.scope.get()
    }

    /// The method's serial number.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Whether the entry is publicly callable.
    #[inline]
    pub fn is_public(&self) -> bool {
        self.visibility() == Visibility::Public
    }

    /// Whether the entry is private.
    #[inline]
    pub fn is_private(&self) -> bool {
        self.visibility() == Visibility::Private
    }

    /// Whether the entry is protected.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.visibility() == Visibility::Protected
    }

    /// Whether the name has been explicitly undefined.
    #[inline]
    pub fn is_undef(&self) -> bool {
        self.visibility() == Visibility::Undef
    }

    /// True when the bucket binds something dispatch can install: a
    /// materialized method that is neither absent nor the undef sentinel.
    #[inline]
    pub fn is_resolvable(&self) -> bool {
        let method = self.method();
        !method.is_nil() && !method.is_undef() && !self.is_undef()
    }

    fn overwrite(
        &self,
        method_id: Value,
        method: Value,
        scope: Value,
        serial: u64,
        visibility: Visibility,
    ) {
        self.method_id.set(method_id);
        self.method.set(method);
        self.scope.set(scope);
        self.serial.store(serial, Ordering::Release);
        self.visibility.store(visibility as u8, Ordering::Release);
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("visibility", &self.visibility())
            .field("method", &self.method())
            .field("serial", &self.serial())
            .finish()
    }
}

// =============================================================================
// Bin array
// =============================================================================

/// A published generation of the table: one atomic chain head per bin.
struct BinArray {
    slots: Box<[AtomicPtr<Bucket>]>,
}

impl BinArray {
    fn alloc(bins: usize) -> *mut BinArray {
        debug_assert!(bins.is_power_of_two());
        let slots = (0..bins)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(BinArray { slots }))
    }
}

/// Unlinked buckets and superseded arrays, freed when the table drops.
#[derive(Default)]
struct Graveyard {
    buckets: Vec<*mut Bucket>,
    arrays: Vec<*mut BinArray>,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to resolve an alias target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasError {
    /// No module in the chain binds the name to a resolvable method.
    NoSuchMethod {
        /// The name that failed to resolve.
        name: Symbol,
    },
    /// The name was found but has been explicitly undefined.
    Undefined {
        /// The undefined name.
        name: Symbol,
    },
}

impl fmt::Display for AliasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasError::NoSuchMethod { name } => {
                write!(f, "undefined method `{}` to alias", name)
            }
            AliasError::Undefined { name } => {
                write!(f, "method `{}` has been undefined", name)
            }
        }
    }
}

impl std::error::Error for AliasError {}

// =============================================================================
// MethodTable
// =============================================================================

/// A concurrently readable, serially mutated name → bucket table.
pub struct MethodTable {
    values: AtomicPtr<BinArray>,
    entries: AtomicUsize,
    lock: Mutex<()>,
    retired: Mutex<Graveyard>,
}

// SAFETY: all shared state is reached through atomics; mutation is
// serialized by `lock`; bucket and array storage outlives every shared
// borrow because retirement defers frees to drop, which takes `&mut self`.
unsafe impl Send for MethodTable {}
unsafe impl Sync for MethodTable {}

impl MethodTable {
    /// Create a table with at least `size` bins, rounded up to a power
    /// of two and never below [`MIN_BINS`].
    pub fn create(size: usize) -> MethodTable {
        let bins = size.max(MIN_BINS).next_power_of_two();
        MethodTable {
            values: AtomicPtr::new(BinArray::alloc(bins)),
            entries: AtomicUsize::new(0),
            lock: Mutex::new(()),
            retired: Mutex::new(Graveyard::default()),
        }
    }

    /// Create a table with the default bin count.
    pub fn new() -> MethodTable {
        Self::create(MIN_BINS)
    }

    /// Current bin count.
    #[inline]
    pub fn bins(&self) -> usize {
        self.array().slots.len()
    }

    /// Number of live buckets.
    #[inline]
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    #[inline]
    fn array(&self) -> &BinArray {
        // SAFETY: the pointer is always a live BinArray; superseded
        // arrays are retired, not freed, until the table drops.
        unsafe { &*self.values.load(Ordering::Acquire) }
    }

    #[inline]
    fn bin_index(name: Symbol, bins: usize) -> usize {
        (name.hash_code() as usize) & (bins - 1)
    }

    /// Lock-free chain walk. Internal code paths that must bypass
    /// automatic method promotion use this directly.
    pub fn find_entry(&self, name: Symbol) -> Option<&Bucket> {
        let array = self.array();
        let idx = Self::bin_index(name, array.slots.len());
        let mut cur = array.slots[idx].load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: buckets live until the table drops; `&self` pins it.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                return Some(bucket);
            }
            cur = bucket.next.load(Ordering::Acquire);
        }
        None
    }

    /// Look up a name. Lock-free; may be called from any thread and may
    /// return a result that a concurrent mutation has already superseded.
    #[inline]
    pub fn lookup(&self, name: Symbol) -> Option<&Bucket> {
        self.find_entry(name)
    }

    /// Whether the table holds a bucket for `name` (including `undef`
    /// placeholders).
    #[inline]
    pub fn has_name(&self, name: Symbol) -> bool {
        self.find_entry(name).is_some()
    }

    /// Bind `name`, overwriting in place when the name already exists.
    ///
    /// New buckets are prepended to their chain so buckets a concurrent
    /// reader already reached stay reachable through `next`. Triggers a
    /// doubling resize when the load factor hits 1.0.
    pub fn store(
        &self,
        name: Symbol,
        method_id: Value,
        method: Value,
        scope: Value,
        serial: u64,
        visibility: Visibility,
    ) {
        let _guard = self.lock.lock();
        let array = self.array();
        let idx = Self::bin_index(name, array.slots.len());

        let mut cur = array.slots[idx].load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: see `find_entry`.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                // Same name: update in place, preserving chain position.
                bucket.overwrite(method_id, method, scope, serial, visibility);
                return;
            }
            cur = bucket.next.load(Ordering::Acquire);
        }

        let bucket = Box::into_raw(Box::new(Bucket::new(
            name, method_id, method, scope, serial, visibility,
        )));
        // SAFETY: the bucket is not yet published; plain init of `next`.
        unsafe {
            (*bucket)
                .next
                .store(array.slots[idx].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        array.slots[idx].store(bucket, Ordering::Release);

        let entries = self.entries.fetch_add(1, Ordering::AcqRel) + 1;
        if entries >= array.slots.len() {
            self.resize(array.slots.len() * 2);
        }
    }

    /// Install `new_name` as an alias of `orig_name`.
    ///
    /// Resolution walks the originating module's method table and its
    /// ancestors through `chain`, which maps a module to its table and
    /// parent, until a bucket binding a resolvable method is found. When
    /// no module resolves the name, a caller-materialized `orig_method`
    /// is accepted as the artifact; otherwise the alias fails.
    pub fn alias<F>(
        &self,
        new_name: Symbol,
        visibility: Visibility,
        orig_name: Symbol,
        orig_method: Value,
        orig_module: ClassId,
        mut chain: F,
    ) -> Result<(), AliasError>
    where
        F: FnMut(ClassId) -> Option<(Arc<MethodTable>, Option<ClassId>)>,
    {
        let mut module = Some(orig_module);
        let mut resolved: Option<(Value, Value, u64)> = None;

        while let Some(id) = module {
            let Some((table, superclass)) = chain(id) else {
                break;
            };
            if let Some(bucket) = table.find_entry(orig_name) {
                if bucket.is_undef() {
                    return Err(AliasError::Undefined { name: orig_name });
                }
                // A materialized method or a still-pending install token
                // both count as a resolvable artifact.
                if bucket.is_resolvable() || !bucket.method_id().is_nil() {
                    resolved = Some((bucket.method_id(), bucket.method(), bucket.serial()));
                    break;
                }
            }
            module = superclass;
        }

        let (method_id, method, serial) = match resolved {
            Some(found) => found,
            None if !orig_method.is_nil() && !orig_method.is_undef() => {
                (Value::nil(), orig_method, 0)
            }
            None => return Err(AliasError::NoSuchMethod { name: orig_name }),
        };

        self.store(new_name, method_id, method, Value::nil(), serial, visibility);
        Ok(())
    }

    /// Unlink `name`, returning its prior method slot.
    pub fn remove(&self, name: Symbol) -> Option<Value> {
        let _guard = self.lock.lock();
        let array = self.array();
        let idx = Self::bin_index(name, array.slots.len());

        let mut prev: *mut Bucket = ptr::null_mut();
        let mut cur = array.slots[idx].load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: see `find_entry`.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                let next = bucket.next.load(Ordering::Acquire);
                if prev.is_null() {
                    array.slots[idx].store(next, Ordering::Release);
                } else {
                    // SAFETY: prev was reached through this chain under the lock.
                    unsafe { &*prev }.next.store(next, Ordering::Release);
                }
                self.entries.fetch_sub(1, Ordering::AcqRel);
                let method = bucket.method();
                // Keep the bucket's own `next` intact: a reader paused on
                // it must still be able to finish its walk.
                self.retired.lock().buckets.push(cur);
                return Some(method);
            }
            prev = cur;
            cur = bucket.next.load(Ordering::Acquire);
        }
        None
    }

    /// Deep copy: a fresh table of the same bin count holding equivalent
    /// buckets. The duplicate shares no storage with the source.
    pub fn duplicate(&self) -> MethodTable {
        let _guard = self.lock.lock();
        let array = self.array();
        let dup = MethodTable::create(array.slots.len());
        for slot in array.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: see `find_entry`.
                let bucket = unsafe { &*cur };
                dup.store(
                    bucket.name,
                    bucket.method_id(),
                    bucket.method(),
                    bucket.scope(),
                    bucket.serial(),
                    bucket.visibility(),
                );
                cur = bucket.next.load(Ordering::Acquire);
            }
        }
        dup
    }

    /// Visit every bucket in the current generation.
    ///
    /// Lock-free like `lookup`; concurrent mutation may add or drop
    /// entries from the walk.
    pub fn each_entry<F>(&self, mut f: F)
    where
        F: FnMut(&Bucket),
    {
        let array = self.array();
        for slot in array.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: see `find_entry`.
                let bucket = unsafe { &*cur };
                f(bucket);
                cur = bucket.next.load(Ordering::Acquire);
            }
        }
    }

    /// Mark hook: present every bucket's owned references and write back
    /// relocations. Runs with mutators stopped.
    pub fn mark(&self, marker: &mut dyn ObjectMark) {
        let container = self as *const MethodTable as *const ();
        self.each_entry(|bucket| {
            for cell in [&bucket.method_id, &bucket.method, &bucket.scope] {
                if let Some(moved) = marker.mark_value(cell.get()) {
                    cell.set(moved);
                    marker.just_set(container, moved);
                }
            }
        });
    }

    /// Rehash into a doubled bin array and publish it.
    ///
    /// Bucket storage is reused; only `next` links are rewritten. Readers
    /// still walking the superseded array may see a spliced chain and
    /// miss a name; that reads as a stale (not torn) result, and the old
    /// array itself stays alive in the graveyard.
    fn resize(&self, new_bins: usize) {
        let old_ptr = self.values.load(Ordering::Acquire);
        // SAFETY: writer-exclusive under the table lock.
        let old = unsafe { &*old_ptr };
        let new_ptr = BinArray::alloc(new_bins);
        let new = unsafe { &*new_ptr };

        for slot in old.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: see `find_entry`.
                let bucket = unsafe { &*cur };
                let next = bucket.next.load(Ordering::Acquire);
                let idx = Self::bin_index(bucket.name, new_bins);
                bucket
                    .next
                    .store(new.slots[idx].load(Ordering::Relaxed), Ordering::Relaxed);
                new.slots[idx].store(cur, Ordering::Release);
                cur = next;
            }
        }

        self.values.store(new_ptr, Ordering::Release);
        self.retired.lock().arrays.push(old_ptr);
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MethodTable {
    fn drop(&mut self) {
        let array_ptr = *self.values.get_mut();
        // SAFETY: `&mut self` guarantees no readers remain; every live
        // bucket is reachable from exactly one chain of the current
        // array, and retired buckets were unlinked from it.
        unsafe {
            let array = &*array_ptr;
            for slot in array.slots.iter() {
                let mut cur = slot.load(Ordering::Relaxed);
                while !cur.is_null() {
                    let next = (*cur).next.load(Ordering::Relaxed);
                    drop(Box::from_raw(cur));
                    cur = next;
                }
            }
            drop(Box::from_raw(array_ptr));

            let retired = self.retired.get_mut();
            for &bucket in retired.buckets.iter() {
                drop(Box::from_raw(bucket));
            }
            for &old_array in retired.arrays.iter() {
                drop(Box::from_raw(old_array));
            }
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("bins", &self.bins())
            .field("entries", &self.entries())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
