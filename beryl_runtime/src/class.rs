//! Class identity and the class registry.
//!
//! Specialized executors are keyed on *class data*: the pair of a class's
//! stable id and its current shape serial. Redefining, aliasing, or
//! removing a method bumps the serial, so specializations compiled
//! against the old shape stop matching without any eager invalidation
//! walk.

use crate::method_table::{MethodTable, Visibility};
use beryl_core::{Symbol, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Identity
// =============================================================================

/// Stable identifier of a class or module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Reserved: never assigned to a class. Specialization caches use a
    /// zero class id as their empty-slot sentinel.
    pub const NONE: ClassId = ClassId(0);
    /// The root object class.
    pub const OBJECT: ClassId = ClassId(1);
    /// Built-in small integers.
    pub const FIXNUM: ClassId = ClassId(2);
    /// Built-in symbols.
    pub const SYMBOL: ClassId = ClassId(3);
    /// The nil singleton's class.
    pub const NIL: ClassId = ClassId(4);
    /// Booleans.
    pub const BOOLEAN: ClassId = ClassId(5);
    /// First id handed to user-defined classes.
    pub const FIRST_USER: u32 = 8;

    /// Raw id.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A class identity together with its current shape version.
///
/// Packs into a single `u64` (`serial << 32 | class_id`) so dispatch can
/// compare a receiver's class data against a specialization slot with one
/// load and one compare. Raw zero never matches a real class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassData {
    /// The class id.
    pub class_id: u32,
    /// The shape serial at capture time.
    pub serial: u32,
}

impl ClassData {
    /// Build class data from its parts.
    #[inline]
    pub const fn new(class_id: u32, serial: u32) -> ClassData {
        ClassData { class_id, serial }
    }

    /// The packed word.
    #[inline]
    pub const fn raw(self) -> u64 {
        ((self.serial as u64) << 32) | self.class_id as u64
    }

    /// Unpack from the packed word.
    #[inline]
    pub const fn from_raw(raw: u64) -> ClassData {
        ClassData {
            class_id: raw as u32,
            serial: (raw >> 32) as u32,
        }
    }
}

// =============================================================================
// Class
// =============================================================================

/// A class: a name, a method table, an optional superclass, and the
/// versioned identity dispatch keys on.
#[derive(Debug)]
pub struct Class {
    name: Symbol,
    data: AtomicU64,
    method_table: Arc<MethodTable>,
    superclass: Option<ClassId>,
}

impl Class {
    /// Create a class with a fresh method table. Serial starts at 1 so a
    /// freshly created class never collides with the empty-slot sentinel.
    pub fn new(name: Symbol, id: ClassId, superclass: Option<ClassId>) -> Class {
        Class {
            name,
            data: AtomicU64::new(ClassData::new(id.raw(), 1).raw()),
            method_table: Arc::new(MethodTable::new()),
            superclass,
        }
    }

    /// The class name.
    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// Current class data (id + serial).
    #[inline]
    pub fn data(&self) -> ClassData {
        ClassData::from_raw(self.data.load(Ordering::Acquire))
    }

    /// The stable class id.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        ClassId(self.data().class_id)
    }

    /// The superclass, if any.
    #[inline]
    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass
    }

    /// This class's method table.
    #[inline]
    pub fn method_table(&self) -> &Arc<MethodTable> {
        &self.method_table
    }

    /// Advance the shape serial, invalidating specializations keyed on
    /// the previous shape.
    #[inline]
    pub fn bump_serial(&self) {
        self.data.fetch_add(1u64 << 32, Ordering::AcqRel);
    }

    /// Define or redefine a method and bump the shape serial.
    pub fn define_method(&self, name: Symbol, method: Value, visibility: Visibility) {
        self.method_table
            .store(name, Value::nil(), method, Value::nil(), 0, visibility);
        self.bump_serial();
    }

    /// Mark a name as explicitly removed for dispatch. The bucket stays
    /// in place with `undef` visibility so lookup stops at this class
    /// instead of continuing into ancestors.
    pub fn undef_method(&self, name: Symbol) {
        self.method_table.store(
            name,
            Value::nil(),
            Value::undef(),
            Value::nil(),
            0,
            Visibility::Undef,
        );
        self.bump_serial();
    }

    /// Unlink a method, bumping the serial when something was removed.
    pub fn remove_method(&self, name: Symbol) -> Option<Value> {
        let removed = self.method_table.remove(name);
        if removed.is_some() {
            self.bump_serial();
        }
        removed
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A resolved method binding from an ancestry walk.
#[derive(Debug, Clone, Copy)]
pub struct MethodEntry {
    /// The materialized method object.
    pub method: Value,
    /// Visibility at the defining class.
    pub visibility: Visibility,
    /// The class whose table bound the name.
    pub defining: ClassId,
}

/// Registry mapping class ids to classes.
///
/// This is the module resolver `alias` walks: it knows each class's
/// method table and superclass link.
pub struct ClassRegistry {
    classes: RwLock<FxHashMap<ClassId, Arc<Class>>>,
    next_id: AtomicU32,
}

impl ClassRegistry {
    /// Create a registry seeded with the built-in classes.
    pub fn new() -> ClassRegistry {
        let registry = ClassRegistry {
            classes: RwLock::new(FxHashMap::default()),
            next_id: AtomicU32::new(ClassId::FIRST_USER),
        };
        for (name, id, superclass) in [
            ("Object", ClassId::OBJECT, None),
            ("Fixnum", ClassId::FIXNUM, Some(ClassId::OBJECT)),
            ("Symbol", ClassId::SYMBOL, Some(ClassId::OBJECT)),
            ("NilClass", ClassId::NIL, Some(ClassId::OBJECT)),
            ("Boolean", ClassId::BOOLEAN, Some(ClassId::OBJECT)),
        ] {
            registry.insert(Arc::new(Class::new(beryl_core::intern(name), id, superclass)));
        }
        registry
    }

    fn insert(&self, class: Arc<Class>) {
        self.classes.write().insert(class.class_id(), class);
    }

    /// Create and register a user-defined class.
    pub fn new_class(&self, name: Symbol, superclass: Option<ClassId>) -> Arc<Class> {
        let id = ClassId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let class = Arc::new(Class::new(name, id, superclass.or(Some(ClassId::OBJECT))));
        self.insert(Arc::clone(&class));
        class
    }

    /// Look up a class by id.
    #[inline]
    pub fn get(&self, id: ClassId) -> Option<Arc<Class>> {
        self.classes.read().get(&id).cloned()
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    /// Whether no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The method-table chain accessor `MethodTable::alias` resolves
    /// through.
    pub fn chain(&self) -> impl FnMut(ClassId) -> Option<(Arc<MethodTable>, Option<ClassId>)> + '_ {
        move |id| {
            let class = self.get(id)?;
            Some((Arc::clone(class.method_table()), class.superclass()))
        }
    }

    /// Resolve a method by walking the ancestry from `start`.
    ///
    /// An `undef` bucket terminates the walk with no result; the name was
    /// explicitly removed at that level.
    pub fn lookup_method(&self, start: ClassId, name: Symbol) -> Option<MethodEntry> {
        let mut current = Some(start);
        while let Some(id) = current {
            let class = self.get(id)?;
            if let Some(bucket) = class.method_table().lookup(name) {
                if bucket.is_undef() {
                    return None;
                }
                return Some(MethodEntry {
                    method: bucket.method(),
                    visibility: bucket.visibility(),
                    defining: id,
                });
            }
            current = class.superclass();
        }
        None
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
