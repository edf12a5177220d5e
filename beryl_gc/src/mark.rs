//! Marking callback interface.

use beryl_core::Value;

/// Callback handed to objects while the collector walks the heap.
///
/// The collector calls an object's mark hook, which presents each owned
/// reference through this interface. Marking runs with mutators stopped,
/// so hooks may rewrite relocated references in place.
///
/// # Implementation Notes
///
/// Implementations may:
/// - Add referenced objects to a mark worklist
/// - Relocate objects and return the forwarded reference
/// - Record write-barrier updates via `just_set`
pub trait ObjectMark {
    /// Visit one reference.
    ///
    /// Returns `Some(relocated)` when the collector moved the referent;
    /// the caller must write the relocated reference back into the slot
    /// it was loaded from and report the store via [`ObjectMark::just_set`].
    /// Non-reference values (nil, fixnums, booleans) are presented too and
    /// should be ignored by the implementation.
    fn mark_value(&mut self, value: Value) -> Option<Value>;

    /// Write-barrier notification: `container` had `value` stored into
    /// one of its slots during marking.
    fn just_set(&mut self, container: *const (), value: Value);
}

/// A mark callback that does nothing (for testing).
pub struct NullMark;

impl ObjectMark for NullMark {
    #[inline]
    fn mark_value(&mut self, _value: Value) -> Option<Value> {
        None
    }

    #[inline]
    fn just_set(&mut self, _container: *const (), _value: Value) {}
}

/// A counting mark callback for debugging and statistics.
pub struct CountingMark {
    /// Number of values presented.
    pub visited: usize,
    /// Number of `just_set` notifications received.
    pub stores: usize,
}

impl CountingMark {
    /// Create a new counting callback.
    pub fn new() -> Self {
        Self {
            visited: 0,
            stores: 0,
        }
    }
}

impl Default for CountingMark {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectMark for CountingMark {
    fn mark_value(&mut self, _value: Value) -> Option<Value> {
        self.visited += 1;
        None
    }

    fn just_set(&mut self, _container: *const (), _value: Value) {
        self.stores += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_mark_never_relocates() {
        let mut mark = NullMark;
        assert!(mark.mark_value(Value::object(12)).is_none());
    }

    #[test]
    fn test_counting_mark() {
        let mut mark = CountingMark::new();
        mark.mark_value(Value::nil());
        mark.mark_value(Value::object(1));
        mark.just_set(std::ptr::null(), Value::object(1));
        assert_eq!(mark.visited, 2);
        assert_eq!(mark.stores, 1);
    }
}
