//! Type-specialized executor cache.
//!
//! Each machine code carries a small direct-mapped cache of executors
//! compiled for a specific receiver class shape. Dispatch compares the
//! receiver's packed class data (class id + shape serial) against each
//! slot with a single load; a serial bump on the class makes stale
//! entries miss without any invalidation walk.

use crate::dispatch::{Executor, ExecutorCell};
use beryl_core::{Value, ValueCell};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed cache capacity.
pub const MAX_SPECIALIZATIONS: usize = 8;

/// Outcome of installing a specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed into an empty or same-class slot.
    Installed,
    /// Cache was full; slot 0 was overwritten.
    Evicted,
}

/// One cache slot.
///
/// `class_data` of zero marks the slot empty. The packed word is stored
/// last with release ordering so a reader that matches it also observes
/// the executor and runtime data stored before it.
pub(crate) struct SpecializationSlot {
    class_data: AtomicU64,
    execute: ExecutorCell,
    jit_data: ValueCell,
}

impl SpecializationSlot {
    fn empty() -> SpecializationSlot {
        SpecializationSlot {
            class_data: AtomicU64::new(0),
            execute: ExecutorCell::empty(),
            jit_data: ValueCell::nil(),
        }
    }
}

/// The per-code specialization cache.
pub struct SpecializationCache {
    slots: [SpecializationSlot; MAX_SPECIALIZATIONS],
}

impl SpecializationCache {
    /// An empty cache.
    pub fn new() -> SpecializationCache {
        SpecializationCache {
            slots: std::array::from_fn(|_| SpecializationSlot::empty()),
        }
    }

    /// Look up the executor for packed class data. No side effects.
    pub fn find(&self, class_data: u64) -> Option<Executor> {
        for slot in self.slots.iter() {
            if slot.class_data.load(Ordering::Acquire) == class_data {
                if let Some(executor) = slot.execute.load() {
                    return Some(executor);
                }
            }
        }
        None
    }

    /// Install an executor for `(class_id, serial)`.
    ///
    /// Scans for the first empty slot or a slot already bound to the
    /// same class id (re-specialization after a serial bump replaces the
    /// stale entry). A full cache overwrites slot 0 — a coarse stand-in
    /// for an LRU policy.
    pub(crate) fn install(
        &self,
        class_id: u32,
        serial: u32,
        executor: Executor,
        jit_data: Value,
    ) -> InstallOutcome {
        let packed = ((serial as u64) << 32) | class_id as u64;

        let mut index = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let id = slot.class_data.load(Ordering::Acquire) as u32;
            if id == 0 || id == class_id {
                index = Some(i);
                break;
            }
        }

        let (i, outcome) = match index {
            Some(i) => (i, InstallOutcome::Installed),
            None => (0, InstallOutcome::Evicted),
        };

        let slot = &self.slots[i];
        // Invalidate first so a concurrent reader never pairs the new
        // key with the old executor.
        slot.class_data.store(0, Ordering::Release);
        slot.execute.store(executor);
        slot.jit_data.set(jit_data);
        slot.class_data.store(packed, Ordering::Release);
        outcome
    }

    /// True when at least one slot is free.
    pub fn has_empty_slot(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.class_data.load(Ordering::Acquire) == 0)
    }

    /// True when no specialization has ever been installed.
    pub fn is_unused(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.class_data.load(Ordering::Acquire) == 0)
    }

    /// Number of occupied slots.
    pub fn occupancy(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.class_data.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Visit each occupied slot's runtime-data cell (GC marking).
    pub(crate) fn each_jit_data<F>(&self, mut f: F)
    where
        F: FnMut(&ValueCell),
    {
        for slot in self.slots.iter() {
            if slot.class_data.load(Ordering::Acquire) != 0 {
                f(&slot.jit_data);
            }
        }
    }
}

impl Default for SpecializationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpecializationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecializationCache")
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
