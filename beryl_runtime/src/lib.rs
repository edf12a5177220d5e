//! Runtime object model for Beryl: class identity and method tables.
//!
//! This crate owns the class-side half of method dispatch:
//!
//! - **Method tables** ([`MethodTable`]): concurrently readable,
//!   serially mutated hash tables binding method names to executable
//!   artifacts, one per class or module.
//! - **Class identity** ([`ClassData`]): the (class id, shape serial)
//!   pair specialized executors key on, and the [`ClassRegistry`] that
//!   resolves ids to classes and walks inheritance for aliasing.
//!
//! The code-object side (compiled code, machine code, specialization
//! caches) lives in `beryl_vm` and consumes these types.
//!
//! # Concurrency Model
//!
//! Method lookup is lock-free and may run from any thread; every
//! mutating operation serializes on the owning table's mutex. See the
//! [`method_table`] module docs for the publication protocol.

#![warn(missing_docs)]

pub mod class;
pub mod method_table;

pub use class::{Class, ClassData, ClassId, ClassRegistry, MethodEntry};
pub use method_table::{AliasError, Bucket, MethodTable, Visibility, MIN_BINS};
