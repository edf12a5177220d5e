//! Collector-facing interfaces for the Beryl runtime.
//!
//! The collector itself lives outside this workspace; what runtime
//! objects need is the narrow contract they are marked through. This
//! crate defines that contract ([`ObjectMark`]) together with the no-op
//! and counting helpers tests build on.
//!
//! # Protocol
//!
//! During a stop-the-world mark phase the collector invokes each live
//! object's mark hook. The hook presents every owned reference via
//! [`ObjectMark::mark_value`]; when the collector relocates a referent it
//! returns the forwarded reference, which the hook writes back into the
//! owning slot and reports via [`ObjectMark::just_set`] so generational
//! write barriers stay correct.

#![warn(missing_docs)]

pub mod mark;

pub use mark::{CountingMark, NullMark, ObjectMark};
