//! Compiled-code objects and method dispatch for the Beryl runtime.
//!
//! This crate owns the code-object half of the dispatch core:
//!
//! - [`CompiledCode`]: the executable artifact method tables bind — a
//!   portable bytecode body, its metadata, breakpoint state, and the
//!   executor slot every call lands on.
//! - [`MachineCode`]: the lazily materialized internal form, built once
//!   per code object after verification and published with release
//!   semantics.
//! - [`SpecializationCache`]: the fixed-size cache of type-specialized
//!   executors keyed on receiver class data.
//! - Dispatch entry functions ([`default_dispatch`],
//!   [`specialized_dispatch`], [`primitive_failed`]) and the
//!   argument-shape fallbacks behind them.
//!
//! # Architecture
//!
//! ```text
//! MethodTable ──► CompiledCode ──► MachineCode
//!                      │                │
//!                      │executor        ├── opcodes (mutable slots)
//!                      ▼                ├── SpecializationCache
//!              default_dispatch         └── fallback / unspecialized
//!                      │ internalize
//!                      ▼
//!              fallback │ specialized_dispatch │ primitive
//! ```
//!
//! External collaborators (the verifier, the interpreter proper, the
//! primitive resolver, receiver classification) are reached through
//! [`VmEnv`] hooks so they stay swappable and observable in tests.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod args;
pub mod bytecode;
pub mod code;
pub mod dispatch;
pub mod error;
pub mod interp;
pub mod machine_code;
pub mod specialize;
pub mod thread;
pub mod verify;

pub use args::Arguments;
pub use bytecode::{BytecodeBuilder, Opcode};
pub use code::{CompiledCode, LINE_ABSENT, LINE_UNKNOWN};
pub use dispatch::{
    default_dispatch, interpreter_entry, primitive_failed, specialized_dispatch, Executor,
};
pub use error::{CodeError, RuntimeError, VerifyError, VmResult};
pub use machine_code::{InterpreterVariant, MachineCode, MachineFlags};
pub use specialize::{InstallOutcome, SpecializationCache, MAX_SPECIALIZATIONS};
pub use thread::{Frame, VmEnv, VmThread};
pub use verify::verify_bytecode;
