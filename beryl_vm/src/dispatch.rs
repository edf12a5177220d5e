//! Dispatch entry functions.
//!
//! Every compiled-code object carries one *executor*: the function a
//! call lands on. Executors form a small monotone state machine:
//!
//! ```text
//!  default_dispatch ──internalize──► fallback (interpreter entry,
//!        │                            argument-shape variant, or
//!        │                            resolved primitive)
//!        └──add_specialized─────────► specialized_dispatch
//! ```
//!
//! Transitions never go backward; `duplicate` resets a *copy* to the
//! default, the original is untouched.

use crate::args::Arguments;
use crate::code::CompiledCode;
use crate::error::{RuntimeError, VmResult};
use crate::thread::VmThread;
use beryl_core::Value;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A dispatch entry: executes `code` against the given thread and
/// arguments. Plain function pointers so executor slots stay single
/// pointer-sized atomic words.
pub type Executor = fn(&mut VmThread, &CompiledCode, &mut Arguments) -> VmResult<Value>;

// =============================================================================
// Atomic executor slots
// =============================================================================

/// A nullable executor slot updated with release stores and read with
/// acquire loads.
pub(crate) struct ExecutorCell(AtomicPtr<()>);

impl ExecutorCell {
    pub(crate) fn new(executor: Executor) -> ExecutorCell {
        ExecutorCell(AtomicPtr::new(executor as *mut ()))
    }

    pub(crate) fn empty() -> ExecutorCell {
        ExecutorCell(AtomicPtr::new(ptr::null_mut()))
    }

    #[inline]
    pub(crate) fn load(&self) -> Option<Executor> {
        let raw = self.0.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: the slot only ever holds null or an `Executor`
            // stored by `new`/`store`; fn pointers round-trip through
            // raw pointers losslessly.
            Some(unsafe { mem::transmute::<*mut (), Executor>(raw) })
        }
    }

    #[inline]
    pub(crate) fn store(&self, executor: Executor) {
        self.0.store(executor as *mut (), Ordering::Release);
    }

    #[inline]
    pub(crate) fn raw(&self) -> usize {
        self.0.load(Ordering::Acquire) as usize
    }
}

impl std::fmt::Debug for ExecutorCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutorCell({:#x})", self.raw())
    }
}

// =============================================================================
// Entry functions
// =============================================================================

/// Initial executor of every code object (and of every duplicate).
///
/// Internalizes on first call, then reinvokes whatever executor
/// internalization installed.
pub fn default_dispatch(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    if code.executor_raw() == default_dispatch as Executor as usize {
        let env = thread.env_arc();
        code.internalize(&env)?;
    }

    let executor = code.executor();
    if executor as usize == default_dispatch as Executor as usize {
        // Window between machine-code publication and the winner's
        // executor install: go straight to the fallback.
        let mcode = code
            .machine_code()
            .expect("internalize returned without machine code");
        return (mcode.fallback())(thread, code, args);
    }
    executor(thread, code, args)
}

/// Executor installed once a specialization is registered (and the code
/// has no primitive).
///
/// Routes on the receiver's class data: a cache hit runs the specialized
/// variant, a miss runs the unspecialized executor, and with no
/// unspecialized executor installed the machine code's fallback runs.
pub fn specialized_dispatch(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    let mcode = code
        .machine_code()
        .expect("specialized dispatch without machine code");
    let class_data = thread.class_of(args.recv());

    let target = mcode
        .specializations()
        .find(class_data.raw())
        .or_else(|| mcode.unspecialized());

    match target {
        Some(executor) => executor(thread, code, args),
        None => (mcode.fallback())(thread, code, args),
    }
}

/// Entry a resolved primitive falls back to when its fast path bails.
///
/// Same cache routing as [`specialized_dispatch`], except a full miss
/// lands in the generic interpreter entry rather than the fallback
/// (which would be the primitive again).
pub fn primitive_failed(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    let mcode = code
        .machine_code()
        .expect("primitive fallback without machine code");
    let class_data = thread.class_of(args.recv());

    let target = mcode
        .specializations()
        .find(class_data.raw())
        .or_else(|| mcode.unspecialized());

    match target {
        Some(executor) => executor(thread, code, args),
        None => interpreter_entry(thread, code, args),
    }
}

/// The generic interpreter entry: hands the invocation to the
/// environment's installed interpreter.
pub fn interpreter_entry(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    let env = thread.env_arc();
    (env.interpret)(thread, code, args)
}

// =============================================================================
// Argument-shape fallbacks
// =============================================================================

#[inline]
fn argument_error(code: &CompiledCode, given: u32) -> RuntimeError {
    RuntimeError::ArgumentCount {
        given,
        required: code.required_args(),
        total: code.total_args(),
    }
}

/// Fallback for codes taking no arguments.
pub(crate) fn execute_no_args(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    if args.total() != 0 {
        return Err(argument_error(code, args.total()));
    }
    interpreter_entry(thread, code, args)
}

/// Fallback for codes with a fixed argument count.
pub(crate) fn execute_fixed_args(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    if args.total() != code.required_args() {
        return Err(argument_error(code, args.total()));
    }
    interpreter_entry(thread, code, args)
}

/// Fallback for codes with a trailing splat.
pub(crate) fn execute_splat_args(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    if args.total() < code.required_args() {
        return Err(argument_error(code, args.total()));
    }
    interpreter_entry(thread, code, args)
}

/// Fallback for codes with optional arguments and no splat.
pub(crate) fn execute_generic(
    thread: &mut VmThread,
    code: &CompiledCode,
    args: &mut Arguments,
) -> VmResult<Value> {
    let given = args.total();
    if given < code.required_args() || given > code.total_args() {
        return Err(argument_error(code, given));
    }
    interpreter_entry(thread, code, args)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
        Ok(Value::fixnum(1))
    }

    fn other(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
        Ok(Value::fixnum(2))
    }

    #[test]
    fn test_executor_cell_round_trip() {
        let cell = ExecutorCell::new(probe);
        assert_eq!(cell.load().unwrap() as usize, probe as Executor as usize);
        cell.store(other);
        assert_eq!(cell.load().unwrap() as usize, other as Executor as usize);
    }

    #[test]
    fn test_empty_cell_is_none() {
        let cell = ExecutorCell::empty();
        assert!(cell.load().is_none());
        assert_eq!(cell.raw(), 0);
    }
}
