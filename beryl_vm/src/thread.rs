//! Thread state and the collaborator environment.
//!
//! `VmThread` is the per-thread execution state dispatch runs against:
//! the frame stack introspection walks, the pending-raise slot script
//! entry clears, and a handle to the [`VmEnv`].
//!
//! `VmEnv` bundles the external collaborators this core consumes behind
//! closures: the bytecode verifier, the primitive resolver, the generic
//! interpreter entry, and receiver class resolution. Production wires
//! the real services in; tests swap in counting or failing hooks.

use crate::args::Arguments;
use crate::code::CompiledCode;
use crate::dispatch::Executor;
use crate::error::{RuntimeError, VerifyError, VmResult};
use crate::interp;
use crate::verify;
use beryl_core::Value;
use beryl_runtime::{ClassData, ClassId, ClassRegistry};
use std::sync::Arc;

/// Verifier hook: pure validation of a code body.
pub type VerifyHook = Box<dyn Fn(&CompiledCode) -> Result<(), VerifyError> + Send + Sync>;

/// Primitive resolver hook: binds a code's primitive to a fast-path
/// executor, if one exists.
pub type PrimitiveHook = Box<dyn Fn(&CompiledCode) -> Option<Executor> + Send + Sync>;

/// Generic interpreter entry hook.
pub type InterpretHook =
    Box<dyn Fn(&mut VmThread, &CompiledCode, &mut Arguments) -> VmResult<Value> + Send + Sync>;

/// Receiver class resolution hook.
pub type ClassOfHook = Box<dyn Fn(Value) -> ClassData + Send + Sync>;

// =============================================================================
// Environment
// =============================================================================

/// The process-wide collaborators dispatch consumes.
pub struct VmEnv {
    /// Bytecode verifier, invoked exactly once per code object.
    pub verify: VerifyHook,
    /// Primitive resolver consulted during internalization.
    pub resolve_primitive: PrimitiveHook,
    /// The interpreter proper.
    pub interpret: InterpretHook,
    /// Maps a receiver to its class data.
    pub class_of: ClassOfHook,
    /// The class registry (module resolver for aliasing).
    pub registry: Arc<ClassRegistry>,
    /// The root object scripts execute against.
    pub main: Value,
    /// The scope installed on toplevel scripts.
    pub toplevel_scope: Value,
}

impl VmEnv {
    /// An environment wired to the in-crate defaults: the structural
    /// verifier, no primitives, the reference interpreter, and built-in
    /// class resolution.
    pub fn new() -> VmEnv {
        VmEnv {
            verify: Box::new(verify::verify_bytecode),
            resolve_primitive: Box::new(|_| None),
            interpret: Box::new(interp::run_bytecode),
            class_of: Box::new(default_class_of),
            registry: Arc::new(ClassRegistry::new()),
            main: Value::object(0),
            toplevel_scope: Value::nil(),
        }
    }
}

impl Default for VmEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Class resolution for values this core can classify without a heap.
fn default_class_of(value: Value) -> ClassData {
    let id = if value.is_fixnum() {
        ClassId::FIXNUM
    } else if value.is_symbol() {
        ClassId::SYMBOL
    } else if value.as_bool().is_some() {
        ClassId::BOOLEAN
    } else if value.is_object() {
        ClassId::OBJECT
    } else {
        ClassId::NIL
    };
    ClassData::new(id.raw(), 1)
}

// =============================================================================
// Frames and thread state
// =============================================================================

/// One activation on the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The executing code.
    pub code: Arc<CompiledCode>,
    /// Current instruction pointer.
    pub ip: u32,
}

/// Per-thread execution state.
pub struct VmThread {
    env: Arc<VmEnv>,
    frames: Vec<Frame>,
    pending_raise: Option<RuntimeError>,
}

impl VmThread {
    /// A thread bound to `env` with an empty call stack.
    pub fn new(env: Arc<VmEnv>) -> VmThread {
        VmThread {
            env,
            frames: Vec::new(),
            pending_raise: None,
        }
    }

    /// The environment handle.
    #[inline]
    pub fn env(&self) -> &Arc<VmEnv> {
        &self.env
    }

    /// A clone of the environment handle, for calling hooks that take
    /// `&mut self`.
    #[inline]
    pub fn env_arc(&self) -> Arc<VmEnv> {
        Arc::clone(&self.env)
    }

    /// Resolve a receiver's class data.
    #[inline]
    pub fn class_of(&self, value: Value) -> ClassData {
        (self.env.class_of)(value)
    }

    /// Push an activation.
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the current activation.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// The frame `depth` levels below the top (0 = currently executing).
    pub fn get_frame(&self, depth: usize) -> Option<&Frame> {
        let len = self.frames.len();
        len.checked_sub(1 + depth).and_then(|i| self.frames.get(i))
    }

    /// Call-stack depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Record a raise to be observed at a boundary.
    pub fn raise(&mut self, error: RuntimeError) {
        self.pending_raise = Some(error);
    }

    /// Take the pending raise, if any.
    pub fn take_raise(&mut self) -> Option<RuntimeError> {
        self.pending_raise.take()
    }

    /// Whether a raise is pending.
    #[inline]
    pub fn has_raise(&self) -> bool {
        self.pending_raise.is_some()
    }

    /// Clear thread-level exception state (script entry does this before
    /// running).
    pub fn clear_thread_state(&mut self) {
        self.pending_raise = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
