//! Compiled-code objects.
//!
//! A `CompiledCode` is the executable artifact a method table binds: the
//! portable bytecode body plus its metadata, a lazily materialized
//! [`MachineCode`], breakpoint state, and the executor slot dispatch
//! lands on.
//!
//! # Internalization
//!
//! The transition from portable bytecode to the machine form happens at
//! most once, on first execution or first debugger touch. The winner
//! verifies the body, builds the machine code, publishes it with a
//! release store, and installs the machine code's fallback as the
//! executor; every other thread either observes the published value
//! outside the lock or re-checks under it. The verifier runs exactly
//! once per code object no matter how many threads race.
//!
//! # Executor transitions
//!
//! `default_dispatch → (fallback | unspecialized | specialized)`, never
//! backward. `duplicate` resets only the copy.

use crate::args::Arguments;
use crate::dispatch::{self, Executor, ExecutorCell};
use crate::error::{CodeError, RuntimeError, VmResult};
use crate::machine_code::{InterpreterVariant, MachineCode};
use crate::specialize::InstallOutcome;
use crate::thread::{Frame, VmEnv, VmThread};
use beryl_core::{Symbol, Value, ValueCell};
use beryl_gc::ObjectMark;
use beryl_runtime::ClassData;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Line sentinel: no line information recorded at all.
pub const LINE_UNKNOWN: i64 = -3;
/// Line sentinel: line table present but empty.
pub const LINE_ABSENT: i64 = -1;

/// A compiled method, block, or script body.
pub struct CompiledCode {
    name: Symbol,
    file: Symbol,
    bytecode: Box<[u64]>,
    literals: Box<[ValueCell]>,
    /// Alternating `[ip0, line0, ip1, line1, …]` pairs.
    lines: Option<Box<[u32]>>,
    local_names: Box<[Symbol]>,
    local_count: u32,
    required_args: u32,
    total_args: u32,
    splat: Option<u32>,
    stack_size: u32,
    primitive: Option<Symbol>,
    scope: ValueCell,

    machine_code: AtomicPtr<MachineCode>,
    hard_lock: Mutex<()>,
    executor: ExecutorCell,
    breakpoints: Mutex<Option<FxHashMap<u32, Value>>>,
    jit_data: ValueCell,
}

impl CompiledCode {
    /// An empty code object. Dispatch starts at the default executor.
    pub fn new(name: Symbol, file: Symbol) -> CompiledCode {
        CompiledCode {
            name,
            file,
            bytecode: Box::new([]),
            literals: Box::new([]),
            lines: None,
            local_names: Box::new([]),
            local_count: 0,
            required_args: 0,
            total_args: 0,
            splat: None,
            stack_size: 0,
            primitive: None,
            scope: ValueCell::nil(),
            machine_code: AtomicPtr::new(ptr::null_mut()),
            hard_lock: Mutex::new(()),
            executor: ExecutorCell::new(dispatch::default_dispatch),
            breakpoints: Mutex::new(None),
            jit_data: ValueCell::nil(),
        }
    }

    // =========================================================================
    // Creation-time setup
    // =========================================================================

    /// Install the bytecode body.
    pub fn set_bytecode(&mut self, words: Vec<u64>) {
        self.bytecode = words.into_boxed_slice();
    }

    /// Install the literal pool.
    pub fn set_literals(&mut self, literals: Vec<Value>) {
        self.literals = literals.into_iter().map(ValueCell::new).collect();
    }

    /// Install the line map as alternating `(ip, line)` entries.
    pub fn set_lines(&mut self, lines: Vec<u32>) {
        debug_assert!(lines.len() % 2 == 0, "line map must pair ips with lines");
        self.lines = Some(lines.into_boxed_slice());
    }

    /// Install local-variable names.
    pub fn set_local_names(&mut self, names: Vec<Symbol>) {
        self.local_count = names.len() as u32;
        self.local_names = names.into_boxed_slice();
    }

    /// Install the argument shape. `splat` is the index of the trailing
    /// rest argument, if any.
    pub fn set_arity(&mut self, required: u32, total: u32, splat: Option<u32>) {
        self.required_args = required;
        self.total_args = total;
        self.splat = splat;
    }

    /// Install the operand-stack bound.
    pub fn set_stack_size(&mut self, size: u32) {
        self.stack_size = size;
    }

    /// Name this code as a primitive candidate.
    pub fn set_primitive(&mut self, name: Symbol) {
        self.primitive = Some(name);
    }

    /// Install the defining scope.
    pub fn set_scope(&mut self, scope: Value) {
        self.scope.set(scope);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The code's name.
    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// The defining file.
    #[inline]
    pub fn file(&self) -> Symbol {
        self.file
    }

    /// The portable bytecode body.
    #[inline]
    pub fn bytecode(&self) -> &[u64] {
        &self.bytecode
    }

    /// Literal pool entry.
    #[inline]
    pub fn literal(&self, index: usize) -> Value {
        self.literals[index].get()
    }

    /// Literal pool size.
    #[inline]
    pub fn literals_len(&self) -> usize {
        self.literals.len()
    }

    /// Local-variable names.
    #[inline]
    pub fn local_names(&self) -> &[Symbol] {
        &self.local_names
    }

    /// Number of locals.
    #[inline]
    pub fn number_of_locals(&self) -> usize {
        self.local_count as usize
    }

    /// Minimum argument count.
    #[inline]
    pub fn required_args(&self) -> u32 {
        self.required_args
    }

    /// Maximum argument count (ignoring splat).
    #[inline]
    pub fn total_args(&self) -> u32 {
        self.total_args
    }

    /// Index of the rest argument, if any.
    #[inline]
    pub fn splat(&self) -> Option<u32> {
        self.splat
    }

    /// Operand-stack bound.
    #[inline]
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// The primitive name, if this code is a primitive candidate.
    #[inline]
    pub fn primitive(&self) -> Option<Symbol> {
        self.primitive
    }

    /// The defining scope.
    #[inline]
    pub fn scope(&self) -> Value {
        self.scope.get()
    }

    /// Runtime data attached by the native backend.
    #[inline]
    pub fn jit_data(&self) -> Value {
        self.jit_data.get()
    }

    /// The code's display name.
    pub fn full_name(&self) -> &'static str {
        self.name.as_str()
    }

    /// Whether this code was loaded from the core library.
    pub fn core_method(&self) -> bool {
        self.file.as_str().starts_with("core/")
    }

    /// Whether a native executor has been attached.
    pub fn jitted(&self) -> bool {
        self.machine_code().map_or(false, |m| m.jitted())
    }

    // =========================================================================
    // Lines
    // =========================================================================

    /// First line of this code, or [`LINE_ABSENT`].
    pub fn start_line(&self) -> i64 {
        match &self.lines {
            Some(lines) if lines.len() >= 2 => lines[1] as i64,
            _ => LINE_ABSENT,
        }
    }

    /// Source line covering `ip`.
    ///
    /// Scans the alternating `(ip, line)` map: an entry covers from its
    /// ip up to the next entry's ip; past the final entry the last
    /// recorded line wins. [`LINE_UNKNOWN`] when no map was recorded.
    pub fn line(&self, ip: u32) -> i64 {
        let Some(lines) = &self.lines else {
            return LINE_UNKNOWN;
        };
        if lines.len() < 2 {
            return LINE_UNKNOWN;
        }

        let fin = lines.len() - 2;
        let mut i = 0;
        while i < fin {
            let start_ip = lines[i];
            let end_ip = lines[i + 2];
            if start_ip <= ip && ip < end_ip {
                return lines[i + 1] as i64;
            }
            i += 2;
        }
        lines[fin + 1] as i64
    }

    // =========================================================================
    // Internalization
    // =========================================================================

    /// The machine form, if already materialized.
    #[inline]
    pub fn machine_code(&self) -> Option<&MachineCode> {
        let raw = self.machine_code.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: once published the machine code lives until this
            // code object drops; `&self` pins it.
            Some(unsafe { &*raw })
        }
    }

    /// Materialize the machine form, verifying the body first.
    ///
    /// Exactly-once: concurrent callers either observe the published
    /// value before taking the hard lock or re-observe it under the
    /// lock. The verifier runs at most once; on rejection nothing is
    /// published and every caller gets the failure sentinel.
    pub fn internalize(&self, env: &VmEnv) -> Result<&MachineCode, CodeError> {
        let existing = self.machine_code.load(Ordering::Acquire);
        if !existing.is_null() {
            // SAFETY: see `machine_code`.
            return Ok(unsafe { &*existing });
        }

        let _guard = self.hard_lock.lock();

        let existing = self.machine_code.load(Ordering::Acquire);
        if !existing.is_null() {
            // SAFETY: see `machine_code`.
            return Ok(unsafe { &*existing });
        }

        (env.verify)(self).map_err(CodeError::Verify)?;

        let mut mcode = Box::new(MachineCode::new(self));
        if let Some(primitive) = (env.resolve_primitive)(self) {
            mcode.fallback = primitive;
        } else {
            mcode.setup_argument_handler();
        }

        // A duplicate carries its source's breakpoint table but dropped
        // the machine state; re-arm so the table and the interpreter
        // variant stay in step.
        if self
            .breakpoints
            .lock()
            .as_ref()
            .map_or(false, |map| !map.is_empty())
        {
            mcode.set_debugging(true);
            mcode.set_interpreter(InterpreterVariant::Debugging);
        }

        let raw = Box::into_raw(mcode);
        // Publish only after full construction; pairs with the acquire
        // loads above so no thread observes a partial machine code.
        self.machine_code.store(raw, Ordering::Release);

        // SAFETY: just published, lives until drop.
        let mcode = unsafe { &*raw };
        self.executor.store(mcode.fallback);
        Ok(mcode)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Invoke this code through its current executor.
    #[inline]
    pub fn execute(&self, thread: &mut VmThread, args: &mut Arguments) -> VmResult<Value> {
        (self.executor())(thread, self, args)
    }

    pub(crate) fn executor(&self) -> Executor {
        self.executor
            .load()
            .expect("executor slot is never empty")
    }

    pub(crate) fn executor_raw(&self) -> usize {
        self.executor.raw()
    }

    pub(crate) fn set_executor(&self, executor: Executor) {
        self.executor.store(executor);
    }

    /// Run this code as a toplevel program against the root object.
    ///
    /// Clears any pending thread-level raise before entry. A raise that
    /// escapes the script is formatted into a single diagnostic line and
    /// surfaced to the caller as [`RuntimeError::Toplevel`].
    pub fn execute_script(self: &Arc<Self>, thread: &mut VmThread) -> VmResult<Value> {
        thread.clear_thread_state();
        let env = thread.env_arc();
        self.scope.set(env.toplevel_scope);

        let mut args = Arguments::script(env.main);
        thread.push_frame(Frame {
            code: Arc::clone(self),
            ip: 0,
        });
        let result = self.execute(thread, &mut args);
        thread.pop_frame();

        let raised = match result {
            Ok(value) => match thread.take_raise() {
                None => return Ok(value),
                Some(error) => error,
            },
            Err(error) => error,
        };

        Err(RuntimeError::Toplevel {
            diagnostic: format!("exception detected at toplevel: {}", raised),
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The caller's enclosing code, if the current frame has a caller.
    pub fn of_sender(thread: &VmThread) -> Option<Arc<CompiledCode>> {
        thread.get_frame(1).map(|frame| Arc::clone(&frame.code))
    }

    /// The currently executing code.
    pub fn current(thread: &VmThread) -> Option<Arc<CompiledCode>> {
        thread.get_frame(0).map(|frame| Arc::clone(&frame.code))
    }

    /// Offsets of this code's call sites. Internalizes on demand.
    pub fn call_sites(&self, env: &VmEnv) -> Result<&[u32], CodeError> {
        Ok(self.internalize(env)?.call_sites())
    }

    /// Offsets of this code's constant caches. Internalizes on demand.
    pub fn constant_caches(&self, env: &VmEnv) -> Result<&[u32], CodeError> {
        Ok(self.internalize(env)?.constant_caches())
    }

    // =========================================================================
    // Duplication
    // =========================================================================

    /// A shallow field copy with fresh lazy state: the copy starts back
    /// at the default executor and re-internalizes on first use.
    pub fn duplicate(&self) -> CompiledCode {
        CompiledCode {
            name: self.name,
            file: self.file,
            bytecode: self.bytecode.clone(),
            literals: self.literals.clone(),
            lines: self.lines.clone(),
            local_names: self.local_names.clone(),
            local_count: self.local_count,
            required_args: self.required_args,
            total_args: self.total_args,
            splat: self.splat,
            stack_size: self.stack_size,
            primitive: self.primitive,
            scope: self.scope.clone(),
            machine_code: AtomicPtr::new(ptr::null_mut()),
            hard_lock: Mutex::new(()),
            executor: ExecutorCell::new(dispatch::default_dispatch),
            breakpoints: Mutex::new(self.breakpoints.lock().clone()),
            jit_data: self.jit_data.clone(),
        }
    }

    // =========================================================================
    // Specialization
    // =========================================================================

    /// Register a specialized executor for `(class_id, serial)`.
    ///
    /// Requires the machine form; called too early this logs and ignores
    /// the request. When the cache is full, slot 0 is overwritten and a
    /// warning is emitted.
    pub fn add_specialized(
        &self,
        class_id: u32,
        serial: u32,
        executor: Executor,
        runtime_data: Value,
    ) {
        let Some(mcode) = self.machine_code() else {
            eprintln!("beryl: specializing `{}` with no machine code", self.name);
            return;
        };

        if mcode
            .specializations()
            .install(class_id, serial, executor, runtime_data)
            == InstallOutcome::Evicted
        {
            eprintln!(
                "beryl: specialization space exceeded for `{}`",
                self.name
            );
        }

        mcode.set_jitted();
        if self.primitive.is_none() {
            self.set_executor(dispatch::specialized_dispatch);
        }
    }

    /// Install the executor for receivers with no specialized variant.
    ///
    /// When no specialization is cached (and no primitive resolved) the
    /// unspecialized executor becomes the top-level executor directly,
    /// skipping the cache scan.
    pub fn set_unspecialized(&self, executor: Executor, runtime_data: Value) {
        let mcode = self
            .machine_code()
            .expect("specializing with no backend");

        mcode.set_jitted();
        self.jit_data.set(runtime_data);
        mcode.set_unspecialized(executor);

        if mcode.specializations().is_unused() && self.primitive.is_none() {
            self.set_executor(executor);
        }
    }

    /// The specialized executor for `class_data`, if cached. No side
    /// effects.
    pub fn find_specialized(&self, class_data: ClassData) -> Option<Executor> {
        self.machine_code()
            .and_then(|mcode| mcode.specializations().find(class_data.raw()))
    }

    /// Whether the specialization cache has room.
    pub fn can_specialize(&self) -> bool {
        self.machine_code()
            .expect("specializing with no backend")
            .specializations()
            .has_empty_slot()
    }

    // =========================================================================
    // Breakpoints
    // =========================================================================

    /// Arm a breakpoint at `ip` with attached user data.
    ///
    /// Internalizes on demand; `ip` must be an instruction boundary.
    /// Switches the machine code to the debugging interpreter variant.
    pub fn set_breakpoint(&self, env: &VmEnv, ip: u32, user_data: Value) -> Result<(), CodeError> {
        let mcode = self.internalize(env)?;
        if !mcode.validate_ip(ip) {
            return Err(CodeError::InvalidIp { ip });
        }

        let mut breakpoints = self.breakpoints.lock();
        breakpoints
            .get_or_insert_with(FxHashMap::default)
            .insert(ip, user_data);
        mcode.set_debugging(true);
        mcode.set_interpreter(InterpreterVariant::Debugging);
        Ok(())
    }

    /// Disarm the breakpoint at `ip`, reporting whether one was armed.
    ///
    /// When the last breakpoint clears, the machine code reverts to the
    /// normal interpreter variant.
    pub fn clear_breakpoint(&self, ip: u32) -> Result<bool, CodeError> {
        let Some(mcode) = self.machine_code() else {
            return Ok(false);
        };
        if !mcode.validate_ip(ip) {
            return Err(CodeError::InvalidIp { ip });
        }

        let mut breakpoints = self.breakpoints.lock();
        let mut removed = false;
        if let Some(map) = breakpoints.as_mut() {
            removed = map.remove(&ip).is_some();
            if map.is_empty() {
                mcode.set_debugging(false);
                mcode.set_interpreter(InterpreterVariant::Normal);
            }
        }
        Ok(removed)
    }

    /// Whether a breakpoint is armed at `ip`.
    pub fn is_breakpoint(&self, ip: u32) -> Result<bool, CodeError> {
        let Some(mcode) = self.machine_code() else {
            return Ok(false);
        };
        if !mcode.validate_ip(ip) {
            return Err(CodeError::InvalidIp { ip });
        }
        let breakpoints = self.breakpoints.lock();
        Ok(breakpoints
            .as_ref()
            .map_or(false, |map| map.contains_key(&ip)))
    }

    // =========================================================================
    // Collector interface
    // =========================================================================

    /// Present every owned reference to the collector and write back
    /// relocations. Runs with mutators stopped; this walk is the only
    /// place the opcode stream is mutated after publication.
    pub fn mark(&self, marker: &mut dyn ObjectMark) {
        let container = self as *const CompiledCode as *const ();

        for cell in self.literals.iter() {
            relocate_cell(marker, container, cell);
        }
        relocate_cell(marker, container, &self.scope);
        relocate_cell(marker, container, &self.jit_data);

        if let Some(map) = self.breakpoints.lock().as_mut() {
            for value in map.values_mut() {
                if let Some(moved) = marker.mark_value(*value) {
                    *value = moved;
                    marker.just_set(container, moved);
                }
            }
        }

        let Some(mcode) = self.machine_code() else {
            return;
        };
        mcode.set_mark();

        mcode
            .specializations()
            .each_jit_data(|cell| relocate_cell(marker, container, cell));

        for &offset in mcode.references() {
            let slot = mcode.opcode_slot(offset as usize);
            let value = Value::from_raw(slot.load(Ordering::Relaxed));
            if let Some(moved) = marker.mark_value(value) {
                slot.store(moved.raw(), Ordering::Relaxed);
                marker.just_set(container, moved);
            }
        }
    }
}

fn relocate_cell(marker: &mut dyn ObjectMark, container: *const (), cell: &ValueCell) {
    if let Some(moved) = marker.mark_value(cell.get()) {
        cell.set(moved);
        marker.just_set(container, moved);
    }
}

impl Drop for CompiledCode {
    fn drop(&mut self) {
        let raw = *self.machine_code.get_mut();
        if !raw.is_null() {
            // SAFETY: published exactly once from a Box; `&mut self`
            // guarantees no outstanding borrows.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("name", &self.name)
            .field("file", &self.file)
            .field("words", &self.bytecode.len())
            .field("internalized", &self.machine_code().is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::error::VerifyError;
    use beryl_core::intern;

    fn simple_code() -> CompiledCode {
        let mut builder = BytecodeBuilder::new();
        builder.push_literal(0).ret();
        let mut code = CompiledCode::new(intern("answer"), intern("t.brl"));
        code.set_bytecode(builder.build());
        code.set_literals(vec![Value::fixnum(42)]);
        code.set_stack_size(1);
        code
    }

    fn env() -> VmEnv {
        VmEnv::new()
    }

    #[test]
    fn test_new_defaults() {
        let code = CompiledCode::new(intern("m"), intern("f.brl"));
        assert!(code.machine_code().is_none());
        assert_eq!(
            code.executor_raw(),
            dispatch::default_dispatch as Executor as usize
        );
        assert_eq!(code.start_line(), LINE_ABSENT);
        assert_eq!(code.line(0), LINE_UNKNOWN);
        assert!(!code.core_method());
        assert!(!code.jitted());
    }

    #[test]
    fn test_line_lookup() {
        let mut code = CompiledCode::new(intern("m"), intern("f.brl"));
        code.set_lines(vec![0, 10, 5, 15, 9, 20]);

        assert_eq!(code.start_line(), 10);
        assert_eq!(code.line(0), 10);
        assert_eq!(code.line(4), 10);
        assert_eq!(code.line(5), 15);
        assert_eq!(code.line(8), 15);
        assert_eq!(code.line(9), 20);
        // Past the last recorded pair, the final line wins.
        assert_eq!(code.line(1000), 20);
    }

    #[test]
    fn test_line_monotone() {
        let mut code = CompiledCode::new(intern("m"), intern("f.brl"));
        code.set_lines(vec![0, 3, 4, 7, 10, 9]);
        let mut last = i64::MIN;
        for ip in 0..20 {
            let line = code.line(ip);
            assert!(line >= last, "line regressed at ip {}", ip);
            last = line;
        }
    }

    #[test]
    fn test_internalize_publishes_once() {
        let env = env();
        let code = simple_code();
        let first = code.internalize(&env).unwrap() as *const MachineCode;
        let second = code.internalize(&env).unwrap() as *const MachineCode;
        assert_eq!(first, second);
        assert!(code.machine_code().is_some());
        // Executor moved off the default.
        assert_ne!(
            code.executor_raw(),
            dispatch::default_dispatch as Executor as usize
        );
    }

    #[test]
    fn test_internalize_failure_mutates_nothing() {
        let env = env();
        let mut code = CompiledCode::new(intern("bad"), intern("t.brl"));
        code.set_bytecode(vec![0xAB]);
        let err = code.internalize(&env).unwrap_err();
        assert!(matches!(
            err,
            CodeError::Verify(VerifyError::UnknownOpcode { .. })
        ));
        assert!(code.machine_code().is_none());
        assert_eq!(
            code.executor_raw(),
            dispatch::default_dispatch as Executor as usize
        );
    }

    #[test]
    fn test_execute_through_default_dispatch() {
        let env = Arc::new(env());
        let mut thread = VmThread::new(Arc::clone(&env));
        let code = simple_code();
        let mut args = Arguments::script(Value::nil());
        let result = code.execute(&mut thread, &mut args).unwrap();
        assert_eq!(result.as_fixnum(), Some(42));
        assert!(code.machine_code().is_some());
    }

    #[test]
    fn test_duplicate_resets_lazy_state() {
        let env = env();
        let code = simple_code();
        code.internalize(&env).unwrap();

        let copy = code.duplicate();
        assert!(copy.machine_code().is_none());
        assert_eq!(
            copy.executor_raw(),
            dispatch::default_dispatch as Executor as usize
        );
        assert_eq!(copy.literal(0), code.literal(0));

        // Re-internalizing the copy yields an independent machine code.
        let original = code.machine_code().unwrap() as *const MachineCode;
        let fresh = copy.internalize(&env).unwrap() as *const MachineCode;
        assert_ne!(original, fresh);
    }

    #[test]
    fn test_breakpoint_lifecycle() {
        let env = env();
        let code = simple_code();

        code.set_breakpoint(&env, 0, Value::fixnum(7)).unwrap();
        let mcode = code.machine_code().unwrap();
        assert!(mcode.debugging());
        assert_eq!(mcode.interpreter(), InterpreterVariant::Debugging);
        assert!(code.is_breakpoint(0).unwrap());
        assert!(!code.is_breakpoint(2).unwrap());

        assert!(code.clear_breakpoint(0).unwrap());
        assert!(!mcode.debugging());
        assert_eq!(mcode.interpreter(), InterpreterVariant::Normal);
        assert!(!code.is_breakpoint(0).unwrap());
        // Clearing again reports nothing armed.
        assert!(!code.clear_breakpoint(0).unwrap());
    }

    #[test]
    fn test_breakpoint_rejects_non_boundary() {
        let env = env();
        let code = simple_code();
        // ip 1 is the PushLiteral operand word.
        assert_eq!(
            code.set_breakpoint(&env, 1, Value::nil()),
            Err(CodeError::InvalidIp { ip: 1 })
        );
        assert_eq!(code.is_breakpoint(1), Err(CodeError::InvalidIp { ip: 1 }));
    }

    #[test]
    fn test_breakpoint_before_internalize_is_false() {
        let code = simple_code();
        assert!(!code.is_breakpoint(0).unwrap());
        assert!(!code.clear_breakpoint(0).unwrap());
        assert!(code.machine_code().is_none());
    }

    #[test]
    fn test_duplicate_rearms_breakpoints() {
        let env = env();
        let code = simple_code();
        code.set_breakpoint(&env, 0, Value::fixnum(1)).unwrap();

        let copy = code.duplicate();
        assert!(copy.machine_code().is_none());
        copy.internalize(&env).unwrap();
        let mcode = copy.machine_code().unwrap();
        assert!(mcode.debugging());
        assert_eq!(mcode.interpreter(), InterpreterVariant::Debugging);
        assert!(copy.is_breakpoint(0).unwrap());
    }

    #[test]
    fn test_add_specialized_without_machine_code_is_ignored() {
        fn spec(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
            Ok(Value::nil())
        }
        let code = simple_code();
        code.add_specialized(7, 1, spec, Value::nil());
        assert!(code.machine_code().is_none());
        assert_eq!(
            code.executor_raw(),
            dispatch::default_dispatch as Executor as usize
        );
    }

    #[test]
    #[should_panic(expected = "specializing with no backend")]
    fn test_can_specialize_without_machine_code_panics() {
        let code = simple_code();
        code.can_specialize();
    }

    #[test]
    fn test_set_unspecialized_direct_install() {
        fn unspec(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
            Ok(Value::fixnum(5))
        }
        let env = env();
        let code = simple_code();
        code.internalize(&env).unwrap();

        // Empty cache + no primitive: the unspecialized executor becomes
        // the top-level executor directly.
        code.set_unspecialized(unspec, Value::nil());
        assert_eq!(code.executor_raw(), unspec as Executor as usize);
        assert!(code.jitted());
    }

    #[test]
    fn test_add_specialized_installs_dispatch() {
        fn spec(_: &mut VmThread, _: &CompiledCode, _: &mut Arguments) -> VmResult<Value> {
            Ok(Value::nil())
        }
        let env = env();
        let code = simple_code();
        code.internalize(&env).unwrap();

        assert!(code.can_specialize());
        code.add_specialized(7, 1, spec, Value::nil());
        assert_eq!(
            code.executor_raw(),
            dispatch::specialized_dispatch as Executor as usize
        );
        assert!(code
            .find_specialized(ClassData::new(7, 1))
            .is_some());
        assert!(code
            .find_specialized(ClassData::new(7, 2))
            .is_none());
    }

    #[test]
    fn test_call_sites_and_constant_caches() {
        let env = env();
        let mut builder = BytecodeBuilder::new();
        builder.push_literal(0); // ip 0
        builder.send(1); // ip 2
        builder.load_const(1); // ip 4
        builder.ret(); // ip 6
        let mut code = CompiledCode::new(intern("m"), intern("t.brl"));
        code.set_bytecode(builder.build());
        code.set_literals(vec![Value::fixnum(1), Value::symbol(intern("x"))]);

        assert_eq!(code.call_sites(&env).unwrap(), &[2]);
        assert_eq!(code.constant_caches(&env).unwrap(), &[4]);
    }

    #[test]
    fn test_call_sites_propagate_verify_failure() {
        let env = env();
        let mut code = CompiledCode::new(intern("bad"), intern("t.brl"));
        code.set_bytecode(vec![0xAB]);
        assert!(code.call_sites(&env).is_err());
        assert!(code.constant_caches(&env).is_err());
    }

    #[test]
    fn test_mark_walks_and_relocates() {
        use beryl_gc::CountingMark;

        struct Relocator;
        impl ObjectMark for Relocator {
            fn mark_value(&mut self, value: Value) -> Option<Value> {
                value.as_object().map(|h| Value::object(h + 0x100))
            }
            fn just_set(&mut self, _container: *const (), _value: Value) {}
        }

        let env = env();
        let mut builder = BytecodeBuilder::new();
        builder.push_value(Value::object(0x40)); // embedded ref at offset 1
        builder.ret();
        let mut code = CompiledCode::new(intern("m"), intern("t.brl"));
        code.set_bytecode(builder.build());
        code.set_literals(vec![Value::object(0x10), Value::fixnum(3)]);
        code.internalize(&env).unwrap();

        code.mark(&mut Relocator);

        // Literal pool relocated.
        assert_eq!(code.literal(0).as_object(), Some(0x110));
        // Non-reference literal untouched.
        assert_eq!(code.literal(1).as_fixnum(), Some(3));
        // Opcode stream operand rewritten in place.
        let mcode = code.machine_code().unwrap();
        assert_eq!(
            Value::from_raw(mcode.opcode_word(1)).as_object(),
            Some(0x140)
        );

        // Counting callback sees every owned slot.
        let mut counter = CountingMark::new();
        code.mark(&mut counter);
        // 2 literals + scope + jit_data + 1 embedded reference.
        assert_eq!(counter.visited, 5);
        assert_eq!(counter.stores, 0);
    }

    #[test]
    fn test_mark_before_internalize_skips_machine_state() {
        use beryl_gc::CountingMark;

        let code = simple_code();
        let mut counter = CountingMark::new();
        code.mark(&mut counter);
        // 1 literal + scope + jit_data.
        assert_eq!(counter.visited, 3);
    }

    #[test]
    fn test_execute_script_returns_value() {
        let env = Arc::new(env());
        let mut thread = VmThread::new(Arc::clone(&env));
        let code = Arc::new(simple_code());
        let result = code.execute_script(&mut thread).unwrap();
        assert_eq!(result.as_fixnum(), Some(42));
        assert_eq!(thread.depth(), 0);
    }

    #[test]
    fn test_execute_script_surfaces_toplevel_raise() {
        let env = Arc::new(VmEnv {
            interpret: Box::new(|_, _, _| Err(RuntimeError::raise("undefined method `frob`"))),
            ..VmEnv::new()
        });
        let mut thread = VmThread::new(Arc::clone(&env));
        let code = Arc::new(simple_code());

        let err = code.execute_script(&mut thread).unwrap_err();
        match err {
            RuntimeError::Toplevel { diagnostic } => {
                assert_eq!(
                    diagnostic,
                    "exception detected at toplevel: undefined method `frob`"
                );
            }
            other => panic!("expected toplevel error, got {:?}", other),
        }
        assert_eq!(thread.depth(), 0);
    }

    #[test]
    fn test_execute_script_clears_stale_raise() {
        let env = Arc::new(env());
        let mut thread = VmThread::new(Arc::clone(&env));
        thread.raise(RuntimeError::raise("stale"));

        let code = Arc::new(simple_code());
        let result = code.execute_script(&mut thread).unwrap();
        assert_eq!(result.as_fixnum(), Some(42));
        assert!(!thread.has_raise());
    }

    #[test]
    fn test_of_sender_and_current() {
        let env = Arc::new(env());
        let mut thread = VmThread::new(Arc::clone(&env));
        assert!(CompiledCode::current(&thread).is_none());
        assert!(CompiledCode::of_sender(&thread).is_none());

        let outer = Arc::new(CompiledCode::new(intern("outer"), intern("t.brl")));
        let inner = Arc::new(CompiledCode::new(intern("inner"), intern("t.brl")));
        thread.push_frame(Frame {
            code: Arc::clone(&outer),
            ip: 0,
        });
        thread.push_frame(Frame {
            code: Arc::clone(&inner),
            ip: 0,
        });

        assert_eq!(
            CompiledCode::current(&thread).unwrap().name(),
            intern("inner")
        );
        assert_eq!(
            CompiledCode::of_sender(&thread).unwrap().name(),
            intern("outer")
        );
    }
}
