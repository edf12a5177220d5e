//! The internal machine form of a compiled-code object.
//!
//! `MachineCode` is what the interpreter actually runs: the opcode
//! stream copied into mutable slots (the collector rewrites embedded
//! references in place during marking), the decoded instruction
//! boundaries, the offsets of call sites, constant caches, and embedded
//! references, and the executor state that dispatch routes through.
//!
//! Construction happens exactly once per code object, inside
//! `CompiledCode::internalize`, strictly after the verifier accepted the
//! body. Everything mutable afterwards is an atomic slot.

use crate::bytecode::Opcode;
use crate::code::CompiledCode;
use crate::dispatch::{self, Executor, ExecutorCell};
use crate::specialize::SpecializationCache;
use beryl_core::Symbol;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

bitflags! {
    /// Machine-code state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachineFlags: u32 {
        /// At least one breakpoint is armed.
        const DEBUGGING = 1 << 0;
        /// A native executor has been attached (specialized or
        /// unspecialized).
        const JIT = 1 << 1;
        /// Collector mark bit.
        const MARKED = 1 << 2;
    }
}

/// Which interpreter loop runs this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterpreterVariant {
    /// The plain loop.
    Normal = 0,
    /// The loop that checks the breakpoint table before each instruction.
    Debugging = 1,
}

/// The interpretable internal form.
pub struct MachineCode {
    opcodes: Box<[AtomicU64]>,
    boundaries: Box<[u32]>,
    references: Box<[u32]>,
    call_sites: Box<[u32]>,
    constant_caches: Box<[u32]>,

    name: Symbol,
    required_args: u32,
    total_args: u32,
    splat: Option<u32>,
    stack_size: u32,

    pub(crate) fallback: Executor,
    unspecialized: ExecutorCell,
    specializations: SpecializationCache,
    flags: AtomicU32,
    run: AtomicU8,
}

impl MachineCode {
    /// Build the machine form of `code`.
    ///
    /// The body must already be verified; construction trusts instruction
    /// widths and decodes boundary, call-site, constant-cache, and
    /// embedded-reference offsets in one pass.
    pub fn new(code: &CompiledCode) -> MachineCode {
        let words = code.bytecode();
        let opcodes: Box<[AtomicU64]> = words.iter().map(|&w| AtomicU64::new(w)).collect();

        let mut boundaries = Vec::new();
        let mut references = Vec::new();
        let mut call_sites = Vec::new();
        let mut constant_caches = Vec::new();

        let mut ip = 0usize;
        while ip < words.len() {
            let op = Opcode::from_word(words[ip])
                .expect("unverified bytecode reached machine-code construction");
            boundaries.push(ip as u32);
            match op {
                Opcode::PushValue => references.push(ip as u32 + 1),
                Opcode::Send => call_sites.push(ip as u32),
                Opcode::LoadConst => constant_caches.push(ip as u32),
                _ => {}
            }
            ip += op.width();
        }

        MachineCode {
            opcodes,
            boundaries: boundaries.into_boxed_slice(),
            references: references.into_boxed_slice(),
            call_sites: call_sites.into_boxed_slice(),
            constant_caches: constant_caches.into_boxed_slice(),
            name: code.name(),
            required_args: code.required_args(),
            total_args: code.total_args(),
            splat: code.splat(),
            stack_size: code.stack_size(),
            fallback: dispatch::interpreter_entry,
            unspecialized: ExecutorCell::empty(),
            specializations: SpecializationCache::new(),
            flags: AtomicU32::new(0),
            run: AtomicU8::new(InterpreterVariant::Normal as u8),
        }
    }

    /// Select the argument-shape fallback. Runs during internalization
    /// when no primitive resolved.
    pub(crate) fn setup_argument_handler(&mut self) {
        self.fallback = if self.splat.is_some() {
            dispatch::execute_splat_args
        } else if self.total_args == 0 {
            dispatch::execute_no_args
        } else if self.required_args == self.total_args {
            dispatch::execute_fixed_args
        } else {
            dispatch::execute_generic
        };
    }

    /// The code's name.
    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// Number of words in the stream.
    #[inline]
    pub fn size(&self) -> usize {
        self.opcodes.len()
    }

    /// Load one stream word.
    #[inline]
    pub fn opcode_word(&self, ip: usize) -> u64 {
        self.opcodes[ip].load(Ordering::Relaxed)
    }

    /// The mutable slot behind one stream word. Only the collector's
    /// mark walk stores through this, with mutators stopped.
    #[inline]
    pub(crate) fn opcode_slot(&self, ip: usize) -> &AtomicU64 {
        &self.opcodes[ip]
    }

    /// Whether `ip` is an instruction boundary.
    #[inline]
    pub fn validate_ip(&self, ip: u32) -> bool {
        self.boundaries.binary_search(&ip).is_ok()
    }

    /// Offsets of operand words holding embedded object references.
    #[inline]
    pub fn references(&self) -> &[u32] {
        &self.references
    }

    /// Offsets of call-site instructions.
    #[inline]
    pub fn call_sites(&self) -> &[u32] {
        &self.call_sites
    }

    /// Offsets of constant-cache instructions.
    #[inline]
    pub fn constant_caches(&self) -> &[u32] {
        &self.constant_caches
    }

    /// The executor dispatch lands on when nothing better matches.
    #[inline]
    pub fn fallback(&self) -> Executor {
        self.fallback
    }

    /// The executor for receivers with no specialized variant.
    #[inline]
    pub fn unspecialized(&self) -> Option<Executor> {
        self.unspecialized.load()
    }

    pub(crate) fn set_unspecialized(&self, executor: Executor) {
        self.unspecialized.store(executor);
    }

    /// The specialization cache.
    #[inline]
    pub fn specializations(&self) -> &SpecializationCache {
        &self.specializations
    }

    /// Current interpreter variant.
    #[inline]
    pub fn interpreter(&self) -> InterpreterVariant {
        if self.run.load(Ordering::Acquire) == InterpreterVariant::Debugging as u8 {
            InterpreterVariant::Debugging
        } else {
            InterpreterVariant::Normal
        }
    }

    pub(crate) fn set_interpreter(&self, variant: InterpreterVariant) {
        self.run.store(variant as u8, Ordering::Release);
    }

    /// Whether any breakpoint is armed.
    #[inline]
    pub fn debugging(&self) -> bool {
        self.flag_set(MachineFlags::DEBUGGING)
    }

    pub(crate) fn set_debugging(&self, on: bool) {
        if on {
            self.set_flag(MachineFlags::DEBUGGING);
        } else {
            self.clear_flag(MachineFlags::DEBUGGING);
        }
    }

    /// Whether a native executor has been attached.
    #[inline]
    pub fn jitted(&self) -> bool {
        self.flag_set(MachineFlags::JIT)
    }

    pub(crate) fn set_jitted(&self) {
        self.set_flag(MachineFlags::JIT);
    }

    /// Collector bookkeeping: flag this machine code reached.
    pub fn set_mark(&self) {
        self.set_flag(MachineFlags::MARKED);
    }

    #[inline]
    fn flag_set(&self, flag: MachineFlags) -> bool {
        MachineFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    fn set_flag(&self, flag: MachineFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: MachineFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }
}

impl std::fmt::Debug for MachineCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineCode")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("references", &self.references.len())
            .field("call_sites", &self.call_sites.len())
            .field("debugging", &self.debugging())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
