//! Call arguments.

use beryl_core::{intern, Symbol, Value};
use smallvec::SmallVec;

/// Arguments to one invocation: selector, receiver, optional block, and
/// the positional values. Most calls carry four or fewer arguments, so
/// they stay inline.
#[derive(Debug, Clone)]
pub struct Arguments {
    name: Symbol,
    recv: Value,
    block: Value,
    arguments: SmallVec<[Value; 4]>,
}

impl Arguments {
    /// Arguments for a plain send.
    pub fn new(name: Symbol, recv: Value, arguments: &[Value]) -> Arguments {
        Arguments {
            name,
            recv,
            block: Value::nil(),
            arguments: SmallVec::from_slice(arguments),
        }
    }

    /// Arguments for a toplevel script entry: no positionals, the root
    /// object as receiver.
    pub fn script(recv: Value) -> Arguments {
        Arguments::new(intern("script"), recv, &[])
    }

    /// Attach a block.
    pub fn with_block(mut self, block: Value) -> Arguments {
        self.block = block;
        self
    }

    /// The selector.
    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// The receiver.
    #[inline]
    pub fn recv(&self) -> Value {
        self.recv
    }

    /// The block, or nil.
    #[inline]
    pub fn block(&self) -> Value {
        self.block
    }

    /// Number of positional arguments.
    #[inline]
    pub fn total(&self) -> u32 {
        self.arguments.len() as u32
    }

    /// Positional argument by index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.arguments.get(index).copied()
    }

    /// All positional arguments.
    #[inline]
    pub fn as_slice(&self) -> &[Value] {
        &self.arguments
    }
}
