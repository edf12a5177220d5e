//! Symbol interning.
//!
//! A `Symbol` is a process-wide interned identifier. Interning the same
//! string twice yields the same symbol, so equality is a single integer
//! compare and every symbol carries a stable hash derived from its intern
//! index. Method tables index their bins directly off `Symbol::hash_code`,
//! so the hash must be well distributed and must never change for the
//! lifetime of the process.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::OnceLock;

/// An interned identifier.
///
/// Symbols are `Copy` and compare by identity. The backing string lives
/// for the rest of the process; `as_str` is only a diagnostics
/// convenience and never participates in dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// The intern index of this symbol.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    /// Stable hash of this symbol.
    ///
    /// Finalizer step of splitmix64 over the intern index. The symbol
    /// supplies its own hash; consumers (method tables) mask it down to
    /// their bin count without any per-table seeding.
    #[inline]
    pub fn hash_code(self) -> u64 {
        let mut h = self.0 as u64 ^ 0x9e37_79b9_7f4a_7c15;
        h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        h ^ (h >> 31)
    }

    /// Resolve the symbol back to its source string.
    pub fn as_str(self) -> &'static str {
        symbol_table().name(self)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Interner
// =============================================================================

/// Process-wide symbol table.
///
/// Names are leaked on first intern so lookups can hand out `'static`
/// strings without reference counting. The table only ever grows.
struct SymbolTable {
    inner: RwLock<SymbolTableInner>,
}

struct SymbolTableInner {
    by_name: FxHashMap<&'static str, u32>,
    names: Vec<&'static str>,
}

impl SymbolTable {
    fn new() -> Self {
        Self {
            inner: RwLock::new(SymbolTableInner {
                by_name: FxHashMap::default(),
                names: Vec::new(),
            }),
        }
    }

    fn intern(&self, name: &str) -> Symbol {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.by_name.get(name) {
                return Symbol(id);
            }
        }

        let mut inner = self.inner.write();
        // Double-check: another thread may have interned between locks.
        if let Some(&id) = inner.by_name.get(name) {
            return Symbol(id);
        }

        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let id = inner.names.len() as u32;
        inner.names.push(leaked);
        inner.by_name.insert(leaked, id);
        Symbol(id)
    }

    fn name(&self, sym: Symbol) -> &'static str {
        self.inner.read().names[sym.0 as usize]
    }
}

static SYMBOLS: OnceLock<SymbolTable> = OnceLock::new();

fn symbol_table() -> &'static SymbolTable {
    SYMBOLS.get_or_init(SymbolTable::new)
}

/// Intern a string, returning its symbol.
#[inline]
pub fn intern(name: &str) -> Symbol {
    symbol_table().intern(name)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_identity() {
        let a = intern("each");
        let b = intern("each");
        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());
    }

    #[test]
    fn test_intern_distinct() {
        let a = intern("map");
        let b = intern("select");
        assert_ne!(a, b);
    }

    #[test]
    fn test_as_str_round_trip() {
        let sym = intern("respond_to?");
        assert_eq!(sym.as_str(), "respond_to?");
    }

    #[test]
    fn test_hash_spreads_low_bits() {
        // Sequential intern indices must not collapse into the same
        // low-order bits once masked to a small bin count.
        let symbols: Vec<Symbol> = (0..64).map(|i| intern(&format!("m{}", i))).collect();
        let mut bins = [0usize; 16];
        for sym in &symbols {
            bins[(sym.hash_code() & 15) as usize] += 1;
        }
        // With 64 symbols over 16 bins a perfectly even spread is 4; allow
        // generous slack but reject degenerate clustering.
        assert!(bins.iter().all(|&n| n <= 16));
        assert!(bins.iter().filter(|&&n| n > 0).count() >= 8);
    }

    #[test]
    fn test_concurrent_intern() {
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| intern("shared_name")))
            .collect();
        let symbols: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(symbols.windows(2).all(|w| w[0] == w[1]));
    }
}
