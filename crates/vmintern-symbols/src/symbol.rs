use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use vmintern_concurrent::{AtomicRefcount, RefcountState};

#[derive(Debug)]
enum SymbolBytes {
    Heap(Box<[u8]>),
    Arena(&'static [u8]),
}

/// One interned byte sequence. Content never changes after creation.
#[derive(Debug)]
pub struct Symbol {
    bytes: SymbolBytes,
    refcount: AtomicRefcount,
}

impl Symbol {
    /// A counted row holding its caller's first reference.
    pub(crate) fn heap(bytes: &[u8]) -> Self {
        Self {
            bytes: SymbolBytes::Heap(bytes.into()),
            refcount: AtomicRefcount::new(fastrand::u16(..), 1),
        }
    }

    pub(crate) fn permanent(bytes: &'static [u8]) -> Self {
        Self {
            bytes: SymbolBytes::Arena(bytes),
            refcount: AtomicRefcount::permanent(fastrand::u16(..)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            SymbolBytes::Heap(bytes) => bytes,
            SymbolBytes::Arena(bytes) => bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Random 16-bit hash fixed at creation, independent of content.
    pub fn identity_hash(&self) -> u16 {
        self.refcount.hash()
    }

    pub fn refcount(&self) -> u16 {
        self.refcount.refcount()
    }

    pub fn state(&self) -> RefcountState {
        self.refcount.state()
    }

    pub fn is_permanent(&self) -> bool {
        self.refcount.is_permanent()
    }

    pub fn is_dead(&self) -> bool {
        self.refcount() == 0
    }

    /// Whether the bytes live in the never-freed arena.
    pub fn is_arena_allocated(&self) -> bool {
        matches!(self.bytes, SymbolBytes::Arena(_))
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.refcount.try_increment()
    }

    pub(crate) fn make_permanent(&self) {
        self.refcount.make_permanent();
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Counted handle to an interned row.
///
/// Each handle owns one reference: cloning takes another, dropping releases
/// it. Equality and hashing go by row identity, which for interned rows is
/// the same as equality of content.
pub struct Identifier {
    symbol: Arc<Symbol>,
}

impl Identifier {
    /// Wrap a row whose reference the caller already took.
    pub(crate) fn adopt(symbol: Arc<Symbol>) -> Self {
        Self { symbol }
    }

    /// The row itself, without taking a reference. The row stays readable
    /// for as long as the `Arc` is held, even after its refcount drops to zero.
    pub fn symbol(&self) -> &Arc<Symbol> {
        &self.symbol
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.symbol, &b.symbol)
    }
}

impl Clone for Identifier {
    fn clone(&self) -> Self {
        self.symbol.refcount.increment();
        Self {
            symbol: Arc::clone(&self.symbol),
        }
    }
}

impl Drop for Identifier {
    fn drop(&mut self) {
        self.symbol.refcount.decrement();
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.symbol, &other.symbol)
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(Arc::as_ptr(&self.symbol) as usize)
    }
}

impl Deref for Identifier {
    type Target = Symbol;

    fn deref(&self) -> &Symbol {
        &self.symbol
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        self.symbol.as_bytes()
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identifier")
            .field("text", &String::from_utf8_lossy(self.as_bytes()))
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.symbol, f)
    }
}
