use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};

/// Hash function of one bucket array.
///
/// Tables start on the deterministic Fx hasher. A rehash swaps in a randomly
/// seeded hasher so a crafted key set cannot keep piling into one bucket.
#[derive(Clone, Default)]
pub enum TableHasher {
    #[default]
    Fx,
    Seeded(hashbrown::DefaultHashBuilder),
}

impl TableHasher {
    pub fn deterministic() -> Self {
        Self::Fx
    }

    pub fn randomized() -> Self {
        Self::Seeded(hashbrown::DefaultHashBuilder::default())
    }

    pub fn is_seeded(&self) -> bool {
        matches!(self, Self::Seeded(_))
    }

    #[inline]
    pub fn hash<K: Hash + ?Sized>(&self, key: &K) -> u64 {
        match self {
            Self::Fx => BuildHasherDefault::<FxHasher>::default().hash_one(key),
            Self::Seeded(builder) => builder.hash_one(key),
        }
    }
}

impl fmt::Debug for TableHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fx => f.write_str("TableHasher::Fx"),
            Self::Seeded(_) => f.write_str("TableHasher::Seeded"),
        }
    }
}
