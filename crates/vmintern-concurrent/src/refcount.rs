use core::sync::atomic::{AtomicU32, Ordering};

/// Refcount value meaning "never collect". Sticky once reached.
pub const PERMANENT: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountState {
    Counted(u16),
    Permanent,
}

/// A 16-bit identity hash and a 16-bit refcount packed into one atomic word.
///
/// Every transition is a compare-and-swap loop over the whole word; the hash
/// half is carried through unchanged. Counting up to `PERMANENT` saturates
/// into the permanent state.
#[derive(Debug)]
pub struct AtomicRefcount {
    word: AtomicU32,
}

#[inline]
const fn pack(hash: u16, count: u16) -> u32 {
    ((hash as u32) << 16) | count as u32
}

#[inline]
const fn count_of(word: u32) -> u16 {
    word as u16
}

#[inline]
const fn hash_of(word: u32) -> u16 {
    (word >> 16) as u16
}

impl AtomicRefcount {
    pub const fn new(hash: u16, count: u16) -> Self {
        Self {
            word: AtomicU32::new(pack(hash, count)),
        }
    }

    pub const fn permanent(hash: u16) -> Self {
        Self::new(hash, PERMANENT)
    }

    #[inline]
    pub fn hash(&self) -> u16 {
        hash_of(self.word.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn refcount(&self) -> u16 {
        count_of(self.word.load(Ordering::Acquire))
    }

    pub fn state(&self) -> RefcountState {
        match self.refcount() {
            PERMANENT => RefcountState::Permanent,
            n => RefcountState::Counted(n),
        }
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.refcount() == PERMANENT
    }

    /// Take a reference. Panics on a dead (zero) value: the caller held a
    /// dangling reference.
    pub fn increment(&self) {
        if !self.try_increment() {
            panic!("refcount increment on a dead value");
        }
    }

    /// Take a reference unless the value is dead. Used by table lookups that
    /// may race with the last release.
    pub fn try_increment(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let count = count_of(current);
            if count == PERMANENT {
                return true;
            }
            if count == 0 {
                return false;
            }
            let next = pack(hash_of(current), count + 1);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. Returns true when this call released the last one.
    /// Panics on underflow.
    pub fn decrement(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let count = count_of(current);
            if count == PERMANENT {
                return false;
            }
            assert!(count != 0, "refcount underflow");
            let next = pack(hash_of(current), count - 1);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return count == 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pin the value forever. Panics on a dead value, which cannot be revived.
    pub fn make_permanent(&self) {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let count = count_of(current);
            if count == PERMANENT {
                return;
            }
            assert!(count != 0, "cannot make a dead value permanent");
            let next = pack(hash_of(current), PERMANENT);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn hash_survives_transitions() {
        let rc = AtomicRefcount::new(0xBEEF, 1);
        rc.increment();
        assert_eq!(rc.refcount(), 2);
        assert!(!rc.decrement());
        assert!(rc.decrement());
        assert_eq!(rc.hash(), 0xBEEF);
        assert_eq!(rc.state(), RefcountState::Counted(0));
    }

    #[test]
    fn dead_value_refuses_references() {
        let rc = AtomicRefcount::new(1, 0);
        assert!(!rc.try_increment());
        assert_eq!(rc.refcount(), 0);
    }

    #[test]
    #[should_panic(expected = "dead value")]
    fn increment_of_dead_value_panics() {
        AtomicRefcount::new(1, 0).increment();
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decrement_below_zero_panics() {
        AtomicRefcount::new(1, 0).decrement();
    }

    #[test]
    #[should_panic(expected = "dead value permanent")]
    fn dead_value_cannot_become_permanent() {
        AtomicRefcount::new(1, 0).make_permanent();
    }

    #[test]
    fn permanent_is_sticky() {
        let rc = AtomicRefcount::new(7, 3);
        rc.make_permanent();
        for _ in 0..100_000 {
            assert!(!rc.decrement());
        }
        assert!(rc.try_increment());
        assert_eq!(rc.state(), RefcountState::Permanent);
        assert_eq!(rc.hash(), 7);
    }

    #[test]
    fn counting_saturates_into_permanent() {
        let rc = AtomicRefcount::new(0, PERMANENT - 1);
        rc.increment();
        assert!(rc.is_permanent());
        rc.decrement();
        assert!(rc.is_permanent());
    }

    #[test]
    fn concurrent_increments_and_decrements_balance() {
        let rc = Arc::new(AtomicRefcount::new(42, 1));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let rc = rc.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        rc.increment();
                    }
                    for _ in 0..1_000 {
                        rc.decrement();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(rc.refcount(), 1);
        assert_eq!(rc.hash(), 42);
    }
}
