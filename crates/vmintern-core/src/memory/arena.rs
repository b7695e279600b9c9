use bumpalo::Bump;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::sync::Arc;

use super::tracker::{MemoryCategory, MemoryTracker};
use crate::error::{CoreError, Result};

/// Byte arena for data that lives as long as the process.
///
/// Backed by a leaked `bumpalo::Bump` that is never reset, so every slice
/// handed out is `'static`. The optional limit counts bytes handed out, not
/// chunk capacity, and turns exhaustion into an error instead of growth.
#[derive(Debug)]
pub struct PermanentArena {
    state: Mutex<ArenaState>,
    limit: Option<usize>,
    tracker: Arc<MemoryTracker>,
}

#[derive(Debug)]
struct ArenaState {
    bump: &'static mut Bump,
    reserved: usize,
    used: usize,
    chunks: usize,
}

impl PermanentArena {
    pub fn new(chunk_bytes: usize, limit: Option<usize>, tracker: Arc<MemoryTracker>) -> Self {
        let bump: &'static mut Bump =
            Box::leak(Box::new(Bump::with_capacity(chunk_bytes.max(1))));
        let reserved = bump.allocated_bytes();
        if reserved > 0 {
            tracker.record_bytes(MemoryCategory::PermanentArena, reserved as i64);
        }
        Self {
            state: Mutex::new(ArenaState {
                bump,
                reserved,
                used: 0,
                chunks: usize::from(reserved > 0),
            }),
            limit,
            tracker,
        }
    }

    /// Copy `bytes` into the arena.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<&'static [u8]> {
        if bytes.is_empty() {
            return Ok(&[]);
        }

        let mut state = self.state.lock();
        let exhausted = |used: usize| CoreError::ArenaExhausted {
            requested: bytes.len(),
            used,
            limit: self.limit.unwrap_or(usize::MAX),
        };
        if let Some(limit) = self.limit {
            if state.used + bytes.len() > limit {
                return Err(exhausted(state.used));
            }
        }

        let layout = Layout::array::<u8>(bytes.len()).map_err(|_| exhausted(state.used))?;
        let ptr = state
            .bump
            .try_alloc_layout(layout)
            .map_err(|_| exhausted(state.used))?;
        // SAFETY: `ptr` is a fresh allocation of `bytes.len()` bytes from a bump
        // that is leaked and never reset, so the memory stays valid and
        // unaliased for the rest of the process.
        let slot: &'static [u8] = unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            std::slice::from_raw_parts(ptr.as_ptr(), bytes.len())
        };
        state.used += bytes.len();

        let reserved = state.bump.allocated_bytes();
        if reserved > state.reserved {
            self.tracker.record_bytes(
                MemoryCategory::PermanentArena,
                (reserved - state.reserved) as i64,
            );
            state.reserved = reserved;
            state.chunks += 1;
        }
        drop(state);

        self.tracker.record_alloc(MemoryCategory::PermanentArena, 1);
        Ok(slot)
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Bytes reserved in chunks, used or not.
    pub fn reserved(&self) -> usize {
        self.state.lock().reserved
    }

    pub fn chunks(&self) -> usize {
        self.state.lock().chunks
    }
}
