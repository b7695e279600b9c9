//! Cooperative stop-the-world coordination.
//!
//! Mutator threads attach to a [`SafepointCoordinator`] and either poll at
//! safe points or declare themselves blocked. A requester calls
//! [`SafepointCoordinator::synchronize`], which returns once every attached
//! mutator is stopped. The returned [`SafepointGuard`] is the proof that
//! structural operations (loader unloading, purge at a safepoint) demand;
//! dropping it resumes the mutators.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct SyncState {
    attached: usize,
    stopped: usize,
    requested: bool,
}

#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    state: Mutex<SyncState>,
    all_stopped: Condvar,
    resumed: Condvar,
    operation: Mutex<()>,
    poll_armed: AtomicBool,
    active: AtomicBool,
    completed: AtomicU64,
}

impl SafepointCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the calling thread as a mutator. Blocks while a safepoint is
    /// in progress so a new thread never starts running inside one.
    pub fn attach(self: &Arc<Self>) -> MutatorHandle {
        let mut state = self.state.lock();
        while state.requested {
            self.resumed.wait(&mut state);
        }
        state.attached += 1;
        MutatorHandle {
            coordinator: Arc::clone(self),
        }
    }

    /// Stop every attached mutator and return the proof of it.
    ///
    /// Must not be called from a thread that is itself an attached, running
    /// mutator; such threads use [`MutatorHandle::safepoint`].
    pub fn synchronize(&self) -> SafepointGuard<'_> {
        let operation = self.operation.lock();
        let started = Instant::now();

        let mut state = self.state.lock();
        state.requested = true;
        self.poll_armed.store(true, Ordering::Release);
        while state.stopped < state.attached {
            self.all_stopped.wait(&mut state);
        }
        self.active.store(true, Ordering::Release);
        let mutators = state.attached;
        drop(state);

        debug!(
            mutators,
            sync_us = started.elapsed().as_micros() as u64,
            "safepoint reached"
        );
        SafepointGuard {
            coordinator: self,
            _operation: operation,
        }
    }

    /// Run `op` with all mutators stopped.
    pub fn execute<R>(&self, op: impl FnOnce(&SafepointGuard<'_>) -> R) -> R {
        let guard = self.synchronize();
        op(&guard)
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of safepoints that have completed.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn attached_mutators(&self) -> usize {
        self.state.lock().attached
    }

    /// Abort unless `guard` proves a safepoint of this coordinator.
    pub fn assert_at_safepoint(&self, guard: &SafepointGuard<'_>) {
        assert!(
            guard.belongs_to(self),
            "safepoint-only operation called with a guard from another coordinator"
        );
        assert!(
            self.is_at_safepoint(),
            "safepoint-only operation called outside a safepoint"
        );
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.requested = false;
        self.active.store(false, Ordering::Release);
        self.poll_armed.store(false, Ordering::Release);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.resumed.notify_all();
        trace!("safepoint released");
    }

    fn park(&self) {
        let mut state = self.state.lock();
        if !state.requested {
            return;
        }
        state.stopped += 1;
        self.all_stopped.notify_all();
        while state.requested {
            self.resumed.wait(&mut state);
        }
        state.stopped -= 1;
    }
}

/// Scoped proof that every mutator of one coordinator is stopped.
pub struct SafepointGuard<'a> {
    coordinator: &'a SafepointCoordinator,
    _operation: MutexGuard<'a, ()>,
}

impl SafepointGuard<'_> {
    pub fn belongs_to(&self, coordinator: &SafepointCoordinator) -> bool {
        std::ptr::eq(self.coordinator, coordinator)
    }

    pub fn coordinator(&self) -> &SafepointCoordinator {
        self.coordinator
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.resume();
    }
}

impl std::fmt::Debug for SafepointGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointGuard").finish_non_exhaustive()
    }
}

/// A registered mutator thread. Detaches on drop.
#[derive(Debug)]
pub struct MutatorHandle {
    coordinator: Arc<SafepointCoordinator>,
}

impl MutatorHandle {
    /// Stop here if a safepoint has been requested.
    #[inline]
    pub fn poll(&self) {
        if self.coordinator.poll_armed.load(Ordering::Acquire) {
            self.coordinator.park();
        }
    }

    /// Enter a region in which this thread counts as stopped (blocking I/O,
    /// waiting on a lock). The region must not touch state a safepoint
    /// operation mutates.
    pub fn blocked(&self) -> BlockedRegion<'_> {
        let mut state = self.coordinator.state.lock();
        state.stopped += 1;
        self.coordinator.all_stopped.notify_all();
        BlockedRegion {
            coordinator: &self.coordinator,
        }
    }

    /// Bring the world to a safepoint from a mutator thread and run `op`.
    pub fn safepoint<R>(&self, op: impl FnOnce(&SafepointGuard<'_>) -> R) -> R {
        let _region = self.blocked();
        let guard = self.coordinator.synchronize();
        op(&guard)
    }

    pub fn coordinator(&self) -> &Arc<SafepointCoordinator> {
        &self.coordinator
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock();
        state.attached -= 1;
        self.coordinator.all_stopped.notify_all();
    }
}

pub struct BlockedRegion<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl Drop for BlockedRegion<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock();
        while state.requested {
            self.coordinator.resumed.wait(&mut state);
        }
        state.stopped -= 1;
    }
}
