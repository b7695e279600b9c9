//! Background maintenance.
//!
//! Tables and the loader graph never run their own deferred work. They call
//! a [`MaintenanceNotifier`], which here posts a message to one service
//! thread per runtime. The thread steps table maintenance with yields between
//! steps and brings the world to a safepoint for loader cleanup.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};
use vmintern_core::{MaintenanceNotifier, MaintenanceWork};

use crate::error::Result;
use crate::runtime::RuntimeState;

const THREAD_NAME: &str = "vmintern-maintenance";

#[derive(Debug)]
enum ServiceMessage {
    Work(MaintenanceWork),
    Shutdown,
}

/// Posts work to the service thread. Never blocks.
#[derive(Debug)]
struct ChannelNotifier {
    tx: Sender<ServiceMessage>,
}

impl MaintenanceNotifier for ChannelNotifier {
    fn notify(&self, work: MaintenanceWork) {
        if self.tx.send(ServiceMessage::Work(work)).is_err() {
            trace!(?work, "maintenance service gone; request dropped");
        }
    }
}

#[derive(Debug, Default)]
struct ServiceCounters {
    identifier_passes: AtomicU64,
    text_passes: AtomicU64,
    loader_cleanups: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub identifier_passes: u64,
    pub text_passes: u64,
    pub loader_cleanups: u64,
}

/// Handle to the maintenance thread. Dropping it stops and joins the thread.
pub struct MaintenanceService {
    tx: Sender<ServiceMessage>,
    counters: Arc<ServiceCounters>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceService {
    pub(crate) fn start(state: Arc<RuntimeState>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let counters = Arc::new(ServiceCounters::default());
        let worker_counters = Arc::clone(&counters);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&state, &rx, &worker_counters))?;
        Ok(Self {
            tx,
            counters,
            handle: Some(handle),
        })
    }

    pub(crate) fn notifier(&self) -> Arc<dyn MaintenanceNotifier> {
        Arc::new(ChannelNotifier {
            tx: self.tx.clone(),
        })
    }

    /// Queue work directly, as a notifier would.
    pub fn request(&self, work: MaintenanceWork) {
        if self.tx.send(ServiceMessage::Work(work)).is_err() {
            warn!(?work, "maintenance service is not running");
        }
    }

    pub fn statistics(&self) -> ServiceStatistics {
        ServiceStatistics {
            identifier_passes: self.counters.identifier_passes.load(Ordering::Relaxed),
            text_passes: self.counters.text_passes.load(Ordering::Relaxed),
            loader_cleanups: self.counters.loader_cleanups.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MaintenanceService {
    fn drop(&mut self) {
        let _ = self.tx.send(ServiceMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for MaintenanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceService")
            .field("statistics", &self.statistics())
            .finish()
    }
}

fn run(state: &RuntimeState, rx: &Receiver<ServiceMessage>, counters: &ServiceCounters) {
    info!("maintenance service started");
    while let Ok(message) = rx.recv() {
        match message {
            ServiceMessage::Work(work) => perform(state, counters, work),
            ServiceMessage::Shutdown => break,
        }
    }
    info!("maintenance service stopped");
}

fn perform(state: &RuntimeState, counters: &ServiceCounters, work: MaintenanceWork) {
    match work {
        MaintenanceWork::Identifiers => {
            let pass = state.identifiers.run_maintenance();
            counters.identifier_passes.fetch_add(1, Ordering::Relaxed);
            debug!(grew = pass.grew, removed = pass.removed, "identifier pass");
        }
        MaintenanceWork::Text => {
            let pass = state.text.run_maintenance();
            counters.text_passes.fetch_add(1, Ordering::Relaxed);
            debug!(grew = pass.grew, removed = pass.removed, "text pass");
        }
        MaintenanceWork::LoaderCleanup => {
            if !state.graph.cleanup_needed() {
                return;
            }
            let guard = state.coordinator.synchronize();
            let freed = state.graph.clean_deallocate_lists(&guard);
            drop(guard);
            counters.loader_cleanups.fetch_add(1, Ordering::Relaxed);
            debug!(freed, "deferred loader cleanup finished");
        }
    }
}
