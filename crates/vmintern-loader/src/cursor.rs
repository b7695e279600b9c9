//! Work-splitting cursor over the live context list.
//!
//! Every clone of a [`ContextCursor`] shares one position. Scanners advance
//! it with a compare-and-swap, so each node is handed to exactly one of them.
//! The graph moves a cursor off a node before unlinking it.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use crate::context::{ContextState, LoaderContext};

#[derive(Debug)]
pub(crate) struct CursorState {
    position: ArcSwapOption<LoaderContext>,
}

impl CursorState {
    pub(crate) fn new(start: Option<Arc<LoaderContext>>) -> Self {
        Self {
            position: ArcSwapOption::new(start),
        }
    }

    /// Move past `node` if this cursor currently rests on it. Scanners only
    /// ever advance to `node.next` as well, so a lost race leaves the same
    /// result.
    pub(crate) fn skip(&self, node: &Arc<LoaderContext>) {
        let current = self.position.load_full();
        if current.as_ref().is_some_and(|at| Arc::ptr_eq(at, node)) {
            self.position.compare_and_swap(&current, node.next.load_full());
        }
    }
}

/// Shared cursor over the live contexts. Clone it to hand it to another
/// scanner thread.
#[derive(Debug, Clone)]
pub struct ContextCursor {
    state: Arc<CursorState>,
}

impl ContextCursor {
    pub(crate) fn new(state: Arc<CursorState>) -> Self {
        Self { state }
    }

    /// Claim the next live context. Nodes that stopped being live since the
    /// cursor was created are skipped.
    pub fn try_next(&self) -> Option<Arc<LoaderContext>> {
        loop {
            let current = self.state.position.load_full();
            let node = current.clone()?;
            let next = node.next.load_full();
            let prev = self.state.position.compare_and_swap(&current, next);
            if same_node(&prev, &current) && node.state() == ContextState::Live {
                return Some(node);
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.position.load().is_none()
    }
}

fn same_node(a: &Option<Arc<LoaderContext>>, b: &Option<Arc<LoaderContext>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
