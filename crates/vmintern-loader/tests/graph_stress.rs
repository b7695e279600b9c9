//! Concurrent registration against lock-free readers and safepoint unloading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use vmintern_core::SafepointCoordinator;
use vmintern_loader::{ContextDescriptor, ContextState, LoaderContextGraph, LoaderObject};

const WRITERS: usize = 4;
const PER_WRITER: usize = 250;

#[test]
fn readers_never_observe_partial_nodes() {
    let graph = LoaderContextGraph::new(SafepointCoordinator::new());
    let done = AtomicBool::new(false);
    let loaders: Vec<_> = (0..WRITERS * PER_WRITER)
        .map(|i| LoaderObject::new(format!("writer-{}/{}", i / PER_WRITER, i % PER_WRITER)))
        .collect();

    thread::scope(|scope| {
        for chunk in loaders.chunks(PER_WRITER) {
            let graph = &graph;
            scope.spawn(move || {
                for loader in chunk {
                    graph.add(ContextDescriptor::for_loader(loader));
                }
            });
        }

        for _ in 0..2 {
            scope.spawn(|| {
                let mut passes = 0usize;
                while !done.load(Ordering::Acquire) || passes == 0 {
                    let mut last_id = u64::MAX;
                    let mut saw_boot = false;
                    for context in graph.iter() {
                        assert!(context.id() < last_id, "list must be newest first");
                        last_id = context.id();
                        assert_eq!(context.state(), ContextState::Live);
                        if context.is_boot() {
                            saw_boot = true;
                        } else {
                            assert!(context.name().starts_with("writer-"));
                        }
                    }
                    assert!(saw_boot, "every walk ends at the boot context");
                    passes += 1;
                }
            });
        }

        // Writers finish before the scope joins the readers.
        while graph.live_count() < WRITERS * PER_WRITER + 1 {
            thread::yield_now();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(graph.iter().count(), WRITERS * PER_WRITER + 1);
}

#[test]
fn unloading_keeps_every_reachable_context() {
    let graph = Arc::new(LoaderContextGraph::new(SafepointCoordinator::new()));
    let mut loaders: Vec<_> = (0..100)
        .map(|i| LoaderObject::new(format!("loader-{i}")))
        .collect();
    let contexts: Vec<_> = loaders
        .iter()
        .map(|loader| graph.add(ContextDescriptor::for_loader(loader)))
        .collect();

    // Drop every third loader.
    let mut index = 0;
    loaders.retain(|_| {
        index += 1;
        index % 3 != 0
    });

    let coordinator = Arc::clone(graph.coordinator());
    coordinator.execute(|guard| {
        assert!(graph.unload_dead_contexts(guard));
    });

    for (i, context) in contexts.iter().enumerate() {
        let expected_live = (i + 1) % 3 != 0;
        assert_eq!(graph.is_valid(context), expected_live, "context {i}");
    }
    assert_eq!(graph.live_count(), loaders.len() + 1);
    assert_eq!(graph.unloading_count(), 100 - loaders.len());
}
