//! Identifiers held by a loader context live exactly as long as the context.

use std::sync::Arc;
use std::thread;
use vmintern_core::{MaintenanceConfig, RuntimeConfig};
use vmintern_runtime::{
    ContextDescriptor, ContextState, Identifier, LoaderObject, PurgeMode, Runtime,
    SafepointCoordinator, Text,
};

fn foreground_runtime() -> Runtime {
    Runtime::new(RuntimeConfig {
        maintenance: MaintenanceConfig {
            background: false,
            ..MaintenanceConfig::default()
        },
        ..RuntimeConfig::default()
    })
    .expect("runtime")
}

#[test]
fn context_held_identifiers_are_reclaimed_after_unload() {
    let runtime = foreground_runtime();
    let loader = LoaderObject::new("app");
    let context = runtime.register_context(ContextDescriptor::for_loader(&loader));

    let interned: Vec<Identifier> = thread::scope(|scope| {
        let workers: Vec<_> = ["foo", "bar", "foo"]
            .into_iter()
            .map(|name| {
                let runtime = &runtime;
                scope.spawn(move || runtime.intern_identifier(name.as_bytes()).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(Identifier::ptr_eq(&interned[0], &interned[2]));
    assert!(!Identifier::ptr_eq(&interned[0], &interned[1]));
    assert_eq!(interned[0].refcount(), 2);
    assert_eq!(interned[1].refcount(), 1);

    for identifier in interned {
        context.retain_identifier(identifier).unwrap();
    }
    let foo = runtime.find_identifier(b"foo").unwrap();
    assert_eq!(foo.refcount(), 3);
    runtime.release_identifier(foo);

    drop(loader);
    let coordinator = Arc::clone(runtime.safepoints());
    let report = coordinator.execute(|guard| {
        assert!(runtime.unload_dead_contexts(guard));
        runtime.purge(PurgeMode::AtSafepoint(guard))
    });
    assert_eq!(report.purged, 1);
    assert_eq!(context.state(), ContextState::Purged);

    assert!(runtime.find_identifier(b"foo").is_none());
    assert!(runtime.find_identifier(b"bar").is_none());

    let before = runtime.identifiers().len();
    let pass = runtime.run_identifier_maintenance();
    assert_eq!(pass.removed, 2);
    assert_eq!(runtime.identifiers().len(), before - 2);

    // A fresh intern creates a new row rather than reviving the old one.
    let again = runtime.intern_identifier(b"foo").unwrap();
    assert_eq!(again.refcount(), 1);
}

#[test]
fn unreachable_text_is_swept_after_collection() {
    let runtime = foreground_runtime();
    let held = runtime.intern_text(&Text::new("kept"));
    let dropped = runtime.intern_str("transient");
    assert!(Text::ptr_eq(&runtime.lookup_text("transient").unwrap(), &dropped));
    drop(dropped);

    let report = runtime.collect();
    assert_eq!(report.dead_text, 1);
    assert_eq!(runtime.run_text_maintenance().removed, 1);

    assert!(runtime.lookup_text("transient").is_none());
    assert!(Text::ptr_eq(&runtime.lookup_text("kept").unwrap(), &held));
}

#[test]
#[should_panic(expected = "another coordinator")]
fn unloading_requires_this_runtimes_safepoint() {
    let runtime = foreground_runtime();
    let elsewhere = SafepointCoordinator::new();
    let guard = elsewhere.synchronize();
    runtime.unload_dead_contexts(&guard);
}

#[test]
fn permanent_identifiers_survive_collection() {
    let runtime = foreground_runtime();
    let keep = runtime.intern_permanent_identifier(b"vm/Builtin").unwrap();
    runtime.release_identifier(keep);
    runtime.collect();
    runtime.run_identifier_maintenance();

    let found = runtime.find_identifier(b"vm/Builtin").unwrap();
    assert!(found.is_permanent());
    assert!(found.is_arena_allocated());
}

#[test]
fn statistics_serialize_to_json() {
    let runtime = foreground_runtime();
    runtime.intern_identifier(b"counted").unwrap();
    let value = serde_json::to_value(runtime.statistics()).unwrap();
    assert!(value["identifiers"]["table"]["items"].as_u64().unwrap() > 0);
    assert_eq!(value["graph"]["live"], 1);
    assert!(value["service"].is_null());
}
