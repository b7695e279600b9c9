use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use vmintern_strings::Text;
use vmintern_symbols::Identifier;

use crate::error::{LoaderError, Result};

/// The application-side loader a context belongs to. A context stays alive
/// while some strong `Arc<LoaderObject>` exists.
#[derive(Debug)]
pub struct LoaderObject {
    name: String,
}

impl LoaderObject {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// The built-in loader; never unloaded
    Boot,
    /// One per application loader
    Loader,
    /// A context for a single hidden class, kept alive explicitly
    Hidden,
}

#[derive(Debug, Clone)]
pub struct ContextDescriptor {
    kind: ContextKind,
    name: String,
    holder: Option<Weak<LoaderObject>>,
}

impl ContextDescriptor {
    pub(crate) fn boot() -> Self {
        Self {
            kind: ContextKind::Boot,
            name: "boot".to_string(),
            holder: None,
        }
    }

    pub fn for_loader(loader: &Arc<LoaderObject>) -> Self {
        Self {
            kind: ContextKind::Loader,
            name: loader.name().to_string(),
            holder: Some(Arc::downgrade(loader)),
        }
    }

    /// Context for one hidden class of `loader`. Starts with one keep-alive
    /// reference owned by whoever defines the class.
    pub fn hidden(loader: &Arc<LoaderObject>, class_name: &str) -> Self {
        Self {
            kind: ContextKind::Hidden,
            name: format!("{}/{}", loader.name(), class_name),
            holder: Some(Arc::downgrade(loader)),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ContextState {
    Live = 0,
    Unloading = 1,
    Purged = 2,
}

impl ContextState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Live,
            1 => Self::Unloading,
            _ => Self::Purged,
        }
    }
}

/// Metadata of one loaded class: the identifiers and text it keeps alive.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    name: Identifier,
    super_name: Option<Identifier>,
    members: Vec<Identifier>,
    constants: Vec<Text>,
}

impl ClassDefinition {
    pub fn new(name: Identifier) -> Self {
        Self {
            name,
            super_name: None,
            members: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn with_super(mut self, super_name: Identifier) -> Self {
        self.super_name = Some(super_name);
        self
    }

    /// Method or field name, or a signature.
    pub fn with_member(mut self, member: Identifier) -> Self {
        self.members.push(member);
        self
    }

    /// A text literal from the constant pool.
    pub fn with_constant(mut self, constant: Text) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn name(&self) -> &Identifier {
        &self.name
    }

    pub fn super_name(&self) -> Option<&Identifier> {
        self.super_name.as_ref()
    }

    pub fn members(&self) -> &[Identifier] {
        &self.members
    }

    pub fn constants(&self) -> &[Text] {
        &self.constants
    }
}

/// A context's strong edge to another loader, keeping it reachable.
#[derive(Debug)]
struct Dependency {
    target: u64,
    _holder: Arc<LoaderObject>,
}

/// One class-loading context, a node of the loader graph.
pub struct LoaderContext {
    id: u64,
    kind: ContextKind,
    name: String,
    holder: Option<Weak<LoaderObject>>,
    keep_alive: AtomicI32,
    state: AtomicU8,
    /// Read-held while metadata is added, write-held while it is released.
    metadata: RwLock<()>,
    pub(crate) next: ArcSwapOption<LoaderContext>,
    pub(crate) unloading_next: ArcSwapOption<LoaderContext>,
    classes: DashMap<Identifier, Arc<ClassDefinition>>,
    retained_identifiers: Mutex<Vec<Identifier>>,
    retained_text: Mutex<Vec<Text>>,
    dependencies: Mutex<Vec<Dependency>>,
    deallocate_list: Mutex<Vec<Arc<ClassDefinition>>>,
}

impl LoaderContext {
    pub(crate) fn new(id: u64, descriptor: ContextDescriptor) -> Self {
        let keep_alive = match descriptor.kind {
            ContextKind::Hidden => 1,
            ContextKind::Boot | ContextKind::Loader => 0,
        };
        Self {
            id,
            kind: descriptor.kind,
            name: descriptor.name,
            holder: descriptor.holder,
            keep_alive: AtomicI32::new(keep_alive),
            state: AtomicU8::new(ContextState::Live as u8),
            metadata: RwLock::new(()),
            next: ArcSwapOption::empty(),
            unloading_next: ArcSwapOption::empty(),
            classes: DashMap::new(),
            retained_identifiers: Mutex::new(Vec::new()),
            retained_text: Mutex::new(Vec::new()),
            dependencies: Mutex::new(Vec::new()),
            deallocate_list: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_boot(&self) -> bool {
        self.kind == ContextKind::Boot
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn holder(&self) -> Option<Arc<LoaderObject>> {
        self.holder.as_ref().and_then(Weak::upgrade)
    }

    /// Boot is always alive; others while explicitly kept alive or while
    /// their loader object is reachable.
    pub fn is_alive(&self) -> bool {
        self.is_boot()
            || self.keep_alive.load(Ordering::Acquire) > 0
            || self
                .holder
                .as_ref()
                .is_some_and(|holder| holder.strong_count() > 0)
    }

    pub fn keep_alive_count(&self) -> i32 {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn inc_keep_alive(&self) {
        self.keep_alive.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_keep_alive(&self) {
        let previous = self.keep_alive.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "keep-alive underflow on {}", self.name);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state() != ContextState::Live {
            return Err(LoaderError::ContextUnloading {
                context: self.name.clone(),
            });
        }
        Ok(())
    }

    pub fn define_class(&self, definition: ClassDefinition) -> Result<Arc<ClassDefinition>> {
        let _adding = self.metadata.read();
        self.ensure_live()?;
        match self.classes.entry(definition.name().clone()) {
            Entry::Occupied(_) => Err(LoaderError::DuplicateClass {
                name: definition.name().to_string(),
                context: self.name.clone(),
            }),
            Entry::Vacant(slot) => {
                let definition = Arc::new(definition);
                slot.insert(Arc::clone(&definition));
                Ok(definition)
            }
        }
    }

    /// Replace a defined class. The old definition may still be in use, so
    /// it waits on the deallocate list for the next safepoint cleanup.
    pub fn redefine_class(&self, definition: ClassDefinition) -> Result<Arc<ClassDefinition>> {
        let _adding = self.metadata.read();
        self.ensure_live()?;
        let name = definition.name().clone();
        let definition = Arc::new(definition);
        match self.classes.get_mut(&name) {
            Some(mut current) => {
                let old = std::mem::replace(&mut *current, Arc::clone(&definition));
                self.deallocate_list.lock().push(old);
                Ok(definition)
            }
            None => Err(LoaderError::UnknownClass {
                name: name.to_string(),
                context: self.name.clone(),
            }),
        }
    }

    pub fn find_class(&self, name: &Identifier) -> Option<Arc<ClassDefinition>> {
        self.classes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Keep `identifier` alive for the lifetime of this context. Refused
    /// once the context is unloading; the identifier is released on return.
    pub fn retain_identifier(&self, identifier: Identifier) -> Result<()> {
        let _adding = self.metadata.read();
        self.ensure_live()?;
        self.retained_identifiers.lock().push(identifier);
        Ok(())
    }

    pub fn retain_text(&self, text: Text) -> Result<()> {
        let _adding = self.metadata.read();
        self.ensure_live()?;
        self.retained_text.lock().push(text);
        Ok(())
    }

    pub fn with_retained<R>(&self, visit: impl FnOnce(&[Identifier]) -> R) -> R {
        visit(&self.retained_identifiers.lock())
    }

    /// Record that classes of this context refer to classes of `target`,
    /// keeping `target`'s loader reachable. Edges to boot, to self, and to
    /// contexts without a live loader are not recorded.
    pub fn record_dependency(&self, target: &LoaderContext) -> bool {
        if target.is_boot() || target.id == self.id {
            return false;
        }
        let Some(holder) = target.holder() else {
            return false;
        };
        let mut dependencies = self.dependencies.lock();
        if dependencies.iter().any(|dep| dep.target == target.id) {
            return false;
        }
        dependencies.push(Dependency {
            target: target.id,
            _holder: holder,
        });
        true
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    pub fn pending_deallocations(&self) -> usize {
        self.deallocate_list.lock().len()
    }

    pub(crate) fn drop_dependencies(&self) -> usize {
        std::mem::take(&mut *self.dependencies.lock()).len()
    }

    /// Drop every class and retained value. Returns the number of entries
    /// released. Callers move the context out of `Live` first, so nothing
    /// can be added after the release.
    pub(crate) fn release_metadata(&self) -> usize {
        let _releasing = self.metadata.write();
        let classes = self.classes.len();
        self.classes.clear();
        let identifiers = std::mem::take(&mut *self.retained_identifiers.lock()).len();
        let text = std::mem::take(&mut *self.retained_text.lock()).len();
        let deallocated = self.free_deallocate_list();
        classes + identifiers + text + deallocated
    }

    pub(crate) fn free_deallocate_list(&self) -> usize {
        std::mem::take(&mut *self.deallocate_list.lock()).len()
    }
}

impl fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("classes", &self.classes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmintern_symbols::IdentifierTable;

    #[test]
    fn liveness_follows_holder_and_keep_alive() {
        let loader = LoaderObject::new("app");
        let context = LoaderContext::new(1, ContextDescriptor::for_loader(&loader));
        assert!(context.is_alive());
        context.inc_keep_alive();
        drop(loader);
        assert!(context.is_alive());
        context.dec_keep_alive();
        assert!(!context.is_alive());
        assert!(context.holder().is_none());
    }

    #[test]
    fn hidden_contexts_start_kept_alive() {
        let loader = LoaderObject::new("app");
        let hidden = LoaderContext::new(2, ContextDescriptor::hidden(&loader, "Lambda$1"));
        drop(loader);
        assert!(hidden.is_alive());
        assert_eq!(hidden.name(), "app/Lambda$1");
        hidden.dec_keep_alive();
        assert!(!hidden.is_alive());
    }

    #[test]
    #[should_panic(expected = "keep-alive underflow")]
    fn keep_alive_underflow_panics() {
        let context = LoaderContext::new(3, ContextDescriptor::boot());
        context.dec_keep_alive();
    }

    #[test]
    fn classes_are_defined_once_and_redefined_via_deallocate_list() {
        let ids = IdentifierTable::with_defaults().unwrap();
        let loader = LoaderObject::new("app");
        let context = LoaderContext::new(1, ContextDescriptor::for_loader(&loader));
        let name = ids.intern(b"app/Main").unwrap();

        let first = context
            .define_class(ClassDefinition::new(name.clone()))
            .unwrap();
        let err = context
            .define_class(ClassDefinition::new(name.clone()))
            .unwrap_err();
        assert!(matches!(err, LoaderError::DuplicateClass { .. }));

        let second = context
            .redefine_class(
                ClassDefinition::new(name.clone()).with_member(ids.intern(b"run").unwrap()),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&context.find_class(&name).unwrap(), &second));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(context.pending_deallocations(), 1);
        assert_eq!(context.free_deallocate_list(), 1);

        let missing = ids.intern(b"app/Missing").unwrap();
        assert!(matches!(
            context.redefine_class(ClassDefinition::new(missing)),
            Err(LoaderError::UnknownClass { .. })
        ));
    }

    #[test]
    fn unloading_contexts_refuse_definitions() {
        let ids = IdentifierTable::with_defaults().unwrap();
        let context = LoaderContext::new(1, ContextDescriptor::boot());
        context.set_state(ContextState::Unloading);
        let result = context.define_class(ClassDefinition::new(ids.intern(b"X").unwrap()));
        assert!(matches!(result, Err(LoaderError::ContextUnloading { .. })));
    }

    #[test]
    fn released_contexts_refuse_retained_values() {
        let ids = IdentifierTable::with_defaults().unwrap();
        let context = LoaderContext::new(1, ContextDescriptor::boot());
        let name = ids.intern(b"late").unwrap();
        let text = Text::new("late literal");
        let text_row = text.downgrade();

        context.set_state(ContextState::Unloading);
        assert_eq!(context.release_metadata(), 0);
        context.set_state(ContextState::Purged);

        let result = context.retain_identifier(name.clone());
        assert!(matches!(result, Err(LoaderError::ContextUnloading { .. })));
        assert_eq!(name.refcount(), 1);
        assert_eq!(context.with_retained(|held| held.len()), 0);

        assert!(context.retain_text(text).is_err());
        assert!(text_row.upgrade().is_none());
    }

    #[test]
    fn definitions_racing_a_release_are_never_stranded() {
        let ids = IdentifierTable::with_defaults().unwrap();
        let context = LoaderContext::new(1, ContextDescriptor::boot());
        let names: Vec<_> = (0..256)
            .map(|i| ids.intern(format!("race/C{i}").as_bytes()).unwrap())
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for name in &names {
                    let _ = context.define_class(ClassDefinition::new(name.clone()));
                    let _ = context.retain_identifier(name.clone());
                }
            });
            scope.spawn(|| {
                std::thread::yield_now();
                context.set_state(ContextState::Unloading);
                context.release_metadata();
            });
        });

        assert_eq!(context.class_count(), 0);
        assert_eq!(context.with_retained(|held| held.len()), 0);
        for name in &names {
            assert_eq!(name.refcount(), 1);
        }
    }

    #[test]
    fn metadata_release_drops_retained_references() {
        let ids = IdentifierTable::with_defaults().unwrap();
        let context = LoaderContext::new(1, ContextDescriptor::boot());
        let name = ids.intern(b"held").unwrap();
        context.retain_identifier(name.clone()).unwrap();
        context.retain_text(Text::new("literal")).unwrap();
        context
            .define_class(ClassDefinition::new(ids.intern(b"Cls").unwrap()))
            .unwrap();
        assert_eq!(name.refcount(), 2);
        assert_eq!(context.with_retained(|held| held.len()), 1);

        assert_eq!(context.release_metadata(), 3);
        assert_eq!(name.refcount(), 1);
        assert_eq!(context.class_count(), 0);
    }

    #[test]
    fn dependencies_skip_boot_self_and_duplicates() {
        let a_loader = LoaderObject::new("a");
        let b_loader = LoaderObject::new("b");
        let boot = LoaderContext::new(0, ContextDescriptor::boot());
        let a = LoaderContext::new(1, ContextDescriptor::for_loader(&a_loader));
        let b = LoaderContext::new(2, ContextDescriptor::for_loader(&b_loader));

        assert!(!a.record_dependency(&boot));
        assert!(!a.record_dependency(&a));
        assert!(a.record_dependency(&b));
        assert!(!a.record_dependency(&b));
        assert_eq!(a.dependency_count(), 1);

        drop(b_loader);
        assert!(b.is_alive());
        assert_eq!(a.drop_dependencies(), 1);
        assert!(!b.is_alive());
    }
}
