//! Autoload rules: load a module the first time a sink/source name is asked for.
//!
//! Each entry maps a name to a `(module, args)` pair. [`AutoloadRegistry::request`]
//! is the trigger; the `in_action` flag keeps a load that synchronously asks
//! for the same name again from issuing a second load.

use std::sync::{Arc, Mutex, MutexGuard};

use sound_core_types::{ResourceKind, SubscriptionEvent, SubscriptionFacility, SubscriptionKind};

use crate::collab::{ModuleHandle, ModuleLoader, SubscriptionSink};
use crate::error::{Error, Result};
use crate::registry::{DualIndexRegistry, Handle};

/// Snapshot of an autoload entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoloadEntry {
    pub handle: Handle,
    pub name: String,
    pub kind: ResourceKind,
    /// Module spec to load, e.g. `module-null-sink`.
    pub module: String,
    /// Argument string passed to the module verbatim.
    pub args: String,
    /// `true` while a load triggered by this entry is running.
    pub in_action: bool,
}

struct EntryState {
    kind: ResourceKind,
    module: String,
    args: String,
    in_action: bool,
}

impl EntryState {
    fn snapshot(&self, handle: Handle, name: &str) -> AutoloadEntry {
        AutoloadEntry {
            handle,
            name: name.to_string(),
            kind: self.kind,
            module: self.module.clone(),
            args: self.args.clone(),
            in_action: self.in_action,
        }
    }
}

/// Registry of autoload entries.
///
/// The entry table sits behind a mutex so the registry can be shared with the
/// module host that resolves names; the lock is never held across a loader
/// call.
pub struct AutoloadRegistry {
    entries: Mutex<DualIndexRegistry<EntryState>>,
    events: Arc<dyn SubscriptionSink>,
}

impl AutoloadRegistry {
    pub fn new(events: Arc<dyn SubscriptionSink>) -> Self {
        Self {
            entries: Mutex::new(DualIndexRegistry::new()),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, DualIndexRegistry<EntryState>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn post(&self, kind: SubscriptionKind, handle: Handle) {
        self.events.post(SubscriptionEvent::new(
            SubscriptionFacility::Autoload,
            kind,
            handle.index(),
        ));
    }

    /// Add an entry. Fails with [`Error::Conflict`] if the name is taken by
    /// an entry of any kind.
    pub fn add(
        &self,
        name: &str,
        kind: ResourceKind,
        module: &str,
        args: &str,
    ) -> Result<Handle> {
        let inserted = self.entries().insert(
            name,
            EntryState {
                kind,
                module: module.to_string(),
                args: args.to_string(),
                in_action: false,
            },
        );
        let handle = inserted.map_err(|_| Error::Conflict {
            name: name.to_string(),
        })?;
        tracing::debug!(name, kind = %kind, module, handle = %handle, "autoload entry added");
        self.post(SubscriptionKind::New, handle);
        Ok(handle)
    }

    /// Remove the entry for `name`; the kind must match.
    pub fn remove_by_name(&self, name: &str, kind: ResourceKind) -> Result<()> {
        let removed = {
            let mut entries = self.entries();
            let matches = entries
                .get_by_name(name)
                .is_some_and(|(_, entry)| entry.kind == kind);
            if matches { entries.remove_by_name(name) } else { None }
        };
        self.finish_remove(removed)
    }

    pub fn remove_by_handle(&self, handle: Handle) -> Result<()> {
        let removed = self.entries().remove_by_handle(handle);
        self.finish_remove(removed)
    }

    fn finish_remove(&self, removed: Option<(Handle, String, EntryState)>) -> Result<()> {
        let (handle, name, _entry) = removed.ok_or(Error::NotFound)?;
        tracing::debug!(name = %name, handle = %handle, "autoload entry removed");
        self.post(SubscriptionKind::Remove, handle);
        Ok(())
    }

    /// Trigger the entry for `name`, if any.
    ///
    /// No-op when there is no entry, the kind differs, or a load for this
    /// entry is already running. Returns the loaded module, if the load
    /// succeeded.
    pub fn request(
        &self,
        name: &str,
        kind: ResourceKind,
        loader: &dyn ModuleLoader,
    ) -> Option<ModuleHandle> {
        let (handle, module, args) = {
            let mut entries = self.entries();
            let (handle, entry) = entries.get_mut_by_name(name)?;
            if entry.kind != kind {
                return None;
            }
            if entry.in_action {
                tracing::debug!(name, "autoload already in action; ignoring nested request");
                return None;
            }
            entry.in_action = true;
            (handle, entry.module.clone(), entry.args.clone())
        };

        tracing::info!(name, kind = %kind, module = %module, "autoloading module");
        let loaded = match loader.load(&module, &args) {
            Ok(module_handle) => {
                loader.set_auto_unload(module_handle);
                Some(module_handle)
            }
            Err(e) => {
                tracing::warn!(name, module = %module, error = %e, "autoload failed");
                None
            }
        };

        if let Some(entry) = self.entries().get_mut_by_handle(handle) {
            entry.in_action = false;
        }
        loaded
    }

    pub fn get_by_name(&self, name: &str, kind: ResourceKind) -> Option<AutoloadEntry> {
        let entries = self.entries();
        let (handle, entry) = entries.get_by_name(name)?;
        (entry.kind == kind).then(|| entry.snapshot(handle, name))
    }

    pub fn get_by_handle(&self, handle: Handle) -> Option<AutoloadEntry> {
        let entries = self.entries();
        let name = entries.name_of(handle)?;
        entries
            .get_by_handle(handle)
            .map(|entry| entry.snapshot(handle, name))
    }

    /// Look up by numeric index, as seen in notifications.
    pub fn get_by_index(&self, index: u32) -> Option<AutoloadEntry> {
        let handle = self.entries().handle_at(index)?;
        self.get_by_handle(handle)
    }

    /// All entries in insertion order.
    pub fn list(&self) -> Vec<AutoloadEntry> {
        self.entries()
            .iter()
            .map(|(handle, name, entry)| entry.snapshot(handle, name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry, posting a removal notification for each.
    pub fn free(&self) {
        let mut removed = Vec::new();
        self.entries().clear(|handle, _, _| removed.push(handle));
        for handle in removed {
            self.post(SubscriptionKind::Remove, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SubscriptionEvent>>,
    }

    impl SubscriptionSink for RecordingSink {
        fn post(&self, event: SubscriptionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<SubscriptionKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[derive(Default)]
    struct MockLoader {
        modules: Mutex<DualIndexRegistry<String>>,
        loads: Mutex<Vec<(String, String)>>,
        auto_unload: Mutex<Vec<ModuleHandle>>,
        fail: bool,
        reenter: Option<(Arc<AutoloadRegistry>, String, ResourceKind)>,
        nested: Mutex<Vec<Option<ModuleHandle>>>,
    }

    impl ModuleLoader for MockLoader {
        fn load(&self, spec: &str, args: &str) -> Result<ModuleHandle> {
            self.loads
                .lock()
                .unwrap()
                .push((spec.to_string(), args.to_string()));
            if let Some((registry, name, kind)) = self.reenter.as_ref() {
                let nested = registry.request(name, *kind, self);
                self.nested.lock().unwrap().push(nested);
            }
            if self.fail {
                return Err(Error::LoadFailed {
                    spec: spec.to_string(),
                    reason: "mock failure".to_string(),
                });
            }
            let mut modules = self.modules.lock().unwrap();
            let name = format!("module-{}", modules.len());
            modules.insert(name, spec.to_string())
        }

        fn set_auto_unload(&self, module: ModuleHandle) {
            self.auto_unload.lock().unwrap().push(module);
        }

        fn request_unload(&self, _module: ModuleHandle, _force: bool) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> (Arc<RecordingSink>, Arc<AutoloadRegistry>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(AutoloadRegistry::new(sink.clone()));
        (sink, registry)
    }

    #[test]
    fn add_rejects_duplicate_names_across_kinds() {
        let (sink, registry) = registry();
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "sink_name=output")
            .expect("add");
        let err = registry
            .add("output", ResourceKind::Source, "module-alsa-source", "")
            .expect_err("conflict");
        assert_eq!(
            err,
            Error::Conflict {
                name: "output".to_string()
            }
        );
        assert_eq!(sink.kinds(), vec![SubscriptionKind::New]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_succeeds_again_after_removal() {
        let (_, registry) = registry();
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "")
            .expect("add");
        registry
            .remove_by_name("output", ResourceKind::Sink)
            .expect("remove");
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "")
            .expect("re-add");
    }

    #[test]
    fn remove_requires_matching_kind_and_is_idempotent() {
        let (sink, registry) = registry();
        let handle = registry
            .add("mic", ResourceKind::Source, "module-alsa-source", "")
            .expect("add");

        assert_eq!(
            registry.remove_by_name("mic", ResourceKind::Sink),
            Err(Error::NotFound)
        );
        assert!(registry.get_by_handle(handle).is_some());

        registry.remove_by_handle(handle).expect("remove");
        assert_eq!(registry.remove_by_handle(handle), Err(Error::NotFound));
        assert_eq!(
            registry.remove_by_name("mic", ResourceKind::Source),
            Err(Error::NotFound)
        );
        assert_eq!(
            sink.kinds(),
            vec![SubscriptionKind::New, SubscriptionKind::Remove]
        );
        let events = sink.events.lock().unwrap();
        assert_eq!(events[1].index, handle.index());
    }

    #[test]
    fn request_loads_module_and_marks_auto_unload() {
        let (_, registry) = registry();
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "sink_name=output")
            .expect("add");
        let loader = MockLoader::default();

        let loaded = registry
            .request("output", ResourceKind::Sink, &loader)
            .expect("loaded");

        assert_eq!(
            *loader.loads.lock().unwrap(),
            vec![(
                "module-null-sink".to_string(),
                "sink_name=output".to_string()
            )]
        );
        assert_eq!(*loader.auto_unload.lock().unwrap(), vec![loaded]);
        let entry = registry
            .get_by_name("output", ResourceKind::Sink)
            .expect("entry");
        assert!(!entry.in_action);
    }

    #[test]
    fn request_ignores_missing_entries_and_kind_mismatch() {
        let (_, registry) = registry();
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "")
            .expect("add");
        let loader = MockLoader::default();

        assert!(registry
            .request("missing", ResourceKind::Sink, &loader)
            .is_none());
        assert!(registry
            .request("output", ResourceKind::Source, &loader)
            .is_none());
        assert!(loader.loads.lock().unwrap().is_empty());
    }

    #[test]
    fn nested_request_for_same_name_is_a_no_op() {
        let (_, registry) = registry();
        registry
            .add("loop", ResourceKind::Sink, "module-remap-sink", "master=loop")
            .expect("add");
        let loader = MockLoader {
            reenter: Some((registry.clone(), "loop".to_string(), ResourceKind::Sink)),
            ..MockLoader::default()
        };

        let loaded = registry.request("loop", ResourceKind::Sink, &loader);

        assert!(loaded.is_some());
        assert_eq!(loader.loads.lock().unwrap().len(), 1);
        assert_eq!(*loader.nested.lock().unwrap(), vec![None]);
        let entry = registry.get_by_name("loop", ResourceKind::Sink).expect("entry");
        assert!(!entry.in_action);
    }

    #[test]
    fn nested_request_for_other_name_proceeds() {
        let (_, registry) = registry();
        registry
            .add("outer", ResourceKind::Sink, "module-remap-sink", "master=inner")
            .expect("add outer");
        registry
            .add("inner", ResourceKind::Sink, "module-null-sink", "sink_name=inner")
            .expect("add inner");
        let loader = MockLoader {
            reenter: Some((registry.clone(), "inner".to_string(), ResourceKind::Sink)),
            ..MockLoader::default()
        };

        registry.request("outer", ResourceKind::Sink, &loader);

        let loads = loader.loads.lock().unwrap();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].0, "module-remap-sink");
        assert_eq!(loads[1].0, "module-null-sink");
    }

    #[test]
    fn failed_load_keeps_entry_and_allows_retry() {
        let (_, registry) = registry();
        registry
            .add("output", ResourceKind::Sink, "module-null-sink", "")
            .expect("add");
        let loader = MockLoader {
            fail: true,
            ..MockLoader::default()
        };

        assert!(registry
            .request("output", ResourceKind::Sink, &loader)
            .is_none());
        assert!(registry
            .request("output", ResourceKind::Sink, &loader)
            .is_none());

        assert_eq!(loader.loads.lock().unwrap().len(), 2);
        assert!(loader.auto_unload.lock().unwrap().is_empty());
        let entry = registry
            .get_by_name("output", ResourceKind::Sink)
            .expect("entry kept");
        assert!(!entry.in_action);
    }

    #[test]
    fn lookups_by_name_handle_and_index_agree() {
        let (_, registry) = registry();
        let handle = registry
            .add("output", ResourceKind::Sink, "module-null-sink", "x=1")
            .expect("add");

        let by_name = registry.get_by_name("output", ResourceKind::Sink);
        let by_handle = registry.get_by_handle(handle);
        let by_index = registry.get_by_index(handle.index());
        assert!(by_name.is_some());
        assert_eq!(by_name, by_handle);
        assert_eq!(by_handle, by_index);
        assert!(registry.get_by_name("output", ResourceKind::Source).is_none());
    }

    #[test]
    fn free_posts_removal_for_every_entry() {
        let (sink, registry) = registry();
        registry
            .add("a", ResourceKind::Sink, "module-null-sink", "")
            .expect("add");
        registry
            .add("b", ResourceKind::Source, "module-alsa-source", "")
            .expect("add");

        registry.free();
        registry.free();

        assert!(registry.is_empty());
        assert_eq!(
            sink.kinds(),
            vec![
                SubscriptionKind::New,
                SubscriptionKind::New,
                SubscriptionKind::Remove,
                SubscriptionKind::Remove
            ]
        );
    }
}
