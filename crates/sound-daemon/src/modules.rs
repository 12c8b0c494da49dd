//! Module catalog and the in-process module host.
//!
//! The host owns every loaded module and the named objects (cards, sinks,
//! sources) those modules publish. Unloads are deferred: `request_unload`
//! queues the module and the event loop applies the queue with
//! [`ModuleHost::process_pending_unloads`] once the current dispatch is done.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sound_core::names::{is_valid_name, make_valid_name};
use sound_core::{
    AutoloadRegistry, CardAccess, DualIndexRegistry, Error, Handle, ModuleArgs, ModuleHandle,
    ModuleLoader, Result, SubscriptionSink,
};
use sound_core_types::{
    ResourceKind, SubscriptionEvent, SubscriptionFacility, SubscriptionKind, SuspendCause,
};

/// Static description of a loadable module kind.
#[derive(Debug)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub author: &'static str,
    pub usage: &'static str,
    pub valid_args: &'static [&'static str],
}

const AUTHOR: &str = "sound-daemon contributors";

pub const CATALOG: &[ModuleInfo] = &[
    ModuleInfo {
        name: "module-alsa-card",
        description: "ALSA card",
        author: AUTHOR,
        usage: "device_id=<ALSA card index> name=<name for the card/sink/source, to be prefixed> \
                card_name=<name for the card> card_properties=<properties for the card> \
                tsched=<enable system timer based scheduling mode?>",
        valid_args: &["device_id", "name", "card_name", "card_properties", "tsched"],
    },
    ModuleInfo {
        name: "module-alsa-sink",
        description: "ALSA sink",
        author: AUTHOR,
        usage: "sink_name=<name of the sink> device=<ALSA device> \
                tsched=<enable system timer based scheduling mode?>",
        valid_args: &["sink_name", "device", "tsched"],
    },
    ModuleInfo {
        name: "module-alsa-source",
        description: "ALSA source",
        author: AUTHOR,
        usage: "source_name=<name of the source> device=<ALSA device> \
                tsched=<enable system timer based scheduling mode?>",
        valid_args: &["source_name", "device", "tsched"],
    },
    ModuleInfo {
        name: "module-null-sink",
        description: "Clocked NULL sink",
        author: AUTHOR,
        usage: "sink_name=<name of sink> description=<description for the sink>",
        valid_args: &["sink_name", "description"],
    },
    ModuleInfo {
        name: "module-remap-sink",
        description: "Virtual channel remapping sink",
        author: AUTHOR,
        usage: "sink_name=<name for the sink> master=<name of sink to remap>",
        valid_args: &["sink_name", "master"],
    },
];

pub fn find_module(name: &str) -> Option<&'static ModuleInfo> {
    CATALOG.iter().find(|info| info.name == name)
}

fn write_long(out: &mut String, info: &ModuleInfo) -> std::fmt::Result {
    writeln!(out, "Name: {}", info.name)?;
    writeln!(out, "Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "Description: {}", info.description)?;
    writeln!(out, "Author: {}", info.author)?;
    writeln!(out, "Usage: {}", info.usage)
}

/// Render the catalog for `dump-modules`.
///
/// Short form lists every module on one line; the long form is used with
/// `verbose` or when specific modules are named.
pub fn format_module_list(names: &[String], verbose: bool) -> anyhow::Result<String> {
    let mut out = String::new();
    let selected: Vec<&ModuleInfo> = if names.is_empty() {
        CATALOG.iter().collect()
    } else {
        names
            .iter()
            .map(|name| find_module(name).ok_or_else(|| anyhow::anyhow!("unknown module {name:?}")))
            .collect::<anyhow::Result<_>>()?
    };

    if names.is_empty() && !verbose {
        for info in selected {
            writeln!(out, "{:<40}{}", info.name, info.description)?;
        }
        return Ok(out);
    }

    for (i, info) in selected.into_iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        write_long(&mut out, info)?;
    }
    Ok(out)
}

/// Class of object a module publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Card,
    Sink,
    Source,
}

impl ObjectKind {
    fn facility(self) -> SubscriptionFacility {
        match self {
            ObjectKind::Card => SubscriptionFacility::Card,
            ObjectKind::Sink => SubscriptionFacility::Sink,
            ObjectKind::Source => SubscriptionFacility::Source,
        }
    }
}

/// Snapshot of a loaded module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleSummary {
    pub handle: ModuleHandle,
    pub spec: &'static str,
    pub args: String,
    pub auto_unload: bool,
}

struct LoadedModule {
    spec: &'static str,
    args: String,
    auto_unload: bool,
    loaded_at: Instant,
    objects: Vec<(ObjectKind, Handle)>,
    /// Module owning an object this module is attached to.
    depends_on: Option<ModuleHandle>,
}

struct HostedObject {
    owner: ModuleHandle,
}

struct CardState {
    owner: ModuleHandle,
    suspend_causes: Vec<SuspendCause>,
}

/// `<prefix>.<sanitized raw>`, used when a module is not given an explicit name.
fn derived_name(prefix: &str, raw: &str) -> String {
    format!("{prefix}.{}", make_valid_name(raw).unwrap_or_default())
}

struct LoadPlan {
    objects: Vec<(ObjectKind, String)>,
    depends_on: Option<ModuleHandle>,
}

#[derive(Default)]
struct HostState {
    modules: DualIndexRegistry<LoadedModule>,
    cards: DualIndexRegistry<CardState>,
    sinks: DualIndexRegistry<HostedObject>,
    sources: DualIndexRegistry<HostedObject>,
    pending_unloads: Vec<ModuleHandle>,
    next_id: u64,
}

impl HostState {
    fn name_taken(&self, kind: ObjectKind, name: &str) -> bool {
        match kind {
            ObjectKind::Card => self.cards.contains_name(name),
            ObjectKind::Sink => self.sinks.contains_name(name),
            ObjectKind::Source => self.sources.contains_name(name),
        }
    }

    fn register(
        &mut self,
        info: &'static ModuleInfo,
        args: &str,
        plan: LoadPlan,
        events: &mut Vec<SubscriptionEvent>,
    ) -> std::result::Result<ModuleHandle, String> {
        if let Some((_, name)) = plan
            .objects
            .iter()
            .find(|(kind, name)| self.name_taken(*kind, name))
        {
            return Err(format!("name {name:?} already registered"));
        }

        self.next_id += 1;
        let module = self
            .modules
            .insert(
                format!("{}#{}", info.name, self.next_id),
                LoadedModule {
                    spec: info.name,
                    args: args.to_string(),
                    auto_unload: false,
                    loaded_at: Instant::now(),
                    objects: Vec::new(),
                    depends_on: plan.depends_on,
                },
            )
            .map_err(|e| e.to_string())?;
        events.push(SubscriptionEvent::new(
            SubscriptionFacility::Module,
            SubscriptionKind::New,
            module.index(),
        ));

        let mut objects = Vec::with_capacity(plan.objects.len());
        for (kind, name) in plan.objects {
            let inserted = match kind {
                ObjectKind::Card => self.cards.insert(
                    name,
                    CardState {
                        owner: module,
                        suspend_causes: Vec::new(),
                    },
                ),
                ObjectKind::Sink => self.sinks.insert(name, HostedObject { owner: module }),
                ObjectKind::Source => self.sources.insert(name, HostedObject { owner: module }),
            };
            match inserted {
                Ok(handle) => {
                    events.push(SubscriptionEvent::new(
                        kind.facility(),
                        SubscriptionKind::New,
                        handle.index(),
                    ));
                    objects.push((kind, handle));
                }
                Err(e) => tracing::warn!(module = %module, error = %e, "object not registered"),
            }
        }
        if let Some(loaded) = self.modules.get_mut_by_handle(module) {
            loaded.objects = objects;
        }
        Ok(module)
    }

    fn unregister(&mut self, module: ModuleHandle, events: &mut Vec<SubscriptionEvent>) -> bool {
        let Some((_, name, loaded)) = self.modules.remove_by_handle(module) else {
            return false;
        };
        for (kind, handle) in loaded.objects {
            let removed = match kind {
                ObjectKind::Card => self.cards.remove_by_handle(handle).is_some(),
                ObjectKind::Sink => self.sinks.remove_by_handle(handle).is_some(),
                ObjectKind::Source => self.sources.remove_by_handle(handle).is_some(),
            };
            if removed {
                events.push(SubscriptionEvent::new(
                    kind.facility(),
                    SubscriptionKind::Remove,
                    handle.index(),
                ));
            }
        }
        events.push(SubscriptionEvent::new(
            SubscriptionFacility::Module,
            SubscriptionKind::Remove,
            module.index(),
        ));
        tracing::info!(module = %module, name = %name, spec = loaded.spec, "module unloaded");
        true
    }

    fn dependents_of(&self, module: ModuleHandle) -> Vec<ModuleHandle> {
        self.modules
            .iter()
            .filter(|(_, _, loaded)| loaded.depends_on == Some(module))
            .map(|(handle, _, _)| handle)
            .collect()
    }

    fn queue_unload(&mut self, module: ModuleHandle) -> bool {
        if self.pending_unloads.contains(&module) {
            return false;
        }
        self.pending_unloads.push(module);
        true
    }
}

pub struct ModuleHost {
    state: Mutex<HostState>,
    autoload: Arc<AutoloadRegistry>,
    events: Arc<dyn SubscriptionSink>,
    disallow_loading: AtomicBool,
}

impl ModuleHost {
    pub fn new(autoload: Arc<AutoloadRegistry>, events: Arc<dyn SubscriptionSink>) -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            autoload,
            events,
            disallow_loading: AtomicBool::new(false),
        }
    }

    // Never held across a call that can re-enter the host.
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post_all(&self, events: Vec<SubscriptionEvent>) {
        for event in events {
            self.events.post(event);
        }
    }

    pub fn autoload(&self) -> &Arc<AutoloadRegistry> {
        &self.autoload
    }

    pub fn set_disallow_loading(&self, disallow: bool) {
        self.disallow_loading.store(disallow, Ordering::SeqCst);
    }

    /// Look up a sink or source without side effects.
    pub fn lookup(&self, name: &str, kind: ResourceKind) -> Option<Handle> {
        let state = self.state();
        match kind {
            ResourceKind::Sink => state.sinks.handle_of(name),
            ResourceKind::Source => state.sources.handle_of(name),
        }
    }

    /// Look up a sink or source, triggering its autoload entry on a miss.
    pub fn resolve(&self, name: &str, kind: ResourceKind) -> Option<Handle> {
        if let Some(handle) = self.lookup(name, kind) {
            return Some(handle);
        }
        self.autoload.request(name, kind, self)?;
        self.lookup(name, kind)
    }

    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.state()
            .modules
            .iter()
            .map(|(handle, _, loaded)| ModuleSummary {
                handle,
                spec: loaded.spec,
                args: loaded.args.clone(),
                auto_unload: loaded.auto_unload,
            })
            .collect()
    }

    pub fn object_names(&self, kind: ObjectKind) -> Vec<String> {
        let state = self.state();
        let names: Vec<&str> = match kind {
            ObjectKind::Card => state.cards.iter().map(|(_, name, _)| name).collect(),
            ObjectKind::Sink => state.sinks.iter().map(|(_, name, _)| name).collect(),
            ObjectKind::Source => state.sources.iter().map(|(_, name, _)| name).collect(),
        };
        names.into_iter().map(str::to_string).collect()
    }

    #[cfg(test)]
    pub fn is_card_suspended(&self, card_name: &str) -> Option<bool> {
        self.state()
            .cards
            .get_by_name(card_name)
            .map(|(_, card)| !card.suspend_causes.is_empty())
    }

    fn plan(&self, info: &ModuleInfo, args: &ModuleArgs) -> std::result::Result<LoadPlan, String> {
        args.get_bool("tsched").map_err(|e| e.to_string())?;
        let mut depends_on = None;
        let objects = match info.name {
            "module-alsa-card" => {
                let device_id = args.get("device_id").ok_or("device_id is required")?;
                let name = args.get("name").unwrap_or(device_id);
                let card = args
                    .get("card_name")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("alsa_card.{name}"));
                vec![
                    (ObjectKind::Card, card),
                    (ObjectKind::Sink, format!("alsa_output.{name}")),
                    (ObjectKind::Source, format!("alsa_input.{name}")),
                ]
            }
            "module-alsa-sink" => {
                let device = args.get("device").unwrap_or("default");
                let sink = args
                    .get("sink_name")
                    .map(str::to_string)
                    .unwrap_or_else(|| derived_name("alsa_output", device));
                vec![(ObjectKind::Sink, sink)]
            }
            "module-alsa-source" => {
                let device = args.get("device").unwrap_or("default");
                let source = args
                    .get("source_name")
                    .map(str::to_string)
                    .unwrap_or_else(|| derived_name("alsa_input", device));
                vec![(ObjectKind::Source, source)]
            }
            "module-null-sink" => {
                let sink = args.get("sink_name").unwrap_or("null");
                vec![
                    (ObjectKind::Sink, sink.to_string()),
                    (ObjectKind::Source, format!("{sink}.monitor")),
                ]
            }
            "module-remap-sink" => {
                let master = args.get("master").ok_or("master is required")?;
                let sink = self
                    .resolve(master, ResourceKind::Sink)
                    .ok_or_else(|| format!("master sink {master:?} not found"))?;
                depends_on = self.state().sinks.get_by_handle(sink).map(|o| o.owner);
                let name = args
                    .get("sink_name")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{master}.remapped"));
                vec![(ObjectKind::Sink, name)]
            }
            other => return Err(format!("no backend for {other}")),
        };
        if let Some((_, name)) = objects.iter().find(|(_, name)| !is_valid_name(name)) {
            return Err(format!("invalid object name {name:?}"));
        }
        Ok(LoadPlan {
            objects,
            depends_on,
        })
    }

    /// Apply queued unloads, including modules attached to the unloaded ones.
    ///
    /// Returns the modules actually removed, in removal order.
    pub fn process_pending_unloads(&self) -> Vec<ModuleHandle> {
        let mut events = Vec::new();
        let mut unloaded = Vec::new();
        {
            let mut state = self.state();
            let mut queue: VecDeque<ModuleHandle> =
                std::mem::take(&mut state.pending_unloads).into();
            while let Some(module) = queue.pop_front() {
                if !state.unregister(module, &mut events) {
                    continue;
                }
                queue.extend(state.dependents_of(module));
                unloaded.push(module);
            }
        }
        self.post_all(events);
        unloaded
    }

    /// Queue auto-unload modules loaded longer than `idle` ago.
    pub fn unload_idle(&self, idle: Duration) -> usize {
        let mut state = self.state();
        let now = Instant::now();
        let idle_modules: Vec<ModuleHandle> = state
            .modules
            .iter()
            .filter(|(_, _, loaded)| {
                loaded.auto_unload && now.duration_since(loaded.loaded_at) >= idle
            })
            .map(|(handle, _, _)| handle)
            .collect();

        let mut queued = 0;
        for module in idle_modules {
            if state.dependents_of(module).is_empty() && state.queue_unload(module) {
                tracing::info!(module = %module, "unloading idle module");
                queued += 1;
            }
        }
        queued
    }

    /// Unload every module immediately.
    pub fn unload_all(&self) -> Vec<ModuleHandle> {
        {
            let mut state = self.state();
            let all: Vec<ModuleHandle> = state.modules.iter().map(|(h, _, _)| h).collect();
            for module in all {
                state.queue_unload(module);
            }
        }
        self.process_pending_unloads()
    }
}

impl ModuleLoader for ModuleHost {
    fn load(&self, spec: &str, args: &str) -> Result<ModuleHandle> {
        let fail = |reason: String| Error::LoadFailed {
            spec: spec.to_string(),
            reason,
        };
        if self.disallow_loading.load(Ordering::SeqCst) {
            return Err(fail("module loading is disabled".to_string()));
        }
        let info = find_module(spec).ok_or_else(|| fail("unknown module".to_string()))?;
        let parsed =
            ModuleArgs::parse_with(args, info.valid_args).map_err(|e| fail(e.to_string()))?;
        let plan = self.plan(info, &parsed).map_err(fail)?;

        let mut events = Vec::new();
        let module = self
            .state()
            .register(info, args, plan, &mut events)
            .map_err(fail)?;
        self.post_all(events);
        tracing::info!(module = %module, spec, args, "module loaded");
        Ok(module)
    }

    fn set_auto_unload(&self, module: ModuleHandle) {
        if let Some(loaded) = self.state().modules.get_mut_by_handle(module) {
            loaded.auto_unload = true;
        }
    }

    fn request_unload(&self, module: ModuleHandle, force: bool) -> Result<()> {
        let mut state = self.state();
        if state.modules.get_by_handle(module).is_none() {
            return Err(Error::UnloadFailed {
                index: module.index(),
                reason: "no such module".to_string(),
            });
        }
        if !force && !state.dependents_of(module).is_empty() {
            return Err(Error::UnloadFailed {
                index: module.index(),
                reason: "in use by another module".to_string(),
            });
        }
        state.queue_unload(module);
        tracing::debug!(module = %module, force, "unload requested");
        Ok(())
    }
}

impl CardAccess for ModuleHost {
    fn set_suspended(&self, card_name: &str, suspended: bool, cause: SuspendCause) -> bool {
        let changed = {
            let mut state = self.state();
            let Some((handle, card)) = state.cards.get_mut_by_name(card_name) else {
                return false;
            };
            let had = card.suspend_causes.contains(&cause);
            if suspended && !had {
                card.suspend_causes.push(cause);
            } else if !suspended && had {
                card.suspend_causes.retain(|c| *c != cause);
            }
            tracing::info!(
                card = card_name,
                owner = %card.owner,
                suspended = !card.suspend_causes.is_empty(),
                cause = ?cause,
                "card suspend state"
            );
            (had != suspended).then_some(handle.index())
        };
        if let Some(index) = changed {
            self.events.post(SubscriptionEvent::new(
                SubscriptionFacility::Card,
                SubscriptionKind::Change,
                index,
            ));
        }
        true
    }
}
