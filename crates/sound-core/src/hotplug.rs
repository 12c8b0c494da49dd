//! Hotplug reconciliation for sound cards.
//!
//! Turns device presence events into card module loads and unloads, keeping
//! exactly one module per present card. Initial insertion waits for the
//! `SOUND_INITIALIZED` property: the raw device node shows up before the
//! kernel has finished setting the card up, so plain `add` events are skipped.

use std::collections::HashMap;
use std::path::PathBuf;

use sound_core_types::SuspendCause;

use crate::collab::{AccessProbe, CardAccess, ModuleHandle, ModuleLoader};
use crate::devices::{DeviceRecord, DeviceRecordStore};
use crate::error::Error;
use crate::modargs::ModuleArgs;
use crate::names::make_valid_name;

/// Module spec loaded for every detected card.
pub const CARD_MODULE: &str = "module-alsa-card";

pub const PROP_IGNORE: &str = "PULSE_IGNORE";
pub const PROP_NAME: &str = "PULSE_NAME";
pub const PROP_FORM_FACTOR: &str = "SOUND_FORM_FACTOR";
pub const PROP_INITIALIZED: &str = "SOUND_INITIALIZED";
pub const PROP_ID: &str = "ID_ID";
pub const PROP_PATH: &str = "ID_PATH";

/// Device event action as reported by the device manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Change,
    Remove,
    Other(String),
}

impl DeviceAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "add" => DeviceAction::Add,
            "change" => DeviceAction::Change,
            "remove" => DeviceAction::Remove,
            other => DeviceAction::Other(other.to_string()),
        }
    }
}

/// A device descriptor from enumeration (no action) or from the monitor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: Option<DeviceAction>,
    /// Kernel device path below `/sys`.
    pub path: String,
    pub properties: HashMap<String, String>,
}

impl DeviceEvent {
    pub fn new(action: Option<DeviceAction>, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct HotplugConfig {
    /// Ask card modules for timer-based scheduling.
    pub use_tsched: bool,
    /// Directory holding `controlC<N>` nodes.
    pub dev_dir: PathBuf,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            use_tsched: true,
            dev_dir: PathBuf::from("/dev/snd"),
        }
    }
}

/// Result of feeding one event through the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Loaded(ModuleHandle),
    LoadFailed,
    AccessChecked { accessible: bool },
    Removed(ModuleHandle),
    NotTracked,
}

/// Card number from a `.../card<N>` device path.
pub fn card_id_from_path(path: &str) -> Option<&str> {
    let (_, last) = path.rsplit_once('/')?;
    let id = last.strip_prefix("card")?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then_some(id)
}

/// Derive the canonical card name from device properties.
///
/// Tries `PULSE_NAME`, `ID_ID`, `ID_PATH`, then the card number.
pub fn canonical_name(event: &DeviceEvent) -> Option<String> {
    let candidate = [PROP_NAME, PROP_ID, PROP_PATH]
        .iter()
        .filter_map(|key| event.property(key))
        .find(|value| !value.is_empty())
        .or_else(|| card_id_from_path(&event.path))?;
    make_valid_name(candidate)
}

pub struct HotplugReconciler {
    config: HotplugConfig,
    devices: DeviceRecordStore,
    access: Box<dyn AccessProbe + Send>,
}

impl HotplugReconciler {
    pub fn new(config: HotplugConfig, access: Box<dyn AccessProbe + Send>) -> Self {
        Self {
            config,
            devices: DeviceRecordStore::new(),
            access,
        }
    }

    pub fn devices(&self) -> &DeviceRecordStore {
        &self.devices
    }

    /// Process the startup enumeration. Returns the number of tracked cards.
    pub fn start(
        &mut self,
        initial: impl IntoIterator<Item = DeviceEvent>,
        loader: &dyn ModuleLoader,
        cards: &dyn CardAccess,
    ) -> usize {
        for event in initial {
            self.process_device(&event, loader, cards);
        }
        tracing::info!(count = self.devices.len(), "hotplug: initial enumeration done");
        self.devices.len()
    }

    /// Apply one device event.
    pub fn process_device(
        &mut self,
        event: &DeviceEvent,
        loader: &dyn ModuleLoader,
        cards: &dyn CardAccess,
    ) -> Outcome {
        if card_id_from_path(&event.path).is_none() {
            let err = Error::MalformedEvent {
                path: event.path.clone(),
                reason: "not a card<N> path".to_string(),
            };
            tracing::debug!(error = %err, "hotplug: dropping event");
            return Outcome::Ignored;
        }
        if event.property(PROP_IGNORE).is_some() {
            tracing::info!(path = %event.path, "hotplug: ignoring device marked {PROP_IGNORE}");
            return Outcome::Ignored;
        }
        if event.property(PROP_FORM_FACTOR) == Some("modem") {
            tracing::info!(path = %event.path, "hotplug: ignoring modem");
            return Outcome::Ignored;
        }

        match event.action.as_ref() {
            Some(DeviceAction::Remove) => self.remove_card(&event.path, loader),
            None | Some(DeviceAction::Change) if event.property(PROP_INITIALIZED).is_some() => {
                self.card_changed(event, loader, cards)
            }
            _ => Outcome::Ignored,
        }
    }

    fn card_changed(
        &mut self,
        event: &DeviceEvent,
        loader: &dyn ModuleLoader,
        cards: &dyn CardAccess,
    ) -> Outcome {
        if let Some(record) = self.devices.get(&event.path) {
            let accessible = self.verify_access(record, cards);
            return Outcome::AccessChecked { accessible };
        }

        let (Some(card_id), Some(name)) = (card_id_from_path(&event.path), canonical_name(event))
        else {
            let err = Error::MalformedEvent {
                path: event.path.clone(),
                reason: "no usable card name".to_string(),
            };
            tracing::debug!(error = %err, "hotplug: dropping event");
            return Outcome::Ignored;
        };
        let card_name = format!("alsa_card.{name}");
        let args = ModuleArgs::new()
            .with("device_id", card_id)
            .with("name", &name)
            .with("card_name", &card_name)
            .with("tsched", u8::from(self.config.use_tsched))
            .with("card_properties", "module-udev-detect.discovered=1")
            .to_string();

        tracing::debug!(args = %args, "hotplug: loading {CARD_MODULE}");
        let module = match loader.load(CARD_MODULE, &args) {
            Ok(module) => module,
            Err(e) => {
                tracing::warn!(path = %event.path, name = %name, error = %e, "hotplug: card load failed");
                return Outcome::LoadFailed;
            }
        };

        let record = DeviceRecord {
            path: event.path.clone(),
            canonical_name: name,
            card_name,
            card_id: card_id.to_string(),
            module,
        };
        tracing::info!(
            path = %record.path,
            name = %record.canonical_name,
            module = %module,
            "hotplug: card added"
        );
        if let Err(e) = self.devices.insert(record) {
            tracing::warn!(error = %e, "hotplug: card already tracked; unloading duplicate");
            if let Err(e) = loader.request_unload(module, true) {
                tracing::warn!(module = %module, error = %e, "hotplug: unload failed");
            }
            return Outcome::LoadFailed;
        }
        Outcome::Loaded(module)
    }

    fn verify_access(&self, record: &DeviceRecord, cards: &dyn CardAccess) -> bool {
        let control = self
            .config
            .dev_dir
            .join(format!("controlC{}", record.card_id));
        let accessible = self.access.is_writable(&control);
        tracing::info!(
            control = %control.display(),
            accessible,
            "hotplug: verified card access"
        );
        if !cards.set_suspended(&record.card_name, !accessible, SuspendCause::Session) {
            tracing::debug!(card = %record.card_name, "hotplug: card object not registered");
        }
        accessible
    }

    fn remove_card(&mut self, path: &str, loader: &dyn ModuleLoader) -> Outcome {
        let Some(record) = self.devices.remove(path) else {
            return Outcome::NotTracked;
        };
        tracing::info!(path = %record.path, module = %record.module, "hotplug: card removed");
        if let Err(e) = loader.request_unload(record.module, true) {
            tracing::warn!(module = %record.module, error = %e, "hotplug: unload failed");
        }
        Outcome::Removed(record.module)
    }

    /// Forget the record whose module went away by other means.
    pub fn on_module_unloaded(&mut self, module: ModuleHandle) -> Option<DeviceRecord> {
        let path = self.devices.find_by_module(module)?.path.clone();
        tracing::debug!(path = %path, module = %module, "hotplug: card module unloaded");
        self.devices.remove(&path)
    }

    /// Unload every tracked card and empty the store.
    pub fn shutdown(&mut self, loader: &dyn ModuleLoader) {
        for record in self.devices.drain_all() {
            if let Err(e) = loader.request_unload(record.module, true) {
                tracing::warn!(path = %record.path, error = %e, "hotplug: unload failed during shutdown");
            }
        }
    }
}
