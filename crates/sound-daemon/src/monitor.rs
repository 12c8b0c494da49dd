//! Live card monitor.
//!
//! Watches the udev database directory. udev rewrites `+sound:card<N>` every
//! time it finishes processing the card, so a created or modified record is
//! reported as `change`; a deleted record is reported as `remove` for the
//! device path last seen for that card.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sound_core::hotplug::card_id_from_path;
use sound_core::{DeviceAction, DeviceEvent};

use crate::daemon::CoreCommand;
use crate::sysfs::{SysfsLayout, card_id_from_db_name, enumerate_cards};

pub struct CardTranslator {
    layout: SysfsLayout,
    /// Card number to device path.
    devpaths: Mutex<HashMap<String, String>>,
}

impl CardTranslator {
    pub fn new(layout: SysfsLayout) -> Self {
        Self {
            layout,
            devpaths: Mutex::new(HashMap::new()),
        }
    }

    fn devpaths(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.devpaths.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enumerate the cards present now and record their device paths.
    ///
    /// The path map stays locked for the whole scan, so a removal seen by the
    /// watcher meanwhile is translated only once the scanned card is known.
    pub fn enumerate(&self) -> Result<Vec<DeviceEvent>> {
        let mut devpaths = self.devpaths();
        let cards = enumerate_cards(&self.layout)?;
        for event in &cards {
            if let Some(card_id) = card_id_from_path(&event.path) {
                devpaths.insert(card_id.to_string(), event.path.clone());
            }
        }
        Ok(cards)
    }

    pub fn translate(&self, event: &Event) -> Vec<DeviceEvent> {
        let removal = match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => true,
            EventKind::Create(_) | EventKind::Modify(_) => false,
            _ => return Vec::new(),
        };
        event
            .paths
            .iter()
            .filter_map(|path| {
                let card_id = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(card_id_from_db_name)?;
                if removal {
                    self.removed(card_id)
                } else {
                    self.changed(card_id)
                }
            })
            .collect()
    }

    fn changed(&self, card_id: &str) -> Option<DeviceEvent> {
        let Some(event) = self
            .layout
            .device_event(Some(DeviceAction::Change), card_id)
        else {
            tracing::debug!(card = card_id, "monitor: record without sysfs entry");
            return None;
        };
        self.devpaths()
            .insert(card_id.to_string(), event.path.clone());
        Some(event)
    }

    fn removed(&self, card_id: &str) -> Option<DeviceEvent> {
        let Some(path) = self.devpaths().remove(card_id) else {
            tracing::debug!(card = card_id, "monitor: removal for unknown card");
            return None;
        };
        Some(DeviceEvent::new(Some(DeviceAction::Remove), path))
    }
}

/// Start watching; device events are sent to the event loop.
///
/// The returned watcher stops when dropped.
pub fn spawn_monitor(
    translator: Arc<CardTranslator>,
    tx: Sender<CoreCommand>,
) -> Result<RecommendedWatcher> {
    let dir = translator.layout.udev_db_dir.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for device in translator.translate(&event) {
                if tx.send(CoreCommand::Device(device)).is_err() {
                    break;
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "monitor: watch error"),
    })
    .context("create udev watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;
    tracing::info!(dir = %dir.display(), "monitor: watching udev database");
    Ok(watcher)
}
