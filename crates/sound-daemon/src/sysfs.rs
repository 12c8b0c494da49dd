//! Sound card discovery from sysfs and the udev database.
//!
//! Cards are the `card<N>` entries of `<sysfs>/class/sound`. Their udev
//! properties live in `<udev_db>/+sound:card<N>` as `E:KEY=VALUE` lines.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{AccessFlags, access};
use sound_core::{AccessProbe, DeviceAction, DeviceEvent};

use crate::config::HotplugSettings;

#[derive(Clone, Debug)]
pub struct SysfsLayout {
    pub sysfs_dir: PathBuf,
    pub udev_db_dir: PathBuf,
}

impl From<&HotplugSettings> for SysfsLayout {
    fn from(settings: &HotplugSettings) -> Self {
        Self {
            sysfs_dir: settings.sysfs_dir.clone(),
            udev_db_dir: settings.udev_db_dir.clone(),
        }
    }
}

fn numeric(id: &str) -> Option<&str> {
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then_some(id)
}

/// Card number from a `+sound:card<N>` database file name.
pub fn card_id_from_db_name(file_name: &str) -> Option<&str> {
    file_name.strip_prefix("+sound:card").and_then(numeric)
}

/// Extract `E:` property lines from a udev database record.
pub fn parse_udev_db(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|prop| prop.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

impl SysfsLayout {
    pub fn class_dir(&self) -> PathBuf {
        self.sysfs_dir.join("class").join("sound")
    }

    pub fn udev_db_file(&self, card_id: &str) -> PathBuf {
        self.udev_db_dir.join(format!("+sound:card{card_id}"))
    }

    /// Kernel device path (below the sysfs root) a class entry points at.
    pub fn devpath_of(&self, entry: &Path) -> Option<String> {
        let target = std::fs::canonicalize(entry).ok()?;
        let root = std::fs::canonicalize(&self.sysfs_dir).ok()?;
        let rel = target.strip_prefix(&root).ok()?;
        Some(format!("/{}", rel.display()))
    }

    pub fn read_properties(&self, card_id: &str) -> HashMap<String, String> {
        let file = self.udev_db_file(card_id);
        match std::fs::read_to_string(&file) {
            Ok(raw) => parse_udev_db(&raw),
            Err(e) => {
                tracing::debug!(file = %file.display(), error = %e, "no udev record");
                HashMap::new()
            }
        }
    }

    /// Build the event for card `card_id` from its current sysfs and udev state.
    pub fn device_event(&self, action: Option<DeviceAction>, card_id: &str) -> Option<DeviceEvent> {
        let entry = self.class_dir().join(format!("card{card_id}"));
        let path = self.devpath_of(&entry)?;
        Some(DeviceEvent {
            action,
            path,
            properties: self.read_properties(card_id),
        })
    }
}

/// List the cards present right now, ordered by card number.
pub fn enumerate_cards(layout: &SysfsLayout) -> Result<Vec<DeviceEvent>> {
    let dir = layout.class_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(dir = %dir.display(), "no sound class directory");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };

    let mut cards = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(card_id) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix("card"))
            .and_then(numeric)
        else {
            continue;
        };
        if let Some(event) = layout.device_event(None, card_id) {
            let order: u32 = card_id.parse().unwrap_or(u32::MAX);
            cards.push((order, event));
        }
    }
    cards.sort_by_key(|(order, _)| *order);
    tracing::debug!(count = cards.len(), "enumerated sound cards");
    Ok(cards.into_iter().map(|(_, event)| event).collect())
}

/// Write-access check with the process's real credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteAccessProbe;

impl AccessProbe for WriteAccessProbe {
    fn is_writable(&self, path: &Path) -> bool {
        access(path, AccessFlags::W_OK).is_ok()
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;

    pub fn layout(root: &Path) -> SysfsLayout {
        let layout = SysfsLayout {
            sysfs_dir: root.join("sys"),
            udev_db_dir: root.join("udev"),
        };
        std::fs::create_dir_all(layout.class_dir()).expect("class dir");
        std::fs::create_dir_all(&layout.udev_db_dir).expect("udev dir");
        layout
    }

    /// Create `/sys<devpath>`, its class link, and optionally a udev record.
    pub fn add_card(layout: &SysfsLayout, card_id: u32, devpath: &str, udev: Option<&str>) {
        let device = layout.sysfs_dir.join(devpath.trim_start_matches('/'));
        std::fs::create_dir_all(&device).expect("device dir");
        std::os::unix::fs::symlink(&device, layout.class_dir().join(format!("card{card_id}")))
            .expect("class link");
        if let Some(record) = udev {
            std::fs::write(layout.udev_db_file(&card_id.to_string()), record).expect("udev record");
        }
    }
}
