//! Currently tracked hardware devices, keyed by physical path.

use std::collections::HashMap;

use crate::collab::ModuleHandle;
use crate::error::{Error, Result};

/// A physical device and the module servicing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Kernel device path, e.g. `/devices/pci0000:00/0000:00:1f.3/sound/card0`.
    pub path: String,
    /// Sanitized name derived once at first sight.
    pub canonical_name: String,
    /// Card object published by the module (`alsa_card.<canonical_name>`).
    pub card_name: String,
    /// Card number parsed from the trailing `card<N>` segment.
    pub card_id: String,
    pub module: ModuleHandle,
}

#[derive(Debug, Default)]
pub struct DeviceRecordStore {
    records: HashMap<String, DeviceRecord>,
}

impl DeviceRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&DeviceRecord> {
        self.records.get(path)
    }

    /// Insert a record; a path can only be tracked once.
    pub fn insert(&mut self, record: DeviceRecord) -> Result<()> {
        if self.records.contains_key(&record.path) {
            return Err(Error::AlreadyExists(record.path));
        }
        self.records.insert(record.path.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Option<DeviceRecord> {
        self.records.remove(path)
    }

    /// Find the record serviced by `module`.
    pub fn find_by_module(&self, module: ModuleHandle) -> Option<&DeviceRecord> {
        self.records.values().find(|record| record.module == module)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take every record out, leaving the store empty.
    pub fn drain_all(&mut self) -> impl Iterator<Item = DeviceRecord> + '_ {
        self.records.drain().map(|(_, record)| record)
    }
}
