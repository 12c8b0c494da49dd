//! Name + handle indexed storage.
//!
//! Entries live in a slot arena; the slot index is the numeric handle and a
//! per-slot generation makes handles to removed entries miss even after the
//! slot has been reused. A parallel insertion-ordered name index points at
//! the same slots.

use std::fmt;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Stable handle for a registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Numeric slot index, as exposed in notifications.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

struct Occupant<T> {
    name: String,
    value: T,
}

struct Slot<T> {
    generation: u32,
    occupant: Option<Occupant<T>>,
}

/// Registry addressable by unique name and by [`Handle`].
pub struct DualIndexRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_name: IndexMap<String, Handle>,
}

impl<T> Default for DualIndexRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DualIndexRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_name: IndexMap::new(),
        }
    }

    /// Insert a new entry under `name`.
    ///
    /// Fails with [`Error::AlreadyExists`] when the name is taken; the
    /// registry is left untouched in that case.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Result<Handle> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    occupant: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        slot.occupant = Some(Occupant {
            name: name.clone(),
            value,
        });
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn handle_of(&self, name: &str) -> Option<Handle> {
        self.by_name.get(name).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<(Handle, &T)> {
        let handle = self.handle_of(name)?;
        self.get_by_handle(handle).map(|value| (handle, value))
    }

    pub fn get_mut_by_name(&mut self, name: &str) -> Option<(Handle, &mut T)> {
        let handle = self.handle_of(name)?;
        self.get_mut_by_handle(handle).map(|value| (handle, value))
    }

    pub fn get_by_handle(&self, handle: Handle) -> Option<&T> {
        self.occupant(handle).map(|o| &o.value)
    }

    pub fn get_mut_by_handle(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_mut().map(|o| &mut o.value)
    }

    /// Name registered for a live handle.
    pub fn name_of(&self, handle: Handle) -> Option<&str> {
        self.occupant(handle).map(|o| o.name.as_str())
    }

    /// Look up the live handle currently occupying `index`.
    pub fn handle_at(&self, index: u32) -> Option<Handle> {
        let slot = self.slots.get(index as usize)?;
        slot.occupant.as_ref().map(|_| Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Remove by name; returns the removed entry so the caller can finalize it.
    pub fn remove_by_name(&mut self, name: &str) -> Option<(Handle, String, T)> {
        let handle = self.handle_of(name)?;
        self.remove_by_handle(handle)
    }

    /// Remove by handle; stale handles miss.
    pub fn remove_by_handle(&mut self, handle: Handle) -> Option<(Handle, String, T)> {
        let occupant = self.vacate(handle)?;
        self.by_name.shift_remove(&occupant.name);
        Some((handle, occupant.name, occupant.value))
    }

    /// Iterate live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &str, &T)> + '_ {
        self.by_name.iter().filter_map(move |(name, handle)| {
            self.get_by_handle(*handle)
                .map(|value| (*handle, name.as_str(), value))
        })
    }

    /// Remove every entry, handing each to `finalize` in insertion order.
    pub fn clear(&mut self, mut finalize: impl FnMut(Handle, String, T)) {
        let names = std::mem::take(&mut self.by_name);
        for (_, handle) in names {
            if let Some(occupant) = self.vacate(handle) {
                finalize(handle, occupant.name, occupant.value);
            }
        }
    }

    fn occupant(&self, handle: Handle) -> Option<&Occupant<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    fn vacate(&mut self, handle: Handle) -> Option<Occupant<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let occupant = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(occupant)
    }
}
