//! Error taxonomy shared by the registries and the reconciler.
//!
//! None of these are fatal. Direct callers receive them from `add`/`remove`;
//! hotplug processing logs them and moves on.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An autoload entry with this name already exists.
    #[error("autoload entry {name:?} already exists")]
    Conflict { name: String },
    /// Lookup or removal missed.
    #[error("not found")]
    NotFound,
    /// A registry slot with this name is already taken.
    #[error("name {0:?} already registered")]
    AlreadyExists(String),
    /// The module loader refused or failed to instantiate a module.
    #[error("failed to load {spec}: {reason}")]
    LoadFailed { spec: String, reason: String },
    /// The module loader could not unload a module.
    #[error("failed to unload module #{index}: {reason}")]
    UnloadFailed { index: u32, reason: String },
    /// A device event lacks the identity needed to track it.
    #[error("malformed device event for {path}: {reason}")]
    MalformedEvent { path: String, reason: String },
    /// Module argument string could not be parsed or has unknown keys.
    #[error("invalid module arguments: {0}")]
    InvalidArguments(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
