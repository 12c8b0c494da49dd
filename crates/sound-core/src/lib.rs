//! Module lifecycle core: autoload rules and hotplug reconciliation.
//!
//! Everything here runs on the caller's thread. Collaborators (module loader,
//! notification sink, card registry, access probe) are reached through the
//! traits in [`collab`].

pub mod autoload;
pub mod collab;
pub mod devices;
pub mod error;
pub mod hotplug;
pub mod modargs;
pub mod names;
pub mod registry;

pub use autoload::{AutoloadEntry, AutoloadRegistry};
pub use collab::{AccessProbe, CardAccess, ModuleHandle, ModuleLoader, SubscriptionSink};
pub use devices::{DeviceRecord, DeviceRecordStore};
pub use error::{Error, Result};
pub use hotplug::{DeviceAction, DeviceEvent, HotplugConfig, HotplugReconciler, Outcome};
pub use modargs::ModuleArgs;
pub use registry::{DualIndexRegistry, Handle};
pub use sound_core_types::{
    ResourceKind, SubscriptionEvent, SubscriptionFacility, SubscriptionKind, SuspendCause,
};
