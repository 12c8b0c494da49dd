//! Collaborator interfaces consumed by the core.
//!
//! All methods take `&self`: implementations that keep state guard it
//! internally and must not hold their own locks while calling back into the
//! core.

use std::path::Path;

use sound_core_types::{SubscriptionEvent, SuspendCause};

use crate::error::Result;
use crate::registry::Handle;

/// Opaque handle of a loaded module, issued by the [`ModuleLoader`].
pub type ModuleHandle = Handle;

/// Instantiates and tears down backend modules.
pub trait ModuleLoader {
    /// Load `spec` with the given argument string.
    fn load(&self, spec: &str, args: &str) -> Result<ModuleHandle>;
    /// Flag a loaded module as eligible for idle unload.
    fn set_auto_unload(&self, module: ModuleHandle);
    /// Ask for a module to be unloaded. `force` skips "in use" checks.
    fn request_unload(&self, module: ModuleHandle, force: bool) -> Result<()>;
}

/// Receives subscription notifications. Fire-and-forget.
pub trait SubscriptionSink: Send + Sync {
    fn post(&self, event: SubscriptionEvent);
}

/// Card objects whose accessibility can be toggled.
pub trait CardAccess {
    /// Returns `false` when no card with that name exists.
    fn set_suspended(&self, card_name: &str, suspended: bool, cause: SuspendCause) -> bool;
}

/// Checks whether the current process may write a device node.
pub trait AccessProbe {
    fn is_writable(&self, path: &Path) -> bool;
}
