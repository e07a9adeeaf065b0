//! Instancer - folder-backed instance collections kept in sync with disk
//!
//! Manages a dynamic collection of persisted, folder-backed instances:
//! providers discover and load them from a storage root, the instance
//! list reconciles discovery results against the held collection and
//! emits batched structural change events, and handles wrap a single
//! instance's load/unload/destroy lifecycle. Settings resolve through an
//! override chain into a shared global store.

use std::path::PathBuf;

pub mod core;

pub use crate::core::{
    register_global_defaults, FolderInstanceProvider, HandleEvent, HandleLoader, HandleState,
    Instance, InstanceEvent, InstanceFlags, InstanceHandle, InstanceId, InstanceKind,
    InstanceList, InstanceProvider, InstancePtr, ListEvent, Notifier, ProviderEvent,
    SettingsError, SettingsPtr, SettingsStore, MARKER_FILE,
};

/// Library name constant.
pub const APP_NAME: &str = "Instancer";

/// Default storage root for instances, under the platform data directory.
pub fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("instances")
}
