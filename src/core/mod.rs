//! Core module - settings stores, instances, providers, list reconciliation, handles

pub mod events;
pub mod handle;
pub mod instance;
pub mod list;
pub mod provider;
pub mod settings;

pub use events::{HandleEvent, InstanceEvent, ListEvent, Notifier, ProviderEvent};
pub use handle::{HandleLoader, HandleState, InstanceHandle};
pub use instance::{Instance, InstanceFlags, InstanceKind, InstancePtr};
pub use list::InstanceList;
pub use provider::{FolderInstanceProvider, InstanceId, InstanceProvider, MARKER_FILE};
pub use settings::{register_global_defaults, SettingsError, SettingsPtr, SettingsStore};
