//! Instance entity - a persisted, folder-backed configuration bundle

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::events::{InstanceEvent, Notifier};
use super::provider::InstanceProvider;
use super::settings::SettingsPtr;

/// Shared handle to an instance. Identity comparisons use `Arc::ptr_eq`.
pub type InstancePtr = Arc<Instance>;

/// Concrete instance variant, decided by the `InstanceType` marker value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Current full-featured format.
    Modern,
    /// Pre-overhaul format, kept loadable.
    Legacy,
    /// Placeholder for unrecognized or unreadable markers; still satisfies
    /// the instance contract but can never launch.
    Broken,
}

impl InstanceKind {
    /// Map a marker `InstanceType` value to a kind.
    pub fn from_type_str(value: &str) -> Self {
        match value {
            "OneSix" | "Nostalgia" => Self::Modern,
            "Legacy" => Self::Legacy,
            _ => Self::Broken,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Modern => "Modern",
            Self::Legacy => "Legacy",
            Self::Broken => "Broken",
        }
    }
}

bitflags! {
    /// Status conditions attached to an instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstanceFlags: u32 {
        /// The selected version is known to be unusable.
        const VERSION_BROKEN = 1 << 0;
        /// The instance itself failed to load properly.
        const INSTANCE_BROKEN = 1 << 1;
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    time_started: Option<DateTime<Utc>>,
}

/// A single folder-backed instance.
///
/// All persisted state lives in the settings store; the group name, the
/// status flags and the running state are held here. Constructed by a
/// provider during `load_instance` and shared by reference counting
/// between the list, handles and in-flight operations.
pub struct Instance {
    self_weak: Weak<Instance>,
    root: PathBuf,
    kind: InstanceKind,
    settings: SettingsPtr,
    group: Mutex<String>,
    flags: Mutex<InstanceFlags>,
    run: Mutex<RunState>,
    provider: OnceLock<Weak<dyn InstanceProvider>>,
    events: Notifier<InstanceEvent>,
}

impl Instance {
    /// Build an instance over `settings`, registering its persisted
    /// settings and the override links into the shared global store.
    pub fn new(
        settings: SettingsPtr,
        global: &SettingsPtr,
        root: impl Into<PathBuf>,
        kind: InstanceKind,
    ) -> InstancePtr {
        settings.register_setting("name", "Unnamed Instance");
        settings.register_setting("iconKey", "default");
        settings.register_setting("notes", "");
        settings.register_setting("lastLaunchTime", 0);
        settings.register_setting("totalTimePlayed", 0);

        // Custom commands share one enable flag.
        settings.register_setting("OverrideCommands", false);
        settings.register_override(global, "PreLaunchCommand", "OverrideCommands");
        settings.register_override(global, "WrapperCommand", "OverrideCommands");
        settings.register_override(global, "PostExitCommand", "OverrideCommands");

        // Console behavior.
        settings.register_setting("OverrideConsole", false);
        settings.register_override(global, "ShowConsole", "OverrideConsole");
        settings.register_override(global, "AutoCloseConsole", "OverrideConsole");
        settings.register_override(global, "LogPrePostOutput", "OverrideConsole");

        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            root: root.into(),
            kind,
            settings,
            group: Mutex::new(String::new()),
            flags: Mutex::new(InstanceFlags::empty()),
            run: Mutex::new(RunState::default()),
            provider: OnceLock::new(),
            events: Notifier::new(),
        })
    }

    /// The identifier: the final path segment of the storage location.
    pub fn id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn settings(&self) -> &SettingsPtr {
        &self.settings
    }

    pub fn events(&self) -> &Notifier<InstanceEvent> {
        &self.events
    }

    pub fn name(&self) -> String {
        self.settings.get_string("name")
    }

    pub fn set_name(&self, name: &str) {
        self.settings.set("name", name);
        self.emit(InstanceEvent::PropertiesChanged);
    }

    pub fn notes(&self) -> String {
        self.settings.get_string("notes")
    }

    pub fn set_notes(&self, notes: &str) {
        self.settings.set("notes", notes);
    }

    pub fn icon_key(&self) -> String {
        self.settings.get_string("iconKey")
    }

    pub fn set_icon_key(&self, key: &str) {
        self.settings.set("iconKey", key);
        self.emit(InstanceEvent::PropertiesChanged);
    }

    /// Called by an icon cache when the image behind `key` was replaced.
    pub fn icon_updated(&self, key: &str) {
        if self.icon_key() == key {
            self.emit(InstanceEvent::PropertiesChanged);
        }
    }

    /// Last launch time, milliseconds since the epoch.
    pub fn last_launch(&self) -> i64 {
        self.settings.get_i64("lastLaunchTime")
    }

    pub fn set_last_launch(&self, epoch_ms: i64) {
        self.settings.set("lastLaunchTime", epoch_ms);
        self.emit(InstanceEvent::PropertiesChanged);
    }

    pub fn instance_type(&self) -> String {
        self.settings.get_string("InstanceType")
    }

    pub fn pre_launch_command(&self) -> String {
        self.settings.get_string("PreLaunchCommand")
    }

    pub fn wrapper_command(&self) -> String {
        self.settings.get_string("WrapperCommand")
    }

    pub fn post_exit_command(&self) -> String {
        self.settings.get_string("PostExitCommand")
    }

    pub fn group(&self) -> String {
        self.group
            .lock()
            .map(|group| group.clone())
            .unwrap_or_default()
    }

    /// Assign the group without involving the provider; used while the
    /// owning provider seeds the instance from its group map.
    pub fn set_group_initial(&self, group: &str) {
        if !self.store_group(group) {
            return;
        }
        self.emit(InstanceEvent::PropertiesChanged);
    }

    /// Rename the group. The owning provider observes this and persists
    /// the whole group file.
    pub fn set_group(&self, group: &str) {
        let old = self.group();
        if !self.store_group(group) {
            return;
        }
        self.emit(InstanceEvent::PropertiesChanged);
        self.emit(|instance| InstanceEvent::GroupChanged {
            instance,
            old,
            new: group.to_owned(),
        });
    }

    fn store_group(&self, group: &str) -> bool {
        match self.group.lock() {
            Ok(mut current) => {
                if *current == group {
                    return false;
                }
                *current = group.to_owned();
                true
            }
            Err(e) => {
                warn!("Group lock poisoned: {}", e);
                false
            }
        }
    }

    pub fn flags(&self) -> InstanceFlags {
        self.flags
            .lock()
            .map(|flags| *flags)
            .unwrap_or(InstanceFlags::empty())
    }

    pub fn set_flags(&self, flags: InstanceFlags) {
        let changed = self
            .flags
            .lock()
            .map(|mut current| {
                if *current == flags {
                    return false;
                }
                *current = flags;
                true
            })
            .unwrap_or(false);
        if changed {
            self.emit(InstanceEvent::FlagsChanged);
            self.emit(InstanceEvent::PropertiesChanged);
        }
    }

    pub fn set_flag(&self, flag: InstanceFlags) {
        self.set_flags(self.flags() | flag);
    }

    pub fn unset_flag(&self, flag: InstanceFlags) {
        self.set_flags(self.flags() - flag);
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().map(|run| run.running).unwrap_or(false)
    }

    /// Toggle the transient running state. Switching off folds the
    /// elapsed whole seconds into the persisted total play time.
    pub fn set_running(&self, running: bool) {
        let changed = match self.run.lock() {
            Ok(mut run) => {
                if run.running == running {
                    false
                } else {
                    if running {
                        run.time_started = Some(Utc::now());
                    } else {
                        let elapsed = run
                            .time_started
                            .take()
                            .map(|started| (Utc::now() - started).num_seconds())
                            .unwrap_or(0);
                        let total = self.settings.get_i64("totalTimePlayed");
                        self.settings.set("totalTimePlayed", total + elapsed);
                    }
                    run.running = running;
                    true
                }
            }
            Err(e) => {
                warn!("Run state lock poisoned: {}", e);
                false
            }
        };
        if changed {
            if !running {
                self.emit(InstanceEvent::PropertiesChanged);
            }
            self.emit(|instance| InstanceEvent::RunningChanged(instance, running));
        }
    }

    /// Total play time in seconds, including the live span while running.
    pub fn total_time_played(&self) -> i64 {
        let stored = self.settings.get_i64("totalTimePlayed");
        let live = self
            .run
            .lock()
            .ok()
            .and_then(|run| run.time_started.map(|started| (Utc::now() - started).num_seconds()))
            .unwrap_or(0);
        stored + live
    }

    pub fn reset_time_played(&self) {
        self.settings.reset("totalTimePlayed");
    }

    pub fn can_launch(&self) -> bool {
        self.kind != InstanceKind::Broken
            && !self.flags().contains(InstanceFlags::VERSION_BROKEN)
            && !self.is_running()
    }

    /// Re-read the settings file from disk.
    pub fn reload_settings(&self) -> bool {
        self.settings.reload()
    }

    /// Best-effort hook called when the instance drops out of a list.
    pub fn invalidate(&self) {
        debug!("Instance {} has been invalidated", self.id());
    }

    /// Delete the backing storage and notify observers.
    ///
    /// Deletion failures are logged; the notification fires either way.
    pub fn nuke(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            error!("Failed to delete instance storage {:?}: {}", self.root, e);
        }
        self.emit(InstanceEvent::Nuked);
    }

    /// Associate the provider that created this instance. Valid once; a
    /// second attempt is logged and ignored.
    pub fn set_provider(&self, provider: Weak<dyn InstanceProvider>) {
        if self.provider.set(provider).is_err() {
            warn!("Provider set more than once for instance {}", self.id());
        }
    }

    pub fn provider(&self) -> Option<Arc<dyn InstanceProvider>> {
        self.provider.get().and_then(Weak::upgrade)
    }

    // Variant constructors double as the `make` callback here, e.g.
    // `self.emit(InstanceEvent::PropertiesChanged)`.
    fn emit<F>(&self, make: F)
    where
        F: FnOnce(InstancePtr) -> InstanceEvent,
    {
        if let Some(this) = self.self_weak.upgrade() {
            self.events.emit(&make(this));
        }
    }
}
