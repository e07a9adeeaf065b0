//! Instance providers - discovery, loading, and group persistence for a storage root

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::events::{InstanceEvent, Notifier, ProviderEvent};
use super::instance::{Instance, InstanceFlags, InstanceKind, InstancePtr};
use super::settings::{coerce_i64, SettingsPtr, SettingsStore};

/// Instance identifier: the name of its storage folder.
pub type InstanceId = String;

/// Marker settings file that makes a child directory an instance.
pub const MARKER_FILE: &str = "instance.cfg";

const GROUP_FILE: &str = "instgroups.json";
const GROUP_FILE_FORMAT_VERSION: i64 = 1;

/// A backing store that discovers and loads instances and persists their
/// group assignments. Providers never hold strong instance references.
pub trait InstanceProvider: Send + Sync {
    /// Scan the backing store for instance identifiers.
    fn discover_instances(&self) -> Vec<InstanceId>;

    /// Load one instance. Never fails: unreadable or unrecognized
    /// instances come back as a Broken placeholder.
    fn load_instance(&self, id: &str) -> InstancePtr;

    /// Load persisted group assignments. Failures degrade to "no group
    /// information" with a logged cause.
    fn load_group_list(&self);

    /// Persist all group assignments.
    fn save_group_list(&self);

    fn events(&self) -> &Notifier<ProviderEvent>;
}

struct GroupState {
    map: HashMap<InstanceId, String>,
    loaded: bool,
}

/// Provider over one storage root directory: every immediate child
/// directory containing [`MARKER_FILE`] is an instance.
pub struct FolderInstanceProvider {
    self_weak: Weak<FolderInstanceProvider>,
    global: SettingsPtr,
    root: PathBuf,
    groups: Mutex<GroupState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    events: Notifier<ProviderEvent>,
}

/// Pauses the storage watch for the lifetime of the guard, so the
/// provider does not react to its own writes. The watch is restored on
/// drop no matter how the write went.
struct WatchSuppression<'a> {
    provider: &'a FolderInstanceProvider,
}

impl Drop for WatchSuppression<'_> {
    fn drop(&mut self) {
        let provider = self.provider;
        if let Ok(mut watcher) = provider.watcher.lock() {
            if let Some(watcher) = watcher.as_mut() {
                if let Err(e) = watcher.watch(&provider.root, RecursiveMode::NonRecursive) {
                    warn!("Failed to restore watch on {:?}: {}", provider.root, e);
                }
            }
        }
    }
}

impl FolderInstanceProvider {
    /// Create a provider over `root`, creating the directory if needed
    /// and starting a storage watch on it.
    ///
    /// Watch setup failures are logged and degrade to manual
    /// reconciliation; they do not fail construction.
    pub fn new(global: SettingsPtr, root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating instance root {:?}", root))?;

        let provider = Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            global,
            root,
            groups: Mutex::new(GroupState {
                map: HashMap::new(),
                loaded: false,
            }),
            watcher: Mutex::new(None),
            events: Notifier::new(),
        });

        let weak = Arc::downgrade(&provider);
        match notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(_) => {
                    if let Some(provider) = weak.upgrade() {
                        provider.events.emit(&ProviderEvent::InstancesChanged);
                    }
                }
                Err(e) => warn!("Storage watcher error: {}", e),
            }
        }) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&provider.root, RecursiveMode::NonRecursive) {
                    warn!("Failed to watch instance root {:?}: {}", provider.root, e);
                }
                if let Ok(mut slot) = provider.watcher.lock() {
                    *slot = Some(watcher);
                }
            }
            Err(e) => warn!(
                "Failed to create storage watcher for {:?}: {}",
                provider.root, e
            ),
        }

        Ok(provider)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raise the coarse "storage changed" signal by hand, as if the
    /// watcher had fired.
    pub fn notify_changed(&self) {
        self.events.emit(&ProviderEvent::InstancesChanged);
    }

    /// Look up the persisted group of `id`, loading the group map first
    /// if necessary.
    pub fn group_of(&self, id: &str) -> Option<String> {
        self.ensure_groups_loaded();
        self.groups
            .lock()
            .ok()
            .and_then(|groups| groups.map.get(id).cloned())
    }

    fn ensure_groups_loaded(&self) {
        let needs_load = self
            .groups
            .lock()
            .map(|groups| !groups.loaded)
            .unwrap_or(false);
        if needs_load {
            self.load_group_list();
        }
    }

    /// A symbolic link whose target resolves back into the storage root
    /// would be rediscovered under its own name; skip it.
    fn is_cyclic_link(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        if !meta.file_type().is_symlink() {
            return false;
        }
        let (Ok(target), Ok(root)) = (fs::canonicalize(path), fs::canonicalize(&self.root)) else {
            return false;
        };
        if target.parent() == Some(root.as_path()) {
            debug!(
                "Ignoring symlink {:?} that leads back into the instance root",
                path
            );
            return true;
        }
        false
    }

    fn suppress_watch(&self) -> WatchSuppression<'_> {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(watcher) = watcher.as_mut() {
                if let Err(e) = watcher.unwatch(&self.root) {
                    debug!("Failed to pause watch on {:?}: {}", self.root, e);
                }
            }
        }
        WatchSuppression { provider: self }
    }

    /// An instance this provider loaded was moved to another group:
    /// remember it, publish the name, and re-persist the whole file.
    fn on_group_changed(&self, id: &str, group: &str) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.map.insert(id.to_owned(), group.to_owned());
        }
        if !group.is_empty() {
            let mut published = BTreeSet::new();
            published.insert(group.to_owned());
            self.events.emit(&ProviderEvent::GroupsChanged(published));
        }
        self.save_group_list();
    }

    /// Parse the group file into an id map and the set of group names.
    /// Any fatal problem returns None; malformed individual entries are
    /// skipped so one bad group cannot drop the rest.
    fn parse_group_file(&self) -> Option<(HashMap<InstanceId, String>, BTreeSet<String>)> {
        let path = self.root.join(GROUP_FILE);
        if !path.exists() {
            debug!("No group file at {:?}", path);
            return None;
        }
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to read instance group file: {}", e);
                return None;
            }
        };
        let doc: Value = match serde_json::from_str(&data) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to parse instance group file: {}", e);
                return None;
            }
        };
        let Some(root_obj) = doc.as_object() else {
            warn!("Invalid group file. Root entry should be an object.");
            return None;
        };
        let version = root_obj.get("formatVersion").and_then(coerce_i64);
        if version != Some(GROUP_FILE_FORMAT_VERSION) {
            warn!(
                "Unsupported group file format version: {:?}",
                root_obj.get("formatVersion")
            );
            return None;
        }
        let Some(groups) = root_obj.get("groups").and_then(Value::as_object) else {
            warn!("Invalid group list JSON: 'groups' should be an object.");
            return None;
        };

        let mut map = HashMap::new();
        let mut names = BTreeSet::new();
        for (name, entry) in groups {
            let Some(entry) = entry.as_object() else {
                warn!("Group '{}' in the group list should be an object.", name);
                continue;
            };
            let Some(instances) = entry.get("instances").and_then(Value::as_array) else {
                warn!(
                    "Group '{}' in the group list is missing an 'instances' array.",
                    name
                );
                continue;
            };
            names.insert(name.clone());
            for id in instances {
                if let Some(id) = id.as_str() {
                    map.insert(id.to_owned(), name.clone());
                }
            }
        }
        Some((map, names))
    }
}

impl InstanceProvider for FolderInstanceProvider {
    fn discover_instances(&self) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan instance root {:?}: {}", self.root, e);
                return out;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // metadata() follows symlinks; unreadable children are skipped.
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            if !path.join(MARKER_FILE).is_file() {
                continue;
            }
            if self.is_cyclic_link(&path) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            debug!("Found instance ID {}", id);
            out.push(id);
        }
        // read_dir order is platform-dependent; keep discovery (and with
        // it insertion order) deterministic.
        out.sort();
        out
    }

    fn load_instance(&self, id: &str) -> InstancePtr {
        self.ensure_groups_loaded();

        let instance_root = self.root.join(id);
        let marker = instance_root.join(MARKER_FILE);
        let (settings, damaged) = match SettingsStore::load(&marker) {
            Ok(settings) => (settings, false),
            Err(e) => {
                warn!("Failed to open instance marker: {}", e);
                (SettingsStore::empty_at(&marker), true)
            }
        };
        settings.register_setting("InstanceType", "Legacy");

        let kind = if damaged {
            InstanceKind::Broken
        } else {
            InstanceKind::from_type_str(&settings.get_string("InstanceType"))
        };

        let instance = Instance::new(settings, &self.global, instance_root, kind);
        if kind == InstanceKind::Broken {
            instance.set_flag(InstanceFlags::INSTANCE_BROKEN);
        }

        let backref: Weak<dyn InstanceProvider> = self.self_weak.clone();
        instance.set_provider(backref);

        let initial_group = self
            .groups
            .lock()
            .ok()
            .and_then(|groups| groups.map.get(id).cloned());
        if let Some(group) = initial_group {
            instance.set_group_initial(&group);
        }

        let weak = self.self_weak.clone();
        instance.events().subscribe(move |event| {
            if let InstanceEvent::GroupChanged { instance, new, .. } = event {
                if let Some(provider) = weak.upgrade() {
                    provider.on_group_changed(&instance.id(), new);
                }
            }
        });

        debug!(
            "Loaded instance {} from {:?}",
            instance.name(),
            instance.root()
        );
        instance
    }

    fn load_group_list(&self) {
        let parsed = self.parse_group_file();
        let names = match self.groups.lock() {
            Ok(mut groups) => {
                groups.loaded = true;
                match parsed {
                    Some((map, names)) => {
                        groups.map = map;
                        Some(names)
                    }
                    // Degraded: no group information, discovery unaffected.
                    None => None,
                }
            }
            Err(e) => {
                warn!("Group state lock poisoned: {}", e);
                None
            }
        };
        if let Some(names) = names {
            self.events.emit(&ProviderEvent::GroupsChanged(names));
        }
    }

    fn save_group_list(&self) {
        let _suppressed = self.suppress_watch();

        let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        if let Ok(groups) = self.groups.lock() {
            for (id, group) in &groups.map {
                if group.is_empty() {
                    continue;
                }
                reverse.entry(group.clone()).or_default().insert(id.clone());
            }
        }

        let mut groups_obj = serde_json::Map::new();
        for (name, ids) in reverse {
            groups_obj.insert(
                name,
                json!({
                    "hidden": "false",
                    "instances": ids,
                }),
            );
        }
        let doc = json!({
            "formatVersion": "1",
            "groups": groups_obj,
        });

        let path = self.root.join(GROUP_FILE);
        let written = serde_json::to_string_pretty(&doc)
            .map_err(anyhow::Error::from)
            .and_then(|data| fs::write(&path, data).map_err(anyhow::Error::from));
        if let Err(e) = written {
            error!("Failed to write instance group file: {:#}", e);
        }
    }

    fn events(&self) -> &Notifier<ProviderEvent> {
        &self.events
    }
}
