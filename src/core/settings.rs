//! Settings store - registered defaults, eager persistence, and override-chain resolution

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Shared handle to a settings store.
pub type SettingsPtr = Arc<SettingsStore>;

/// Errors surfaced when opening a settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("settings file {path:?} is not a JSON object")]
    NotAnObject { path: PathBuf },
}

/// A bound redirect: while the flag setting is false, reads of the bound
/// key resolve through `source` instead of the local value.
struct OverrideLink {
    source: SettingsPtr,
    flag_key: String,
}

#[derive(Default)]
struct StoreInner {
    /// Explicitly-set values; this map is what gets persisted.
    values: BTreeMap<String, Value>,
    /// Registered defaults, consulted when no value is set.
    defaults: BTreeMap<String, Value>,
    /// Per-key override links (see [`SettingsStore::register_override`]).
    overrides: BTreeMap<String, OverrideLink>,
}

/// Key/value settings backed by a flat JSON object on disk.
///
/// Every mutation persists eagerly. A store constructed without a path
/// (the shared global store, test fixtures) keeps everything in memory.
pub struct SettingsStore {
    path: Option<PathBuf>,
    inner: RwLock<StoreInner>,
}

impl SettingsStore {
    /// Create a store with no backing file.
    pub fn in_memory() -> SettingsPtr {
        Arc::new(Self {
            path: None,
            inner: RwLock::new(StoreInner::default()),
        })
    }

    /// Create an empty store pointing at `path` without reading it.
    pub fn empty_at(path: impl Into<PathBuf>) -> SettingsPtr {
        Arc::new(Self {
            path: Some(path.into()),
            inner: RwLock::new(StoreInner::default()),
        })
    }

    /// Open the store at `path`, reading the file if it exists.
    ///
    /// A missing file is not an error; the file appears on first write.
    pub fn load(path: impl Into<PathBuf>) -> Result<SettingsPtr, SettingsError> {
        let path = path.into();
        let values = Self::read_file(&path)?;
        Ok(Arc::new(Self {
            path: Some(path),
            inner: RwLock::new(StoreInner {
                values,
                ..StoreInner::default()
            }),
        }))
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, Value>, SettingsError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: Value = serde_json::from_str(&data).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        match doc {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(SettingsError::NotAnObject {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Declare a setting and its default value.
    ///
    /// Registering the same key again keeps the first default.
    pub fn register_setting(&self, key: &str, default: impl Into<Value>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.defaults.entry(key.to_owned()).or_insert(default.into());
        }
    }

    /// Bind `key` to the same key in `source`, gated by the boolean
    /// setting `flag_key` on this store.
    ///
    /// While the flag resolves to false, `get(key)` returns whatever
    /// `source` currently holds; the chain is evaluated on every read, so
    /// later changes to `source` are observed immediately. While the flag
    /// is true, the locally stored value wins, falling back to `source`
    /// until one is written. Writes always target the local value.
    pub fn register_override(&self, source: &SettingsPtr, key: &str, flag_key: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.overrides.insert(
                key.to_owned(),
                OverrideLink {
                    source: Arc::clone(source),
                    flag_key: flag_key.to_owned(),
                },
            );
        }
    }

    /// Resolve the effective value of `key`.
    pub fn get(&self, key: &str) -> Value {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(e) => {
                warn!("Settings lock poisoned: {}", e);
                return Value::Null;
            }
        };
        if let Some(link) = inner.overrides.get(key) {
            // The flag is a plain local setting; resolve it without
            // re-entering get() so the read lock is taken only once.
            let enabled = inner
                .values
                .get(&link.flag_key)
                .or_else(|| inner.defaults.get(&link.flag_key))
                .and_then(coerce_bool)
                .unwrap_or(false);
            if !enabled {
                return link.source.get(key);
            }
            if let Some(value) = inner.values.get(key) {
                return value.clone();
            }
            return link.source.get(key);
        }
        inner
            .values
            .get(key)
            .or_else(|| inner.defaults.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn get_string(&self, key: &str) -> String {
        coerce_string(&self.get(key)).unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        coerce_bool(&self.get(key)).unwrap_or(false)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        coerce_i64(&self.get(key)).unwrap_or(0)
    }

    /// True when `key` has an explicitly-set local value.
    pub fn is_set(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.values.contains_key(key))
            .unwrap_or(false)
    }

    /// Store a local value and persist the file.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.values.insert(key.to_owned(), value.into());
        }
        if let Err(e) = self.save() {
            warn!("Failed to save settings file: {:#}", e);
        }
    }

    /// Drop the local value for `key`, reverting reads to the default
    /// (or the override chain), and persist the file.
    pub fn reset(&self, key: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.values.remove(key);
        }
        if let Err(e) = self.save() {
            warn!("Failed to save settings file: {:#}", e);
        }
    }

    /// Re-read the backing file, replacing all local values.
    ///
    /// Returns false (leaving values untouched) when the file cannot be
    /// read or parsed. A store without a backing file reloads to empty.
    pub fn reload(&self) -> bool {
        let Some(path) = &self.path else {
            if let Ok(mut inner) = self.inner.write() {
                inner.values.clear();
            }
            return true;
        };
        match Self::read_file(path) {
            Ok(values) => {
                if let Ok(mut inner) = self.inner.write() {
                    inner.values = values;
                }
                true
            }
            Err(e) => {
                warn!("Failed to reload settings: {}", e);
                false
            }
        }
    }

    /// Write the current local values out. No-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = {
            let inner = self
                .inner
                .read()
                .map_err(|e| anyhow::anyhow!("Settings lock poisoned: {}", e))?;
            serde_json::to_string_pretty(&inner.values)?
        };
        fs::write(path, serialized).with_context(|| format!("writing settings to {:?}", path))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Register the shared settings that instance stores link against.
pub fn register_global_defaults(store: &SettingsStore) {
    store.register_setting("PreLaunchCommand", "");
    store.register_setting("WrapperCommand", "");
    store.register_setting("PostExitCommand", "");
    store.register_setting("ShowConsole", true);
    store.register_setting("AutoCloseConsole", false);
    store.register_setting("LogPrePostOutput", true);
}

/// Lenient integer coercion: numbers, numeric strings and booleans count.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

/// Lenient boolean coercion: `"true"`/`"1"` strings and nonzero numbers count.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        _ => None,
    }
}

pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn defaults_and_local_values() {
        let store = SettingsStore::in_memory();
        store.register_setting("name", "Unnamed Instance");
        assert_eq!(store.get_string("name"), "Unnamed Instance");
        store.set("name", "Renamed");
        assert_eq!(store.get_string("name"), "Renamed");
        store.reset("name");
        assert_eq!(store.get_string("name"), "Unnamed Instance");
        assert_eq!(store.get("unknown"), Value::Null);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instance.cfg");
        let store = SettingsStore::load(&path).unwrap();
        store.set("iconKey", "flame");
        store.set("lastLaunchTime", 1234);

        let reopened = SettingsStore::load(&path).unwrap();
        assert_eq!(reopened.get_string("iconKey"), "flame");
        assert_eq!(reopened.get_i64("lastLaunchTime"), 1234);
    }

    #[test]
    fn reload_replaces_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instance.cfg");
        let store = SettingsStore::load(&path).unwrap();
        store.set("notes", "before");

        fs::write(&path, r#"{ "notes": "after" }"#).unwrap();
        assert!(store.reload());
        assert_eq!(store.get_string("notes"), "after");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instance.cfg");
        fs::write(&path, "not json at all {").unwrap();
        assert!(matches!(
            SettingsStore::load(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn override_resolution_follows_the_flag() {
        let global = SettingsStore::in_memory();
        global.register_setting("PreLaunchCommand", "");
        global.set("PreLaunchCommand", "global-cmd");

        let local = SettingsStore::in_memory();
        local.register_setting("OverrideCommands", false);
        local.register_override(&global, "PreLaunchCommand", "OverrideCommands");

        // Flag off: reads chase the global value, live.
        assert_eq!(local.get_string("PreLaunchCommand"), "global-cmd");
        global.set("PreLaunchCommand", "global-cmd-2");
        assert_eq!(local.get_string("PreLaunchCommand"), "global-cmd-2");

        // Writes land locally even while the flag is off.
        local.set("PreLaunchCommand", "local-cmd");
        assert_eq!(local.get_string("PreLaunchCommand"), "global-cmd-2");

        // Flag on: the locally stored value wins, independent of global.
        local.set("OverrideCommands", true);
        assert_eq!(local.get_string("PreLaunchCommand"), "local-cmd");
        global.set("PreLaunchCommand", "global-cmd-3");
        assert_eq!(local.get_string("PreLaunchCommand"), "local-cmd");
    }

    #[test]
    fn override_without_local_value_falls_back_to_source() {
        let global = SettingsStore::in_memory();
        global.register_setting("WrapperCommand", "wrap");

        let local = SettingsStore::in_memory();
        local.register_setting("OverrideCommands", false);
        local.register_override(&global, "WrapperCommand", "OverrideCommands");
        local.set("OverrideCommands", true);

        assert_eq!(local.get_string("WrapperCommand"), "wrap");
    }

    #[test]
    fn coercion_is_lenient() {
        assert_eq!(coerce_i64(&json!("1")), Some(1));
        assert_eq!(coerce_i64(&json!(" 2 ")), Some(2));
        assert_eq!(coerce_i64(&json!(3)), Some(3));
        assert_eq!(coerce_i64(&json!(true)), Some(1));
        assert_eq!(coerce_i64(&json!("one")), None);
        assert_eq!(coerce_bool(&json!("true")), Some(true));
        assert_eq!(coerce_bool(&json!(0)), Some(false));
        assert_eq!(coerce_string(&json!(42)), Some("42".to_owned()));
    }
}
