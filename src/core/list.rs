//! Instance list - ordered collection, reconciliation engine, batched change events

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use tracing::{debug, warn};

use super::events::{InstanceEvent, ListEvent, Notifier, ProviderEvent};
use super::instance::InstancePtr;
use super::provider::{FolderInstanceProvider, InstanceProvider};
use super::settings::SettingsPtr;

/// The ordered, observable collection of instances across all providers.
///
/// Row order is the addressable order exposed to consumers: newly
/// discovered instances append in discovery order, retained instances
/// keep their position. Consumers mirror the sequence by subscribing and
/// applying structural events in emission order.
pub struct InstanceList {
    shared: Arc<ListShared>,
}

struct ListShared {
    state: Mutex<ListState>,
    /// Serializes reconciliation passes. Held for the whole of
    /// `load_list` while `state` is only locked briefly, so callbacks
    /// fired during loading can still use the list.
    reconcile: Mutex<()>,
    /// Union of every group name any provider ever published. Grows
    /// monotonically; deleting a group only clears memberships.
    groups: Mutex<BTreeSet<String>>,
    events: Notifier<ListEvent>,
}

#[derive(Default)]
struct ListState {
    instances: Vec<InstancePtr>,
    providers: Vec<Arc<dyn InstanceProvider>>,
    /// Indices into `providers` with unreconciled storage changes.
    pending: HashSet<usize>,
    /// Positive means watching; zero or below means suspended.
    watch_level: i32,
}

impl InstanceList {
    /// Create a list over one folder provider rooted at `storage_root`
    /// and start watching it.
    pub fn new(global: SettingsPtr, storage_root: &Path) -> Result<Self> {
        let list = Self {
            shared: Arc::new(ListShared {
                state: Mutex::new(ListState::default()),
                reconcile: Mutex::new(()),
                groups: Mutex::new(BTreeSet::new()),
                events: Notifier::new(),
            }),
        };
        let provider = FolderInstanceProvider::new(global, storage_root)?;
        ListShared::register_provider(&list.shared, provider, false);
        list.resume_watch();
        Ok(list)
    }

    /// Register an additional provider. It starts out pending, so its
    /// instances appear on the next reconciliation pass (immediately, if
    /// the watch is active).
    pub fn add_provider(&self, provider: Arc<dyn InstanceProvider>) {
        ListShared::register_provider(&self.shared, provider, true);
        let trigger = self
            .shared
            .lock_state()
            .map(|state| state.watch_level == 1 && !state.pending.is_empty())
            .unwrap_or(false);
        if trigger {
            ListShared::load_list(&self.shared, false);
        }
    }

    /// Run the reconciliation pass: diff discovery results against the
    /// held collection, load new instances, retire missing ones, emit
    /// batched structural events. `complete` processes every provider
    /// instead of only the pending ones.
    pub fn load_list(&self, complete: bool) {
        ListShared::load_list(&self.shared, complete);
    }

    /// Append one instance, wiring its notifications. Returns the row.
    pub fn add(&self, instance: InstancePtr) -> usize {
        ListShared::wire_instance(&self.shared, &instance);
        let row = match self.shared.lock_state() {
            Ok(mut state) => {
                state.instances.push(instance);
                state.instances.len() - 1
            }
            Err(_) => return 0,
        };
        self.shared.events.emit(&ListEvent::RowsInserted {
            first: row,
            last: row,
        });
        row
    }

    pub fn len(&self) -> usize {
        self.shared
            .lock_state()
            .map(|state| state.instances.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, row: usize) -> Option<InstancePtr> {
        self.shared
            .lock_state()
            .ok()
            .and_then(|state| state.instances.get(row).cloned())
    }

    /// Snapshot of the current sequence.
    pub fn instances(&self) -> Vec<InstancePtr> {
        self.shared
            .lock_state()
            .map(|state| state.instances.clone())
            .unwrap_or_default()
    }

    /// Linear scan by identifier; instance counts are small.
    pub fn instance_by_id(&self, id: &str) -> Option<InstancePtr> {
        if id.is_empty() {
            return None;
        }
        self.instances().into_iter().find(|inst| inst.id() == id)
    }

    /// Row of `instance` by identity, if listed.
    pub fn index_of(&self, instance: &InstancePtr) -> Option<usize> {
        self.shared
            .lock_state()
            .ok()
            .and_then(|state| ListShared::position_of(&state.instances, instance))
    }

    /// All group names ever published by any provider, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.shared
            .groups
            .lock()
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear the group of every instance currently assigned to `name`.
    /// Each change is observed by its provider and persisted there.
    pub fn delete_group(&self, name: &str) {
        for instance in self.instances() {
            if instance.group() == name {
                instance.set_group("");
            }
        }
    }

    /// Pause reconciliation-on-notification. Nestable.
    pub fn suspend_watch(&self) {
        if let Ok(mut state) = self.shared.lock_state() {
            state.watch_level -= 1;
            debug!("Instance list watch level lowered to {}", state.watch_level);
        }
    }

    /// Undo one `suspend_watch`. Reaching the active level with pending
    /// providers triggers an immediate reconciliation pass. Resuming a
    /// list that is not suspended is a usage error: logged, ignored.
    pub fn resume_watch(&self) {
        let reload = match self.shared.lock_state() {
            Ok(mut state) => {
                if state.watch_level > 0 {
                    warn!("Bad suspend level resume in instance list");
                    return;
                }
                state.watch_level += 1;
                state.watch_level > 0 && !state.pending.is_empty()
            }
            Err(_) => return,
        };
        if reload {
            ListShared::load_list(&self.shared, false);
        }
    }

    /// Register a callback for list events.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ListEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback);
    }
}

impl ListShared {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ListState>, ()> {
        self.state.lock().map_err(|e| {
            warn!("Instance list lock poisoned: {}", e);
        })
    }

    fn position_of(instances: &[InstancePtr], instance: &InstancePtr) -> Option<usize> {
        instances.iter().position(|held| Arc::ptr_eq(held, instance))
    }

    fn register_provider(
        shared: &Arc<Self>,
        provider: Arc<dyn InstanceProvider>,
        mark_pending: bool,
    ) {
        let index = match shared.lock_state() {
            Ok(mut state) => {
                state.providers.push(Arc::clone(&provider));
                let index = state.providers.len() - 1;
                if mark_pending {
                    state.pending.insert(index);
                }
                index
            }
            Err(_) => return,
        };
        let weak = Arc::downgrade(shared);
        provider.events().subscribe(move |event| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match event {
                ProviderEvent::InstancesChanged => Self::provider_updated(&shared, index),
                ProviderEvent::GroupsChanged(names) => shared.groups_published(names),
            }
        });
    }

    /// A provider signalled a storage change: mark it pending and, if the
    /// watch is active, reconcile right away.
    fn provider_updated(shared: &Arc<Self>, index: usize) {
        let trigger = match shared.lock_state() {
            Ok(mut state) => {
                state.pending.insert(index);
                state.watch_level == 1
            }
            Err(_) => return,
        };
        if trigger {
            Self::load_list(shared, false);
        }
    }

    fn groups_published(&self, names: &BTreeSet<String>) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.extend(names.iter().cloned());
        }
        self.events.emit(&ListEvent::GroupsChanged(names.clone()));
    }

    /// Wire an instance's own notifications into the list's propagation.
    fn wire_instance(shared: &Arc<Self>, instance: &InstancePtr) {
        let weak = Arc::downgrade(shared);
        instance.events().subscribe(move |event| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match event {
                InstanceEvent::PropertiesChanged(instance) => shared.row_changed(instance),
                InstanceEvent::Nuked(instance) => shared.instance_nuked(instance),
                _ => {}
            }
        });
    }

    fn row_changed(&self, instance: &InstancePtr) {
        let row = self
            .lock_state()
            .ok()
            .and_then(|state| Self::position_of(&state.instances, instance));
        // Events from instances no longer listed are ignored.
        if let Some(row) = row {
            self.events.emit(&ListEvent::RowChanged { row });
        }
    }

    fn instance_nuked(&self, instance: &InstancePtr) {
        let row = match self.lock_state() {
            Ok(mut state) => {
                let row = Self::position_of(&state.instances, instance);
                if let Some(row) = row {
                    state.instances.remove(row);
                }
                row
            }
            Err(_) => None,
        };
        if let Some(row) = row {
            self.events.emit(&ListEvent::RowsRemoved {
                first: row,
                last: row,
            });
        }
    }

    /// The reconciliation pass. Discovery and loading run without the
    /// list lock so group events published during loading can re-enter
    /// freely; the diff is applied under the lock and the staged events
    /// go out after it is released.
    fn load_list(shared: &Arc<Self>, complete: bool) {
        let _pass = match shared.reconcile.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Reconcile lock poisoned: {}", e);
                return;
            }
        };
        let (current, providers) = match shared.lock_state() {
            Ok(state) => {
                let providers: Vec<Arc<dyn InstanceProvider>> = if complete {
                    state.providers.clone()
                } else {
                    // Process pending providers in registration order so
                    // insertion order stays deterministic.
                    let mut indexes: Vec<usize> = state.pending.iter().copied().collect();
                    indexes.sort_unstable();
                    indexes
                        .into_iter()
                        .filter_map(|index| state.providers.get(index).cloned())
                        .collect()
                };
                (state.instances.clone(), providers)
            }
            Err(_) => return,
        };

        // Map id -> (instance, original row) for everything currently held.
        let mut existing: HashMap<String, (InstancePtr, usize)> = HashMap::new();
        for (row, instance) in current.iter().enumerate() {
            let id = instance.id();
            if existing.contains_key(&id) {
                warn!("Duplicate ID {} in instance list", id);
            }
            existing.insert(id, (Arc::clone(instance), row));
        }

        let mut staged: Vec<InstancePtr> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();
        for provider in &providers {
            for id in provider.discover_instances() {
                if !claimed.insert(id.clone()) {
                    warn!(
                        "Duplicate instance ID {} from multiple providers; keeping the first",
                        id
                    );
                    continue;
                }
                if existing.remove(&id).is_some() {
                    // Retained as-is: on-disk state of kept instances is
                    // not refreshed, so object identity stays stable
                    // across passes.
                    debug!("Keeping instance {}", id);
                    continue;
                }
                let instance = provider.load_instance(&id);
                Self::wire_instance(shared, &instance);
                staged.push(instance);
            }
        }

        if !complete {
            // A partial pass only queried the pending providers, so it can
            // only retire rows those providers own; everything else was
            // simply not rediscovered and must stay.
            existing.retain(|_, entry| {
                entry
                    .0
                    .provider()
                    .map(|owner| {
                        let owner = Arc::as_ptr(&owner) as *const ();
                        providers
                            .iter()
                            .any(|queried| Arc::as_ptr(queried) as *const () == owner)
                    })
                    .unwrap_or(false)
            });
        }

        let mut staged_events: Vec<ListEvent> = Vec::new();
        match shared.lock_state() {
            Ok(mut state) => {
                if !existing.is_empty() {
                    // Everything still in the map is gone from storage.
                    // Sort by original row, last to first, and merge
                    // adjacent rows into maximal contiguous ranges so the
                    // presentation layer gets one event per range.
                    let mut dead: Vec<(InstancePtr, usize)> = existing.into_values().collect();
                    dead.sort_by(|a, b| b.1.cmp(&a.1));

                    let mut ranges: Vec<(usize, usize)> = Vec::new();
                    let mut front: Option<usize> = None;
                    let mut back: Option<usize> = None;
                    for (instance, row) in &dead {
                        instance.invalidate();
                        if back.is_none() {
                            back = Some(*row);
                        } else if front != Some(row + 1) {
                            // Seam between the previous range and this row.
                            if let (Some(front), Some(back)) = (front, back) {
                                ranges.push((front, back));
                            }
                            back = Some(*row);
                        }
                        front = Some(*row);
                    }
                    if let (Some(front), Some(back)) = (front, back) {
                        ranges.push((front, back));
                    }

                    // Ranges were collected high-to-low, so each drain
                    // leaves the lower rows untouched.
                    for (first, last) in ranges {
                        state.instances.drain(first..=last);
                        staged_events.push(ListEvent::RowsRemoved { first, last });
                    }
                }

                if !staged.is_empty() {
                    let first = state.instances.len();
                    let last = first + staged.len() - 1;
                    state.instances.extend(staged);
                    staged_events.push(ListEvent::RowsInserted { first, last });
                }

                state.pending.clear();
            }
            Err(_) => return,
        }

        for event in staged_events {
            shared.events.emit(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::MARKER_FILE;
    use crate::core::settings::{register_global_defaults, SettingsStore};
    use std::fs;
    use tempfile::tempdir;

    fn make_instance_dir(root: &Path, id: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MARKER_FILE), r#"{ "InstanceType": "OneSix" }"#).unwrap();
    }

    fn global_settings() -> SettingsPtr {
        let global = SettingsStore::in_memory();
        register_global_defaults(&global);
        global
    }

    /// A list with auto-reconciliation off, so tests drive every pass.
    fn quiet_list(root: &Path) -> (InstanceList, Arc<Mutex<Vec<ListEvent>>>) {
        let list = InstanceList::new(global_settings(), root).unwrap();
        list.suspend_watch();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        list.subscribe(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        });
        (list, events)
    }

    fn structural(events: &Arc<Mutex<Vec<ListEvent>>>) -> Vec<ListEvent> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    ListEvent::RowsInserted { .. } | ListEvent::RowsRemoved { .. }
                )
            })
            .cloned()
            .collect()
    }

    #[test]
    fn discovery_inserts_one_contiguous_block() {
        let dir = tempdir().unwrap();
        for id in ["a", "b", "c"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, events) = quiet_list(dir.path());

        list.load_list(true);
        assert_eq!(list.len(), 3);
        assert_eq!(
            structural(&events),
            vec![ListEvent::RowsInserted { first: 0, last: 2 }]
        );
        assert_eq!(list.get(0).unwrap().id(), "a");
        assert_eq!(list.get(2).unwrap().id(), "c");
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let dir = tempdir().unwrap();
        for id in ["a", "b"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, events) = quiet_list(dir.path());

        list.load_list(true);
        let first_pass = list.instances();
        events.lock().unwrap().clear();

        list.load_list(true);
        assert!(structural(&events).is_empty());
        // Retained entries keep their object identity.
        let second_pass = list.instances();
        for (a, b) in first_pass.iter().zip(second_pass.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn removals_merge_into_contiguous_ranges() {
        let dir = tempdir().unwrap();
        // i0..i8 sort lexicographically, so rows match the suffix.
        for n in 0..9 {
            make_instance_dir(dir.path(), &format!("i{}", n));
        }
        let (list, events) = quiet_list(dir.path());
        list.load_list(true);
        assert_eq!(list.len(), 9);
        events.lock().unwrap().clear();

        for n in [1, 2, 3, 7, 8] {
            fs::remove_dir_all(dir.path().join(format!("i{}", n))).unwrap();
        }
        list.load_list(true);

        assert_eq!(
            structural(&events),
            vec![
                ListEvent::RowsRemoved { first: 7, last: 8 },
                ListEvent::RowsRemoved { first: 1, last: 3 },
            ]
        );
        assert_eq!(list.len(), 4);
        let ids: Vec<String> = list.instances().iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["i0", "i4", "i5", "i6"]);
    }

    #[test]
    fn removal_and_insertion_in_one_pass() {
        let dir = tempdir().unwrap();
        for id in ["a", "b", "c"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, events) = quiet_list(dir.path());
        list.load_list(true);
        events.lock().unwrap().clear();

        fs::remove_dir_all(dir.path().join("b")).unwrap();
        make_instance_dir(dir.path(), "d");
        list.load_list(true);

        assert_eq!(
            structural(&events),
            vec![
                ListEvent::RowsRemoved { first: 1, last: 1 },
                ListEvent::RowsInserted { first: 2, last: 2 },
            ]
        );
        let ids: Vec<String> = list.instances().iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn pending_providers_reconcile_on_resume() {
        let dir = tempdir().unwrap();
        let (list, events) = quiet_list(dir.path());

        make_instance_dir(dir.path(), "late");
        // Simulate the storage notification while suspended: the provider
        // is only marked pending.
        let provider = list.shared.lock_state().unwrap().providers[0].clone();
        provider.events().emit(&ProviderEvent::InstancesChanged);
        assert_eq!(list.len(), 0);

        list.resume_watch();
        assert_eq!(list.len(), 1);
        assert_eq!(
            structural(&events),
            vec![ListEvent::RowsInserted { first: 0, last: 0 }]
        );
    }

    #[test]
    fn notifications_reconcile_immediately_while_watching() {
        let dir = tempdir().unwrap();
        let list = InstanceList::new(global_settings(), dir.path()).unwrap();
        make_instance_dir(dir.path(), "fresh");

        // Watch level is 1 after construction, so the coarse signal runs
        // a pass synchronously.
        let provider = list.shared.lock_state().unwrap().providers[0].clone();
        provider.events().emit(&ProviderEvent::InstancesChanged);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn resume_without_suspend_is_ignored() {
        let dir = tempdir().unwrap();
        let list = InstanceList::new(global_settings(), dir.path()).unwrap();
        assert_eq!(list.shared.lock_state().unwrap().watch_level, 1);
        list.resume_watch();
        assert_eq!(list.shared.lock_state().unwrap().watch_level, 1);
    }

    #[test]
    fn nested_suspends_must_unwind_before_reconciling() {
        let dir = tempdir().unwrap();
        let (list, _events) = quiet_list(dir.path());
        list.suspend_watch();

        make_instance_dir(dir.path(), "queued");
        let provider = list.shared.lock_state().unwrap().providers[0].clone();
        provider.events().emit(&ProviderEvent::InstancesChanged);

        list.resume_watch();
        assert_eq!(list.len(), 0);
        list.resume_watch();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn add_appends_one_row() {
        let dir = tempdir().unwrap();
        make_instance_dir(dir.path(), "solo");
        let (list, events) = quiet_list(dir.path());

        let provider = list.shared.lock_state().unwrap().providers[0].clone();
        let instance = provider.load_instance("solo");
        let row = list.add(instance);

        assert_eq!(row, 0);
        assert_eq!(
            structural(&events),
            vec![ListEvent::RowsInserted { first: 0, last: 0 }]
        );
    }

    #[test]
    fn nuked_instances_drop_their_row() {
        let dir = tempdir().unwrap();
        for id in ["a", "b"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, events) = quiet_list(dir.path());
        list.load_list(true);
        events.lock().unwrap().clear();

        let doomed = list.instance_by_id("a").unwrap();
        doomed.nuke();

        assert_eq!(
            structural(&events),
            vec![ListEvent::RowsRemoved { first: 0, last: 0 }]
        );
        assert_eq!(list.len(), 1);
        assert!(list.instance_by_id("a").is_none());
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn property_changes_map_to_row_events() {
        let dir = tempdir().unwrap();
        for id in ["a", "b"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, events) = quiet_list(dir.path());
        list.load_list(true);
        events.lock().unwrap().clear();

        list.instance_by_id("b").unwrap().set_name("Renamed");
        let seen = events.lock().unwrap();
        assert!(seen.contains(&ListEvent::RowChanged { row: 1 }));
    }

    #[test]
    fn groups_accumulate_and_delete_clears_membership() {
        let dir = tempdir().unwrap();
        for id in ["x", "y", "z"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, _events) = quiet_list(dir.path());
        list.load_list(true);

        list.instance_by_id("x").unwrap().set_group("A");
        list.instance_by_id("y").unwrap().set_group("A");
        list.instance_by_id("z").unwrap().set_group("B");
        assert_eq!(list.groups(), vec!["A", "B"]);

        list.delete_group("A");
        assert_eq!(list.instance_by_id("x").unwrap().group(), "");
        assert_eq!(list.instance_by_id("y").unwrap().group(), "");
        assert_eq!(list.instance_by_id("z").unwrap().group(), "B");
        // The name set only grows.
        assert_eq!(list.groups(), vec!["A", "B"]);
    }

    #[test]
    fn incremental_pass_only_queries_pending_providers() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        make_instance_dir(dir_a.path(), "first");

        let (list, _events) = quiet_list(dir_a.path());
        list.load_list(true);
        assert_eq!(list.len(), 1);

        // Provider B arrives pending; provider A has no changes.
        make_instance_dir(dir_b.path(), "second");
        let second = FolderInstanceProvider::new(global_settings(), dir_b.path()).unwrap();
        list.add_provider(second);
        list.load_list(false);

        let ids: Vec<String> = list.instances().iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn duplicate_ids_across_providers_keep_the_first() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        make_instance_dir(dir_a.path(), "same");
        make_instance_dir(dir_b.path(), "same");
        make_instance_dir(dir_b.path(), "unique");

        let (list, _events) = quiet_list(dir_a.path());
        let second = FolderInstanceProvider::new(global_settings(), dir_b.path()).unwrap();
        list.add_provider(second);

        list.load_list(true);
        assert_eq!(list.len(), 2);
        let ids: Vec<String> = list.instances().iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["same", "unique"]);
        // The retained copy is the first provider's.
        let kept = list.instance_by_id("same").unwrap();
        assert!(kept.root().starts_with(dir_a.path()));
    }

    #[test]
    fn lookups_by_id_and_identity() {
        let dir = tempdir().unwrap();
        for id in ["a", "b"] {
            make_instance_dir(dir.path(), id);
        }
        let (list, _events) = quiet_list(dir.path());
        list.load_list(true);

        let b = list.instance_by_id("b").unwrap();
        assert_eq!(list.index_of(&b), Some(1));
        assert!(list.instance_by_id("").is_none());
        assert!(list.instance_by_id("missing").is_none());

        let foreign = {
            let provider = list.shared.lock_state().unwrap().providers[0].clone();
            provider.load_instance("a")
        };
        // A separately loaded copy is a different identity.
        assert_eq!(list.index_of(&foreign), None);
    }
}
