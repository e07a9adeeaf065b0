//! Event subscription - typed change notifications for instances, providers and lists

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::handle::HandleState;
use super::instance::InstancePtr;

/// A subscription list for one event type.
///
/// Subscribers are never removed; callbacks that capture a `Weak` simply go
/// inert once their target is dropped. Emission snapshots the subscriber
/// vector first, so a callback may subscribe further callbacks re-entrantly.
pub struct Notifier<E> {
    subscribers: Mutex<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> Notifier<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked on every subsequent event.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Arc::new(callback)),
            Err(e) => warn!("Subscriber list lock poisoned: {}", e),
        }
    }

    /// Deliver `event` to every subscriber registered so far.
    pub fn emit(&self, event: &E) {
        let snapshot = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(e) => {
                warn!("Subscriber list lock poisoned: {}", e);
                return;
            }
        };
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<E> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes published by a single instance.
pub enum InstanceEvent {
    /// A displayed property (name, icon, flags, play time...) changed.
    PropertiesChanged(InstancePtr),
    /// The running state was toggled.
    RunningChanged(InstancePtr, bool),
    /// The status flag bitset changed.
    FlagsChanged(InstancePtr),
    /// The group was renamed through `set_group`.
    GroupChanged {
        instance: InstancePtr,
        old: String,
        new: String,
    },
    /// The backing storage was deleted.
    Nuked(InstancePtr),
}

/// Changes published by an instance provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The backing store changed in some unspecified way; discovery must
    /// run again to find out what.
    InstancesChanged,
    /// A set of group names became known (loaded or newly assigned).
    GroupsChanged(BTreeSet<String>),
}

/// Changes published by the instance list.
///
/// Structural events describe the sequence transition they were emitted
/// for; a consumer mirroring the list must apply them in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEvent {
    /// Rows `first..=last` were inserted.
    RowsInserted { first: usize, last: usize },
    /// Rows `first..=last` were removed.
    RowsRemoved { first: usize, last: usize },
    /// The instance at `row` changed a displayed property.
    RowChanged { row: usize },
    /// Newly published group names (delta, not the whole union).
    GroupsChanged(BTreeSet<String>),
    /// Everything may have changed; consumers should requery from scratch.
    Invalidated,
}

/// A lifecycle transition of an [`super::handle::InstanceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEvent {
    pub old: HandleState,
    pub new: HandleState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_all_subscribers() {
        let notifier: Notifier<u32> = Notifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            notifier.subscribe(move |n| {
                hits.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }
        notifier.emit(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn subscriber_added_during_emit_misses_current_event() {
        let notifier: Arc<Notifier<u32>> = Arc::new(Notifier::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_hits = Arc::clone(&hits);
        let inner_notifier = Arc::clone(&notifier);
        notifier.subscribe(move |_| {
            let hits = Arc::clone(&inner_hits);
            inner_notifier.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });
        notifier.emit(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        notifier.emit(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
