//! Instance handle - single-instance lifecycle control without collection semantics

use std::sync::Arc;

use super::events::{HandleEvent, Notifier};
use super::instance::InstancePtr;

/// Lifecycle state of an [`InstanceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The loader has not run yet.
    NotLoaded,
    /// An instance is held.
    Loaded,
    /// The instance was released without touching its storage.
    Unloaded,
    /// The instance is gone from persistent storage (or the loader
    /// produced nothing).
    Destroyed,
}

/// Produces the instance for `id`, given whatever the handle currently
/// holds. Returning the held instance unchanged means "nothing to do";
/// returning `None` means the instance no longer exists.
pub type HandleLoader = Box<dyn FnMut(&str, Option<&InstancePtr>) -> Option<InstancePtr> + Send>;

/// Wraps one lazily-loaded instance with explicit reload/unload/destroy
/// transitions, independent of any list.
pub struct InstanceHandle {
    id: String,
    state: HandleState,
    instance: Option<InstancePtr>,
    loader: HandleLoader,
    events: Notifier<HandleEvent>,
}

impl InstanceHandle {
    pub fn new(id: impl Into<String>, loader: HandleLoader) -> Self {
        Self {
            id: id.into(),
            state: HandleState::NotLoaded,
            instance: None,
            loader,
            events: Notifier::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn instance(&self) -> Option<&InstancePtr> {
        self.instance.as_ref()
    }

    pub fn events(&self) -> &Notifier<HandleEvent> {
        &self.events
    }

    /// Run the loader and adopt its result. A loader returning the held
    /// instance unchanged leaves the handle alone; anything else swaps
    /// the instance and re-evaluates the state. `Unloaded` and
    /// `Destroyed` handles may reload back to `Loaded`.
    pub fn reload(&mut self) {
        let result = (self.loader)(&self.id, self.instance.as_ref());
        if let (Some(held), Some(loaded)) = (&self.instance, &result) {
            if Arc::ptr_eq(held, loaded) {
                return;
            }
        }
        let next = if result.is_some() {
            HandleState::Loaded
        } else {
            HandleState::Destroyed
        };
        self.instance = result;
        self.change_state(next);
    }

    /// Release the held instance. Valid only while `Loaded`; otherwise a
    /// no-op.
    pub fn unload(&mut self) {
        if self.state != HandleState::Loaded {
            return;
        }
        self.instance = None;
        self.change_state(HandleState::Unloaded);
    }

    /// Delete the held instance's backing storage and release it. Valid
    /// only while `Loaded`; otherwise a no-op.
    pub fn destroy(&mut self) {
        if self.state != HandleState::Loaded {
            return;
        }
        if let Some(instance) = self.instance.take() {
            instance.nuke();
        }
        self.change_state(HandleState::Destroyed);
    }

    // Only transitions that change the tag are observable.
    fn change_state(&mut self, new: HandleState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        self.events.emit(&HandleEvent { old, new });
    }
}
