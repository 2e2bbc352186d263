//! # Extension Container
//!
//! Owns one extension together with its listeners, its two shared state
//! stores and the ordered queue events are delivered through. All listener
//! callbacks of one extension run on that queue's task, one event at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use tracing::{debug, trace};

use crate::event::listener::{invoke_contained, ListenerRegistration};
use crate::event::Event;
use crate::extension::Extension;
use crate::orderer::OperationOrderer;
use crate::shared_state::{SharedState, SharedStateType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ContainerState {
    Uninitialized,
    Initializing,
    Registered,
    Unregistering,
    Removed,
}

/// An event paired with the hub sequence position it was dispatched at.
#[derive(Debug, Clone)]
pub(crate) struct SequencedEvent {
    pub position: u64,
    pub event: Arc<Event>,
}

pub struct ExtensionContainer {
    type_name: String,
    extension: OnceLock<Arc<dyn Extension>>,
    shared_state_name: OnceLock<String>,
    state: Mutex<ContainerState>,
    listeners: RwLock<Vec<ListenerRegistration>>,
    standard_state: OnceLock<SharedState>,
    xdm_state: OnceLock<SharedState>,
    events: OperationOrderer<SequencedEvent>,
    last_processed: AtomicU64,
}

impl ExtensionContainer {
    /// Creates an empty container with a stopped queue. Events enqueued before
    /// [`ExtensionContainer::install`] wait for it.
    pub(crate) fn new(type_name: &str) -> Arc<Self> {
        Arc::new_cyclic(|container: &Weak<ExtensionContainer>| {
            let events = OperationOrderer::new(type_name);
            let container = container.clone();
            events.set_handler(move |item: &SequencedEvent| match container.upgrade() {
                Some(container) => container.process(item),
                None => true,
            });
            Self {
                type_name: type_name.to_string(),
                extension: OnceLock::new(),
                shared_state_name: OnceLock::new(),
                state: Mutex::new(ContainerState::Uninitialized),
                listeners: RwLock::new(Vec::new()),
                standard_state: OnceLock::new(),
                xdm_state: OnceLock::new(),
                events,
                last_processed: AtomicU64::new(0),
            }
        })
    }

    /// Attaches the constructed extension, runs its registration hook and
    /// starts delivery.
    pub(crate) fn install(&self, extension: Arc<dyn Extension>) {
        let name = extension.name().to_string();
        let _ = self.standard_state.set(SharedState::new(&name));
        let _ = self.xdm_state.set(SharedState::new(&name));
        let _ = self.shared_state_name.set(name);
        let _ = self.extension.set(extension.clone());

        invoke_contained(self.name(), || extension.on_registered());
        self.set_state(ContainerState::Registered);
        self.events.start();
        debug!("Extension {} ({}) registered", self.name(), self.type_name);
    }

    /// Closes the queue, dropping whatever is still waiting in it. The
    /// unregistration hook runs on the container's task after the event in
    /// flight, if any, has been handled.
    pub(crate) fn teardown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ContainerState::Unregistering | ContainerState::Removed) {
                return;
            }
            *state = ContainerState::Unregistering;
        }
        let container = self.clone();
        self.events.close_with(move || container.finish_teardown());
    }

    fn finish_teardown(&self) {
        if let Some(extension) = self.extension.get() {
            invoke_contained(self.name(), || extension.on_unregistered());
        }
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_state(ContainerState::Removed);
        debug!("Extension {} removed", self.name());
    }

    fn process(&self, item: &SequencedEvent) -> bool {
        let Some(extension) = self.extension.get() else {
            return false;
        };
        if !extension.ready_for_event(&item.event) {
            trace!("{} not ready for event {}", self.name(), item.event.id());
            return false;
        }

        // snapshot so listeners may register more listeners
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners.iter().filter(|l| l.should_notify(&item.event)) {
            invoke_contained(self.name(), || listener.notify(&item.event));
        }

        self.last_processed.store(item.position, Ordering::SeqCst);
        true
    }

    /// Reserves `name` ahead of [`ExtensionContainer::install`]. `false` if a
    /// name was already set.
    pub(crate) fn claim_name(&self, name: &str) -> bool {
        self.shared_state_name.set(name.to_string()).is_ok()
    }

    pub(crate) fn enqueue(&self, item: SequencedEvent) {
        self.events.add(item);
    }

    pub(crate) fn register_listener(&self, registration: ListenerRegistration) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration);
    }

    pub(crate) fn set_state(&self, state: ContainerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn start_events(&self) {
        self.events.start();
    }

    pub fn stop_events(&self) {
        self.events.stop();
    }

    /// Shared state name once installed, the type name before.
    pub fn name(&self) -> &str {
        self.shared_state_name
            .get()
            .map(String::as_str)
            .unwrap_or(self.type_name.as_str())
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn shared_state_name(&self) -> Option<&str> {
        self.shared_state_name.get().map(String::as_str)
    }

    /// Case-insensitive shared state name comparison.
    pub fn matches_name(&self, name: &str) -> bool {
        self.shared_state_name()
            .is_some_and(|own| own.eq_ignore_ascii_case(name))
    }

    pub fn extension(&self) -> Option<Arc<dyn Extension>> {
        self.extension.get().cloned()
    }

    pub fn shared_state(&self, state_type: SharedStateType) -> Option<&SharedState> {
        match state_type {
            SharedStateType::Standard => self.standard_state.get(),
            SharedStateType::Xdm => self.xdm_state.get(),
        }
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sequence position of the last event this extension fully processed.
    pub fn last_processed_position(&self) -> u64 {
        self.last_processed.load(Ordering::SeqCst)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for ExtensionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContainer")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("last_processed", &self.last_processed_position())
            .finish()
    }
}
