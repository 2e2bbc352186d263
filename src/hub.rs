//! # Event Hub
//!
//! Central dispatcher. Every event gets a monotonically increasing sequence
//! position and goes through a single hub queue whose consumer:
//!
//! 1. applies registered preprocessors
//! 2. fires response listeners waiting on the event's trigger
//! 3. records it in the bounded history
//! 4. enqueues it on every registered extension container
//!
//! Since the fan-out step has exactly one consumer, all containers observe
//! events in the same relative order, and that order matches the sequence
//! positions shared state versions are keyed by.
//!
//! The hub registers a placeholder extension of its own (named
//! [`hub_constants::NAME`]). It holds hub level listeners and publishes the
//! list of registered extensions as shared state.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::container::{ContainerState, ExtensionContainer, SequencedEvent};
use crate::event::listener::{invoke_contained, ListenerRegistration};
use crate::event::response::{ResponseListenerHandle, ResponseListeners, ResponseOutcome};
use crate::event::{debug_event, event_source, event_type, Event, EventData};
use crate::extension::{Extension, ExtensionRuntime, ExtensionType};
use crate::orderer::OperationOrderer;
use crate::shared_state::{
    SharedState, SharedStateError, SharedStateResolution, SharedStateResolver, SharedStateResult,
    SharedStateStatus, SharedStateType,
};

pub mod hub_constants {
    pub const NAME: &str = "com.extensionhub.eventhub";
    pub const FRIENDLY_NAME: &str = "EventHub";
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const STATE_CHANGE: &str = "Shared state change";
    pub const XDM_STATE_CHANGE: &str = "Shared state change (XDM)";

    pub mod keys {
        pub const STATE_OWNER: &str = "stateowner";
        pub const VERSION: &str = "version";
        pub const EXTENSIONS: &str = "extensions";
        pub const METADATA: &str = "metadata";
    }
}

/// Rewrites an event before delivery. Keep the event id (see
/// [`Event::copy_with_new_data`]) or response correlation breaks.
pub type EventPreprocessor = Arc<dyn Fn(Event) -> Event + Send + Sync>;

struct HubPlaceholder;

impl Extension for HubPlaceholder {
    fn name(&self) -> &str {
        hub_constants::NAME
    }

    fn friendly_name(&self) -> &str {
        hub_constants::FRIENDLY_NAME
    }

    fn version(&self) -> &str {
        hub_constants::VERSION
    }
}

/// Last assigned position plus the ids of the events still resolvable to
/// their position, oldest first.
#[derive(Default)]
struct Sequence {
    position: u64,
    recent: VecDeque<Uuid>,
}

pub(crate) struct HubInner {
    config: HubConfig,
    sequence: Mutex<Sequence>,
    event_numbers: DashMap<Uuid, u64>,
    event_queue: OperationOrderer<SequencedEvent>,
    registry: RwLock<Vec<Arc<ExtensionContainer>>>,
    hub_container: Arc<ExtensionContainer>,
    response_listeners: ResponseListeners,
    preprocessors: RwLock<Vec<EventPreprocessor>>,
    history: Mutex<VecDeque<Event>>,
    shut_down: AtomicBool,
}

impl HubInner {
    fn process(&self, item: &SequencedEvent) -> bool {
        let event = self.preprocess(&item.event);

        if event.is_response() {
            self.response_listeners.handle_event(&event);
        }
        self.record(&event);

        let containers = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for container in containers {
            container.enqueue(SequencedEvent {
                position: item.position,
                event: event.clone(),
            });
        }
        true
    }

    fn preprocess(&self, event: &Arc<Event>) -> Arc<Event> {
        let preprocessors = self
            .preprocessors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if preprocessors.is_empty() {
            return event.clone();
        }
        let mut current = (**event).clone();
        for preprocessor in preprocessors.iter() {
            let input = current.clone();
            let mut output = None;
            invoke_contained(hub_constants::NAME, || output = Some(preprocessor(input)));
            match output {
                Some(processed) => current = processed,
                None => warn!("Preprocessor failed on event {}, passing it on unchanged", current.id()),
            }
        }
        Arc::new(current)
    }

    fn record(&self, event: &Event) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    fn current_position(&self) -> u64 {
        self.sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .position
    }

    fn next_position(&self) -> u64 {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        sequence.position += 1;
        sequence.position
    }

    /// Assigns the next position to `id`, forgetting the oldest ids beyond
    /// `event_number_capacity`. Runs under the sequence lock.
    fn number(&self, sequence: &mut Sequence, id: Uuid) -> u64 {
        sequence.position += 1;
        let capacity = self.config.event_number_capacity;
        if capacity > 0 {
            self.event_numbers.insert(id, sequence.position);
            sequence.recent.push_back(id);
            while sequence.recent.len() > capacity {
                if let Some(expired) = sequence.recent.pop_front() {
                    self.event_numbers.remove(&expired);
                }
            }
        }
        sequence.position
    }

    fn event_number(&self, event: &Event) -> Option<u64> {
        self.event_numbers.get(&event.id()).map(|number| *number)
    }
}

/// # EventHub
///
/// Cheap to clone; every clone drives the same hub. Must be created inside a
/// tokio runtime.
///
/// ## Example
///
/// ```rust,no_run
/// use extension_hub::event::{event_source, event_type, Event};
/// use extension_hub::{EventHub, HubConfig};
///
/// # async fn run() {
/// let hub = EventHub::new(HubConfig::default());
/// hub.register_event_listener(event_type::WILDCARD, event_source::WILDCARD, |event: &Event| {
///     println!("observed {}", event);
/// });
/// hub.start();
/// hub.dispatch(Event::new("hello", event_type::CUSTOM, event_source::NONE, None));
/// # }
/// ```
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        let hub_container = ExtensionContainer::new(hub_constants::NAME);
        hub_container.install(Arc::new(HubPlaceholder));

        let inner = Arc::new(HubInner {
            config,
            sequence: Mutex::new(Sequence::default()),
            event_numbers: DashMap::new(),
            event_queue: OperationOrderer::new("EventHub"),
            registry: RwLock::new(vec![hub_container.clone()]),
            hub_container,
            response_listeners: ResponseListeners::new(),
            preprocessors: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            shut_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .event_queue
            .set_handler(move |item: &SequencedEvent| match weak.upgrade() {
                Some(inner) => inner.process(item),
                None => true,
            });

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Starts delivering events. Events dispatched before are retained and
    /// delivered in order.
    #[instrument(skip(self), level = "debug")]
    pub fn start(&self) {
        self.inner.event_queue.start();
        self.share_hub_shared_state();
        info!("Event hub started");
    }

    /// Assigns the next sequence position to `event` and queues it for
    /// delivery. Returns `None` once the hub has shut down.
    pub fn dispatch(&self, event: Event) -> Option<u64> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            warn!("Dropping event {} dispatched after shutdown", event.id());
            return None;
        }
        debug_event("Dispatching", &event);

        let mut sequence = self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let position = self.inner.number(&mut sequence, event.id());
        self.inner.event_queue.add(SequencedEvent {
            position,
            event: Arc::new(event),
        });
        Some(position)
    }

    /// Constructs extension `E` in a fresh container and starts delivering
    /// events to it.
    #[instrument(skip(self), level = "debug", fields(extension = E::type_name()))]
    pub async fn register_extension<E: ExtensionType>(&self) -> HubResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(HubError::HubShutDown);
        }
        let type_name = E::type_name();
        if type_name.is_empty() {
            return Err(HubError::InvalidExtensionName);
        }

        let container = {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if registry.iter().any(|c| c.type_name() == type_name) {
                warn!("Extension {} is already registered", type_name);
                return Err(HubError::DuplicateExtensionName {
                    name: type_name.to_string(),
                });
            }
            let container = ExtensionContainer::new(type_name);
            container.set_state(ContainerState::Initializing);
            registry.push(container.clone());
            container
        };

        let runtime = ExtensionRuntime::new(Arc::downgrade(&self.inner), Arc::downgrade(&container));
        let mut init = tokio::spawn(async move { E::new(runtime) });
        let extension = match tokio::time::timeout(self.inner.config.init_timeout, &mut init).await {
            Ok(Ok(Some(extension))) => extension,
            Ok(Ok(None)) => {
                return self.abort_registration(&container, "constructor returned None");
            }
            Ok(Err(e)) => {
                return self.abort_registration(&container, &format!("constructor failed: {}", e));
            }
            Err(_) => {
                init.abort();
                return self.abort_registration(&container, "constructor timed out");
            }
        };

        let name = extension.name().to_string();
        if name.is_empty() {
            self.remove_container(&container);
            return Err(HubError::InvalidExtensionName);
        }
        // check and claim under one write lock
        let name_taken = {
            let registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let taken = registry
                .iter()
                .any(|c| !Arc::ptr_eq(c, &container) && c.matches_name(&name));
            taken || !container.claim_name(&name)
        };
        if name_taken {
            self.remove_container(&container);
            warn!("Extension name {} is already in use", name);
            return Err(HubError::DuplicateExtensionName { name });
        }

        container.install(Arc::new(extension));
        self.share_hub_shared_state();
        info!("Extension {} registered", name);
        Ok(())
    }

    fn abort_registration(&self, container: &Arc<ExtensionContainer>, reason: &str) -> HubResult<()> {
        self.remove_container(container);
        error!("Extension {} not initialized: {}", container.type_name(), reason);
        Err(HubError::ExtensionNotInitialized {
            name: container.type_name().to_string(),
            reason: reason.to_string(),
        })
    }

    fn remove_container(&self, container: &Arc<ExtensionContainer>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| !Arc::ptr_eq(c, container));
        container.teardown();
    }

    /// Removes the named extension. Events still queued for it are dropped.
    #[instrument(skip(self), level = "debug")]
    pub fn unregister_extension(&self, name: &str) -> HubResult<()> {
        let container = {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let index = registry
                .iter()
                .position(|c| c.matches_name(name))
                .ok_or_else(|| HubError::ExtensionNotRegistered {
                    name: name.to_string(),
                })?;
            if Arc::ptr_eq(&registry[index], &self.inner.hub_container) {
                return Err(HubError::InvalidExtensionName);
            }
            registry.remove(index)
        };

        container.teardown();
        self.share_hub_shared_state();
        info!("Extension {} unregistered", name);
        Ok(())
    }

    /// Fires `listener` once, with the first response to `trigger` or with
    /// [`ResponseOutcome::TimedOut`].
    pub fn register_response_listener<F>(
        &self,
        trigger: &Event,
        timeout: Duration,
        listener: F,
    ) -> ResponseListenerHandle
    where
        F: FnOnce(ResponseOutcome) + Send + 'static,
    {
        self.inner
            .response_listeners
            .register(trigger, timeout, Box::new(listener))
    }

    /// [`EventHub::register_response_listener`] with the configured default
    /// timeout.
    pub fn register_response_listener_default<F>(
        &self,
        trigger: &Event,
        listener: F,
    ) -> ResponseListenerHandle
    where
        F: FnOnce(ResponseOutcome) + Send + 'static,
    {
        self.register_response_listener(trigger, self.inner.config.default_response_timeout, listener)
    }

    /// Hub level listener, run on the placeholder extension's queue.
    pub fn register_event_listener<F>(&self, event_type: &str, source: &str, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner
            .hub_container
            .register_listener(ListenerRegistration::new(event_type, source, Arc::new(listener)));
    }

    /// Preprocessors run in registration order on the hub queue before
    /// any listener sees the event.
    pub fn register_preprocessor<F>(&self, preprocessor: F)
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.inner
            .preprocessors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(preprocessor));
    }

    pub fn create_shared_state(
        &self,
        extension_name: &str,
        data: EventData,
        event: Option<&Event>,
    ) -> HubResult<()> {
        self.create_state(extension_name, SharedStateType::Standard, data, event)
    }

    pub fn create_pending_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
    ) -> HubResult<SharedStateResolver> {
        self.create_pending_state(extension_name, SharedStateType::Standard, event)
    }

    pub fn create_xdm_shared_state(
        &self,
        extension_name: &str,
        data: EventData,
        event: Option<&Event>,
    ) -> HubResult<()> {
        self.create_state(extension_name, SharedStateType::Xdm, data, event)
    }

    pub fn create_pending_xdm_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
    ) -> HubResult<SharedStateResolver> {
        self.create_pending_state(extension_name, SharedStateType::Xdm, event)
    }

    /// Reads `extension_name`'s state as of `event`, or as of the latest
    /// dispatched event when `event` is `None`.
    pub fn get_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        self.get_state(extension_name, SharedStateType::Standard, event, barrier, resolution)
    }

    pub fn get_xdm_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        self.get_state(extension_name, SharedStateType::Xdm, event, barrier, resolution)
    }

    #[instrument(skip(self, data, event), level = "debug")]
    pub(crate) fn create_state(
        &self,
        extension_name: &str,
        state_type: SharedStateType,
        data: EventData,
        event: Option<&Event>,
    ) -> HubResult<()> {
        let container = self.find_container(extension_name)?;
        let store = Self::store(&container, state_type)?;
        let version = self.version_for(store, event);
        store.set(version, data)?;
        debug!(
            "{} shared state of {} set at version {}",
            state_type, extension_name, version
        );
        self.dispatch_state_change(container.name(), state_type);
        Ok(())
    }

    #[instrument(skip(self, event), level = "debug")]
    pub(crate) fn create_pending_state(
        &self,
        extension_name: &str,
        state_type: SharedStateType,
        event: Option<&Event>,
    ) -> HubResult<SharedStateResolver> {
        let container = self.find_container(extension_name)?;
        let store = Self::store(&container, state_type)?;
        let version = self.version_for(store, event);
        store.set_pending(version)?;
        debug!(
            "{} shared state of {} pending at version {}",
            state_type, extension_name, version
        );
        self.dispatch_state_change(container.name(), state_type);

        let hub = Arc::downgrade(&self.inner);
        let owner = container.name().to_string();
        let label = owner.clone();
        Ok(SharedStateResolver::new(&label, version, move |data| {
            if let Some(inner) = hub.upgrade() {
                EventHub::from_inner(inner).resolve_pending_state(&owner, state_type, version, data);
            }
        }))
    }

    fn resolve_pending_state(
        &self,
        extension_name: &str,
        state_type: SharedStateType,
        version: u64,
        data: Option<EventData>,
    ) {
        let resolved = self
            .find_container(extension_name)
            .and_then(|container| {
                Self::store(&container, state_type)?.resolve_pending(version, data)?;
                Ok(container)
            });
        match resolved {
            Ok(container) => self.dispatch_state_change(container.name(), state_type),
            Err(e) => warn!("Failed to resolve pending shared state: {}", e),
        }
    }

    pub(crate) fn get_state(
        &self,
        extension_name: &str,
        state_type: SharedStateType,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(index) = registry.iter().position(|c| c.matches_name(extension_name)) else {
            debug!("No extension named {} to read shared state from", extension_name);
            return None;
        };
        let container = &registry[index];
        let store = container.shared_state(state_type)?;

        let position = event
            .and_then(|event| self.inner.event_number(event))
            .unwrap_or_else(|| self.inner.current_position());
        let result = store.resolve_with(position, resolution);

        if barrier {
            let owner_behind = container.last_processed_position() + 1 < position;
            if owner_behind && result.status == SharedStateStatus::Set {
                return Some(SharedStateResult::pending());
            }
            let dependency_pending = registry[..index].iter().any(|earlier| {
                earlier
                    .shared_state(state_type)
                    .is_some_and(|s| s.resolve(position).status == SharedStateStatus::Pending)
            });
            if dependency_pending {
                return Some(SharedStateResult::pending());
            }
        }
        Some(result)
    }

    /// Position of the dispatched `event`, no event yields a fresh one unless
    /// the store is still empty.
    fn version_for(&self, store: &SharedState, event: Option<&Event>) -> u64 {
        if let Some(position) = event.and_then(|event| self.inner.event_number(event)) {
            return position;
        }
        if store.is_empty() {
            0
        } else {
            self.inner.next_position()
        }
    }

    fn store(container: &ExtensionContainer, state_type: SharedStateType) -> HubResult<&SharedState> {
        container
            .shared_state(state_type)
            .ok_or_else(|| HubError::ExtensionNotInitialized {
                name: container.name().to_string(),
                reason: "extension has no shared state yet".to_string(),
            })
    }

    fn find_container(&self, name: &str) -> HubResult<Arc<ExtensionContainer>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.matches_name(name))
            .cloned()
            .ok_or_else(|| HubError::ExtensionNotRegistered {
                name: name.to_string(),
            })
    }

    fn dispatch_state_change(&self, owner: &str, state_type: SharedStateType) {
        let name = match state_type {
            SharedStateType::Standard => hub_constants::STATE_CHANGE,
            SharedStateType::Xdm => hub_constants::XDM_STATE_CHANGE,
        };
        let mut data = EventData::new();
        data.insert(hub_constants::keys::STATE_OWNER.to_string(), json!(owner));
        self.dispatch(Event::new(
            name,
            event_type::HUB,
            event_source::SHARED_STATE,
            Some(data),
        ));
    }

    /// Publishes the registered extensions as the hub's own shared state.
    fn share_hub_shared_state(&self) {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut extensions = Map::new();
        for container in registry
            .iter()
            .filter(|c| !Arc::ptr_eq(c, &self.inner.hub_container))
            .filter(|c| c.state() == ContainerState::Registered)
        {
            let Some(extension) = container.extension() else {
                continue;
            };
            let mut entry = Map::new();
            entry.insert(
                hub_constants::keys::VERSION.to_string(),
                json!(extension.version()),
            );
            if let Some(metadata) = extension.metadata() {
                entry.insert(hub_constants::keys::METADATA.to_string(), json!(metadata));
            }
            extensions.insert(extension.friendly_name().to_string(), Value::Object(entry));
        }

        let mut data = EventData::new();
        data.insert(
            hub_constants::keys::VERSION.to_string(),
            json!(hub_constants::VERSION),
        );
        data.insert(
            hub_constants::keys::EXTENSIONS.to_string(),
            Value::Object(extensions),
        );

        if let Err(e) = self.create_state(hub_constants::NAME, SharedStateType::Standard, data, None) {
            warn!("Failed to share event hub state: {}", e);
        }
    }

    /// Most recently processed events, oldest first.
    pub fn event_history(&self) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Shared state names of every registered extension, hub included, in
    /// registration order.
    pub fn registered_extensions(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|c| c.shared_state_name().map(str::to_string))
            .collect()
    }

    pub fn extension_state(&self, name: &str) -> Option<ContainerState> {
        self.find_container(name).ok().map(|c| c.state())
    }

    pub fn last_processed_position(&self, name: &str) -> Option<u64> {
        self.find_container(name)
            .ok()
            .map(|c| c.last_processed_position())
    }

    /// Sequence position `event` was dispatched at, while it is among the
    /// last `event_number_capacity` dispatched events.
    pub fn event_number(&self, event: &Event) -> Option<u64> {
        self.inner.event_number(event)
    }

    /// Unregisters every extension in reverse registration order, cancels
    /// waiting response listeners and closes the hub queue.
    #[instrument(skip(self), level = "debug")]
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let containers: Vec<_> = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .rev()
            .collect();
        for container in &containers {
            container.teardown();
        }
        self.inner.event_queue.close();
        let cancelled = self.inner.response_listeners.cancel_all();
        info!(
            "Event hub shut down, {} extensions removed, {} response listeners cancelled",
            containers.len(),
            cancelled
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("position", &self.inner.current_position())
            .field("extensions", &self.registered_extensions())
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Extension {name} is already registered")]
    DuplicateExtensionName { name: String },
    #[error("Extension {name} failed to initialize: {reason}")]
    ExtensionNotInitialized { name: String, reason: String },
    #[error("Invalid extension name")]
    InvalidExtensionName,
    #[error("Extension {name} is not registered")]
    ExtensionNotRegistered { name: String },
    #[error("Event hub has shut down")]
    HubShutDown,
    #[error("Shared state error: {0}")]
    SharedState(#[from] SharedStateError),
}

pub type HubResult<T> = Result<T, HubError>;

/// Metadata map helper for [`Extension::metadata`] implementations.
pub fn metadata<I, K, V>(entries: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_until;
    use pretty_assertions::assert_eq;

    fn hub_with_history(capacity: usize) -> EventHub {
        EventHub::new(HubConfig {
            history_capacity: capacity,
            ..HubConfig::default()
        })
    }

    fn custom(name: &str) -> Event {
        Event::new(name, event_type::CUSTOM, event_source::NONE, None)
    }

    fn custom_history(hub: &EventHub) -> Vec<String> {
        hub.event_history()
            .iter()
            .filter(|e| e.event_type() == event_type::CUSTOM)
            .map(|e| e.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_assigns_increasing_positions() {
        let hub = EventHub::new(HubConfig::default());
        let first = custom("a");
        let second = custom("b");
        let p1 = hub.dispatch(first.clone()).unwrap();
        let p2 = hub.dispatch(second.clone()).unwrap();

        assert!(p2 > p1);
        assert_eq!(hub.event_number(&first), Some(p1));
        assert_eq!(hub.event_number(&second), Some(p2));
        assert_eq!(hub.event_number(&custom("never dispatched")), None);
    }

    #[tokio::test]
    async fn test_event_numbers_are_bounded() {
        let hub = EventHub::new(HubConfig {
            history_capacity: 1,
            event_number_capacity: 3,
            ..HubConfig::default()
        });
        let events: Vec<Event> = (0..5).map(|i| custom(&i.to_string())).collect();
        let positions: Vec<u64> = events
            .iter()
            .map(|event| hub.dispatch(event.clone()).unwrap())
            .collect();

        assert_eq!(hub.event_number(&events[0]), None);
        assert_eq!(hub.event_number(&events[1]), None);
        for (event, position) in events.iter().zip(&positions).skip(2) {
            assert_eq!(hub.event_number(event), Some(*position));
        }
        assert_eq!(hub.inner.event_numbers.len(), 3);
    }

    #[tokio::test]
    async fn test_events_wait_for_start() {
        let hub = hub_with_history(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.register_event_listener(event_type::CUSTOM, event_source::WILDCARD, move |e: &Event| {
            sink.lock().unwrap().push(e.name().to_string());
        });

        hub.dispatch(custom("before start"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().unwrap().is_empty());

        hub.start();
        hub.dispatch(custom("after start"));
        assert!(wait_until(|| seen.lock().unwrap().len() == 2).await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["before start".to_string(), "after start".to_string()]
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let hub = hub_with_history(3);
        hub.start();
        // let the hub state event from start drain first
        assert!(wait_until(|| !hub.event_history().is_empty()).await);
        for name in ["1", "2", "3", "4", "5"] {
            hub.dispatch(custom(name));
        }
        assert!(wait_until(|| custom_history(&hub) == vec!["3", "4", "5"]).await);
        assert_eq!(hub.event_history().len(), 3);
    }

    #[tokio::test]
    async fn test_preprocessors_run_in_order_and_keep_identity() {
        let hub = hub_with_history(10);
        hub.register_preprocessor(|event: Event| {
            let mut data = event.data().cloned().unwrap_or_default();
            data.insert("trail".to_string(), json!("a"));
            event.copy_with_new_data(Some(data))
        });
        hub.register_preprocessor(|event: Event| {
            let mut data = event.data().cloned().unwrap_or_default();
            let trail = format!("{}b", data["trail"].as_str().unwrap_or_default());
            data.insert("trail".to_string(), json!(trail));
            event.copy_with_new_data(Some(data))
        });
        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();
        hub.register_event_listener(event_type::CUSTOM, event_source::NONE, move |e: &Event| {
            *sink.lock().unwrap() = Some(e.clone());
        });
        hub.start();

        let original = custom("rewritten");
        hub.dispatch(original.clone());
        assert!(wait_until(|| received.lock().unwrap().is_some()).await);

        let received = received.lock().unwrap().clone().unwrap();
        assert_eq!(received.id(), original.id());
        assert_eq!(received.value("trail"), Some(&json!("ab")));
    }

    #[tokio::test]
    async fn test_panicking_preprocessor_is_skipped() {
        let hub = hub_with_history(10);
        hub.register_preprocessor(|_event: Event| -> Event { panic!("broken preprocessor") });
        hub.register_preprocessor(|event: Event| {
            let mut data = event.data().cloned().unwrap_or_default();
            data.insert("seen".to_string(), json!(true));
            event.copy_with_new_data(Some(data))
        });
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        hub.register_event_listener(event_type::CUSTOM, event_source::NONE, move |e: &Event| {
            sink.lock().unwrap().push(e.clone());
        });
        hub.start();

        let first = custom("first");
        hub.dispatch(first.clone());
        hub.dispatch(custom("second"));
        assert!(wait_until(|| received.lock().unwrap().len() == 2).await);

        let received = received.lock().unwrap().clone();
        assert_eq!(received[0].id(), first.id());
        assert_eq!(received[0].value("seen"), Some(&json!(true)));
        assert_eq!(received[1].name(), "second");
    }

    #[tokio::test]
    async fn test_hub_shared_state_lists_extensions() {
        let hub = EventHub::new(HubConfig::default());
        hub.start();

        let state = hub
            .get_shared_state(hub_constants::NAME, None, false, SharedStateResolution::Any)
            .unwrap();
        assert_eq!(state.status, SharedStateStatus::Set);
        let data = state.value.unwrap();
        assert_eq!(data[hub_constants::keys::VERSION], json!(hub_constants::VERSION));
        assert_eq!(data[hub_constants::keys::EXTENSIONS], json!({}));
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let hub = EventHub::new(HubConfig::default());
        assert_eq!(
            hub.unregister_extension("missing"),
            Err(HubError::ExtensionNotRegistered {
                name: "missing".to_string()
            })
        );
        assert_eq!(
            hub.unregister_extension(hub_constants::NAME),
            Err(HubError::InvalidExtensionName)
        );
        assert!(hub
            .get_shared_state("missing", None, false, SharedStateResolution::Any)
            .is_none());
        assert!(hub.create_shared_state("missing", EventData::new(), None).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_rejects() {
        let hub = EventHub::new(HubConfig::default());
        hub.start();
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        hub.register_response_listener(&custom("trigger"), Duration::from_secs(5), move |o| {
            *sink.lock().unwrap() = Some(o);
        });

        hub.shutdown();
        assert!(hub.is_shut_down());
        assert_eq!(*outcome.lock().unwrap(), Some(ResponseOutcome::Cancelled));
        assert_eq!(hub.dispatch(custom("late")), None);
        assert!(hub.registered_extensions().is_empty());
    }
}
