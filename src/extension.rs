//! # Extensions
//!
//! An extension is a pluggable component living inside its own
//! [`ExtensionContainer`](crate::container::ExtensionContainer). It never sees
//! the hub directly: everything it can do goes through the
//! [`ExtensionRuntime`] handed to its constructor.
//!
//! ```rust,no_run
//! use extension_hub::event::{event_source, event_type, Event, EventData};
//! use extension_hub::extension::{Extension, ExtensionRuntime, ExtensionType};
//!
//! struct Greeter {
//!     runtime: ExtensionRuntime,
//! }
//!
//! impl Extension for Greeter {
//!     fn name(&self) -> &str {
//!         "com.example.greeter"
//!     }
//!
//!     fn version(&self) -> &str {
//!         "1.0.0"
//!     }
//!
//!     fn on_registered(&self) {
//!         let runtime = self.runtime.clone();
//!         self.runtime.register_listener(event_type::CUSTOM, event_source::REQUEST_CONTENT, move |event: &Event| {
//!             let mut data = EventData::new();
//!             data.insert("greeting".to_string(), serde_json::json!("hello"));
//!             runtime.dispatch(event.create_response_event(
//!                 "greeting",
//!                 event_type::CUSTOM,
//!                 event_source::RESPONSE_CONTENT,
//!                 Some(data),
//!             ));
//!         });
//!     }
//! }
//!
//! impl ExtensionType for Greeter {
//!     fn new(runtime: ExtensionRuntime) -> Option<Self> {
//!         Some(Greeter { runtime })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::warn;

use crate::container::ExtensionContainer;
use crate::event::listener::ListenerRegistration;
use crate::event::response::{ResponseListenerHandle, ResponseOutcome};
use crate::event::{Event, EventData};
use crate::hub::{EventHub, HubError, HubInner, HubResult};
use crate::shared_state::{
    SharedStateResolution, SharedStateResolver, SharedStateResult, SharedStateType,
};

pub trait Extension: Send + Sync + 'static {
    /// Unique name, also the key other extensions read shared state by.
    fn name(&self) -> &str;

    /// Human readable name published in the hub shared state.
    fn friendly_name(&self) -> &str {
        self.name()
    }

    fn version(&self) -> &str;

    fn metadata(&self) -> Option<HashMap<String, String>> {
        None
    }

    /// Called once the container is registered, before any event is delivered.
    fn on_registered(&self) {}

    fn on_unregistered(&self) {}

    /// Returning `false` holds `event` and everything behind it in this
    /// extension's queue until the next enqueue re-checks it.
    fn ready_for_event(&self, _event: &Event) -> bool {
        true
    }
}

/// Construction side of an extension.
pub trait ExtensionType: Extension + Sized {
    /// Builds the extension. `None` fails registration with
    /// [`HubError::ExtensionNotInitialized`].
    fn new(runtime: ExtensionRuntime) -> Option<Self>;

    /// Registry key; two registrations of the same type are rejected.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Handle through which an extension talks to the hub.
///
/// Holds weak references only: once the hub or the extension's container is
/// gone every call becomes a logged no-op.
#[derive(Clone)]
pub struct ExtensionRuntime {
    hub: Weak<HubInner>,
    container: Weak<ExtensionContainer>,
}

impl ExtensionRuntime {
    pub(crate) fn new(hub: Weak<HubInner>, container: Weak<ExtensionContainer>) -> Self {
        Self { hub, container }
    }

    fn hub(&self) -> Option<EventHub> {
        let hub = self.hub.upgrade().map(EventHub::from_inner);
        if hub.is_none() {
            warn!("ExtensionRuntime used after the event hub was dropped");
        }
        hub
    }

    fn container(&self) -> Option<Arc<ExtensionContainer>> {
        self.container.upgrade()
    }

    /// Name shared state is published under; unknown until the constructor
    /// has returned.
    fn owner(&self) -> HubResult<(EventHub, String)> {
        let hub = self.hub().ok_or(HubError::HubShutDown)?;
        let container = self.container().ok_or(HubError::HubShutDown)?;
        let name = container
            .shared_state_name()
            .ok_or_else(|| HubError::ExtensionNotInitialized {
                name: container.type_name().to_string(),
                reason: "shared state is available from on_registered on".to_string(),
            })?;
        Ok((hub, name.to_string()))
    }

    /// Registers a listener on this extension's queue.
    pub fn register_listener<F>(&self, event_type: &str, source: &str, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        match self.container() {
            Some(container) => container.register_listener(ListenerRegistration::new(
                event_type,
                source,
                Arc::new(listener),
            )),
            None => warn!("Listener for {}/{} dropped, container is gone", event_type, source),
        }
    }

    pub fn register_response_listener<F>(
        &self,
        trigger: &Event,
        timeout: Duration,
        listener: F,
    ) -> Option<ResponseListenerHandle>
    where
        F: FnOnce(ResponseOutcome) + Send + 'static,
    {
        self.hub()
            .map(|hub| hub.register_response_listener(trigger, timeout, listener))
    }

    /// Returns the sequence position assigned to `event`.
    pub fn dispatch(&self, event: Event) -> Option<u64> {
        self.hub().and_then(|hub| hub.dispatch(event))
    }

    pub fn create_shared_state(&self, data: EventData, event: Option<&Event>) -> HubResult<()> {
        let (hub, name) = self.owner()?;
        hub.create_state(&name, SharedStateType::Standard, data, event)
    }

    pub fn create_pending_shared_state(&self, event: Option<&Event>) -> HubResult<SharedStateResolver> {
        let (hub, name) = self.owner()?;
        hub.create_pending_state(&name, SharedStateType::Standard, event)
    }

    pub fn create_xdm_shared_state(&self, data: EventData, event: Option<&Event>) -> HubResult<()> {
        let (hub, name) = self.owner()?;
        hub.create_state(&name, SharedStateType::Xdm, data, event)
    }

    pub fn create_pending_xdm_shared_state(
        &self,
        event: Option<&Event>,
    ) -> HubResult<SharedStateResolver> {
        let (hub, name) = self.owner()?;
        hub.create_pending_state(&name, SharedStateType::Xdm, event)
    }

    /// Reads another extension's state as of `event`.
    pub fn get_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        self.hub().and_then(|hub| {
            hub.get_state(extension_name, SharedStateType::Standard, event, barrier, resolution)
        })
    }

    pub fn get_xdm_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        self.hub().and_then(|hub| {
            hub.get_state(extension_name, SharedStateType::Xdm, event, barrier, resolution)
        })
    }

    /// Resumes delivery to this extension.
    pub fn start_events(&self) {
        if let Some(container) = self.container() {
            container.start_events();
        }
    }

    /// Pauses delivery; events keep queueing.
    pub fn stop_events(&self) {
        if let Some(container) = self.container() {
            container.stop_events();
        }
    }

    pub fn unregister_extension(&self) -> HubResult<()> {
        let (hub, name) = self.owner()?;
        hub.unregister_extension(&name)
    }
}

impl fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .container
            .upgrade()
            .map(|c| c.name().to_string())
            .unwrap_or_default();
        f.debug_struct("ExtensionRuntime").field("extension", &name).finish()
    }
}
