//! # Event Model
//!
//! Events are the only currency extensions exchange through the hub. An
//! [`Event`] carries a free-form `type`/`source` tag pair that listeners match
//! against, an optional ordered data map, and optional correlation identifiers
//! linking it to a prior event.
//!
//! ## Correlation
//!
//! - `response_id`: set by [`Event::create_response_event`]; response
//!   listeners registered for the trigger event fire when an event carrying
//!   this id is dispatched.
//! - `parent_id`: set by both response and chained events, describing the
//!   logical chain of events for diagnostics.
//!
//! Events are immutable once built. Preprocessors that need to rewrite the
//! payload go through [`Event::copy_with_new_data`], which keeps identity.

pub mod listener;
pub mod response;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Ordered, string-keyed event payload.
pub type EventData = BTreeMap<String, Value>;

/// Well known event types.
pub mod event_type {
    pub const HUB: &str = "eventhub.type.hub";
    pub const CONFIGURATION: &str = "eventhub.type.configuration";
    pub const LIFECYCLE: &str = "eventhub.type.lifecycle";
    pub const IDENTITY: &str = "eventhub.type.identity";
    pub const GENERIC_TRACK: &str = "eventhub.type.generic.track";
    pub const CUSTOM: &str = "eventhub.type.custom";
    /// Matches every event type when used in a listener registration.
    pub const WILDCARD: &str = "eventhub.type._wildcard_";
}

/// Well known event sources.
pub mod event_source {
    pub const NONE: &str = "eventhub.source.none";
    pub const BOOTED: &str = "eventhub.source.booted";
    pub const REQUEST_CONTENT: &str = "eventhub.source.requestContent";
    pub const RESPONSE_CONTENT: &str = "eventhub.source.responseContent";
    pub const REQUEST_RESET: &str = "eventhub.source.requestReset";
    pub const SHARED_STATE: &str = "eventhub.source.sharedState";
    /// Matches every event source when used in a listener registration.
    pub const WILDCARD: &str = "eventhub.source._wildcard_";
}

/// # Event
///
/// Immutable message dispatched through the hub.
///
/// ## Example
///
/// ```rust
/// use extension_hub::event::{event_source, event_type, Event, EventData};
///
/// let mut data = EventData::new();
/// data.insert("action".to_string(), serde_json::json!("login"));
/// let request = Event::new("track", event_type::GENERIC_TRACK, event_source::REQUEST_CONTENT, Some(data));
/// let response = request.create_response_event(
///     "track response",
///     event_type::GENERIC_TRACK,
///     event_source::RESPONSE_CONTENT,
///     None,
/// );
/// assert_eq!(response.response_id(), Some(request.id()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<EventData>,
    timestamp: DateTime<Utc>,
    #[serde(rename = "responseID", default, skip_serializing_if = "Option::is_none")]
    response_id: Option<Uuid>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<Uuid>,
}

impl Event {
    pub fn new(name: &str, event_type: &str, source: &str, data: Option<EventData>) -> Self {
        Self {
            name: name.to_string(),
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            data,
            timestamp: Utc::now(),
            response_id: None,
            parent_id: None,
        }
    }

    /// Creates an event answering `self`; response listeners registered for
    /// `self` fire when it is dispatched.
    pub fn create_response_event(
        &self,
        name: &str,
        event_type: &str,
        source: &str,
        data: Option<EventData>,
    ) -> Event {
        let mut response = Event::new(name, event_type, source, data);
        response.response_id = Some(self.id);
        response.parent_id = Some(self.id);
        response
    }

    /// Creates an event logically following `self` without answering it.
    pub fn create_chained_event(
        &self,
        name: &str,
        event_type: &str,
        source: &str,
        data: Option<EventData>,
    ) -> Event {
        let mut chained = Event::new(name, event_type, source, data);
        chained.parent_id = Some(self.id);
        chained
    }

    /// Same event identity with a different payload.
    pub fn copy_with_new_data(&self, data: Option<EventData>) -> Event {
        Event {
            data,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn response_id(&self) -> Option<Uuid> {
        self.response_id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn is_response(&self) -> bool {
        self.response_id.is_some()
    }

    /// Looks up a single payload value.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }

    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> EventResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id: {}, name: {}, type: {}, source: {}, responseId: {:?}]",
            self.id, self.name, self.event_type, self.source, self.response_id
        )
    }
}

/// Hub bookkeeping events are noisy; keep them at trace level.
pub fn debug_event(prefix: &str, event: &Event) {
    if event.event_type == event_type::HUB {
        trace!("{} Event: {}", prefix, event);
    } else {
        debug!("{} Event: {}", prefix, event);
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_data() -> EventData {
        let mut data = EventData::new();
        data.insert("k".to_string(), json!("v"));
        data.insert("count".to_string(), json!(3));
        data
    }

    #[test]
    fn test_response_event_correlates_to_trigger() {
        let trigger = Event::new("req", event_type::CUSTOM, event_source::REQUEST_CONTENT, None);
        let response =
            trigger.create_response_event("res", event_type::CUSTOM, event_source::RESPONSE_CONTENT, None);

        assert_eq!(response.response_id(), Some(trigger.id()));
        assert_eq!(response.parent_id(), Some(trigger.id()));
        assert_ne!(response.id(), trigger.id());
        assert!(response.is_response());
        assert!(!trigger.is_response());
    }

    #[test]
    fn test_chained_event_is_not_a_response() {
        let first = Event::new("first", event_type::CUSTOM, event_source::NONE, None);
        let chained = first.create_chained_event("second", event_type::CUSTOM, event_source::NONE, None);

        assert_eq!(chained.parent_id(), Some(first.id()));
        assert_eq!(chained.response_id(), None);
    }

    #[test]
    fn test_copy_with_new_data_keeps_identity() {
        let event = Event::new("e", event_type::CUSTOM, event_source::NONE, Some(sample_data()));
        let copy = event.copy_with_new_data(None);

        assert_eq!(copy.id(), event.id());
        assert_eq!(copy.timestamp(), event.timestamp());
        assert_eq!(copy.data(), None);
        assert_eq!(event.value("k"), Some(&json!("v")));
    }

    #[test]
    fn test_wire_shape_uses_camel_case_correlation_keys() {
        let trigger = Event::new("req", event_type::CUSTOM, event_source::REQUEST_CONTENT, None);
        let response = trigger.create_response_event(
            "res",
            event_type::CUSTOM,
            event_source::RESPONSE_CONTENT,
            Some(sample_data()),
        );

        let json: Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], json!(event_type::CUSTOM));
        assert_eq!(json["responseID"], json!(trigger.id().to_string()));
        assert_eq!(json["data"]["k"], json!("v"));

        let decoded = Event::from_json(&response.to_json().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Event::from_json("{\"name\": 1}"),
            Err(EventError::Serialization(_))
        ));
    }
}
