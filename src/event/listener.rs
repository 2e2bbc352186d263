use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use super::{event_source, event_type, Event};

/// Callback invoked for every matching event on the owning container's task.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// What a listener is bound to.
///
/// Standard listeners match on the `(type, source)` pair, where either side
/// may be a wildcard. Response listeners match a single trigger event id.
/// Response events (events carrying a `response_id`) only reach standard
/// listeners that are wildcard on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMatcher {
    Standard { event_type: String, source: String },
    Response { trigger_id: Uuid },
}

impl ListenerMatcher {
    pub fn standard(event_type: &str, source: &str) -> Self {
        ListenerMatcher::Standard {
            event_type: event_type.to_string(),
            source: source.to_string(),
        }
    }

    pub fn response(trigger_id: Uuid) -> Self {
        ListenerMatcher::Response { trigger_id }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            ListenerMatcher::Standard { event_type: t, source: s }
                if t == event_type::WILDCARD && s == event_source::WILDCARD
        )
    }

    pub fn matches(&self, event: &Event) -> bool {
        match (self, event.response_id()) {
            (ListenerMatcher::Response { trigger_id }, Some(response_id)) => {
                *trigger_id == response_id
            }
            (ListenerMatcher::Response { .. }, None) => false,
            (ListenerMatcher::Standard { .. }, Some(_)) => self.is_wildcard(),
            (ListenerMatcher::Standard { event_type: t, source: s }, None) => {
                (t == event.event_type() || t == event_type::WILDCARD)
                    && (s == event.source() || s == event_source::WILDCARD)
            }
        }
    }
}

/// A predicate-matched callback held by an extension container.
///
/// Equality only compares the matcher; it exists for deduplication checks in
/// tests, runtime delivery always goes through [`ListenerRegistration::should_notify`].
#[derive(Clone)]
pub struct ListenerRegistration {
    matcher: ListenerMatcher,
    listener: EventListener,
}

impl ListenerRegistration {
    pub fn new(event_type: &str, source: &str, listener: EventListener) -> Self {
        Self {
            matcher: ListenerMatcher::standard(event_type, source),
            listener,
        }
    }

    pub fn matcher(&self) -> &ListenerMatcher {
        &self.matcher
    }

    pub fn should_notify(&self, event: &Event) -> bool {
        self.matcher.matches(event)
    }

    pub fn notify(&self, event: &Event) {
        (self.listener)(event)
    }
}

/// Runs a listener callback, logging instead of propagating a panic so one
/// misbehaving listener cannot stall delivery to the others.
pub(crate) fn invoke_contained<F: FnOnce()>(owner: &str, callback: F) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("ListenerInvocationError in {}: {}", owner, message);
            false
        }
    }
}

impl PartialEq for ListenerRegistration {
    fn eq(&self, other: &Self) -> bool {
        self.matcher == other.matcher
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("matcher", &self.matcher)
            .finish()
    }
}
