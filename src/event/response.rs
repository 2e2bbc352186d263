//! # Response Listeners
//!
//! One-shot listeners keyed to a trigger event. A response listener fires
//! exactly once: with the first dispatched event whose `response_id` equals
//! the trigger's id, or with [`ResponseOutcome::TimedOut`] once its deadline
//! elapses.
//!
//! ## Implementation Details
//!
//! Pending listeners live in a `DashMap` keyed by a per-registration id. Both
//! the match path and the timeout task race to *remove* the entry; only the
//! caller that wins the removal invokes the callback, so a listener can never
//! fire twice. The match path additionally aborts the timeout task.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::listener::{invoke_contained, ListenerMatcher};
use super::Event;

/// What a response listener is invoked with.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// The response event answering the trigger.
    Received(Event),
    /// No response arrived before the deadline.
    TimedOut,
    /// The hub shut down while the listener was still waiting.
    Cancelled,
}

impl ResponseOutcome {
    pub fn event(&self) -> Option<&Event> {
        match self {
            ResponseOutcome::Received(event) => Some(event),
            _ => None,
        }
    }
}

pub type ResponseListener = Box<dyn FnOnce(ResponseOutcome) + Send>;

struct PendingResponse {
    matcher: ListenerMatcher,
    // Mutex only to make the entry Sync, it is taken exactly once
    listener: Mutex<ResponseListener>,
    timeout_task: Option<JoinHandle<()>>,
}

impl PendingResponse {
    fn fire(self, outcome: ResponseOutcome) {
        if let Some(task) = self.timeout_task {
            task.abort();
        }
        let listener = self.listener.into_inner().unwrap_or_else(PoisonError::into_inner);
        invoke_contained("response listener", move || listener(outcome));
    }
}

type PendingMap = DashMap<Uuid, PendingResponse>;

/// Registry of response listeners waiting on trigger events.
#[derive(Default)]
pub struct ResponseListeners {
    pending: Arc<PendingMap>,
}

impl ResponseListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for the response to `trigger`. Must be called
    /// from within a tokio runtime, the deadline runs as a spawned task.
    #[instrument(skip(self, trigger, listener), fields(trigger_id = %trigger.id()))]
    pub fn register(
        &self,
        trigger: &Event,
        timeout: Duration,
        listener: ResponseListener,
    ) -> ResponseListenerHandle {
        let registration_id = Uuid::new_v4();
        self.pending.insert(
            registration_id,
            PendingResponse {
                matcher: ListenerMatcher::response(trigger.id()),
                listener: Mutex::new(listener),
                timeout_task: None,
            },
        );

        let pending = Arc::downgrade(&self.pending);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(pending) = pending.upgrade() else {
                return;
            };
            if let Some((_, entry)) = pending.remove(&registration_id) {
                debug!("Response listener {} timed out", registration_id);
                // the handle stored in `entry` belongs to this task; dropping it detaches
                let listener = entry.listener.into_inner().unwrap_or_else(PoisonError::into_inner);
                invoke_contained("response listener", move || {
                    listener(ResponseOutcome::TimedOut)
                });
            }
        });

        match self.pending.get_mut(&registration_id) {
            Some(mut entry) => entry.timeout_task = Some(task),
            // the deadline already fired
            None => drop(task),
        }

        ResponseListenerHandle {
            registration_id,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Fires every listener waiting on the trigger `event` answers. Returns the
    /// number of listeners notified.
    pub fn handle_event(&self, event: &Event) -> usize {
        let Some(response_id) = event.response_id() else {
            return 0;
        };
        let matching: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().matcher == ListenerMatcher::response(response_id))
            .map(|entry| *entry.key())
            .collect();

        let mut notified = 0;
        for registration_id in matching {
            if let Some((_, entry)) = self.pending.remove(&registration_id) {
                entry.fire(ResponseOutcome::Received(event.clone()));
                notified += 1;
            }
        }
        notified
    }

    /// Fires every waiting listener with [`ResponseOutcome::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for registration_id in ids {
            if let Some((_, entry)) = self.pending.remove(&registration_id) {
                entry.fire(ResponseOutcome::Cancelled);
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Cancellation token for a registered response listener.
#[derive(Clone)]
pub struct ResponseListenerHandle {
    registration_id: Uuid,
    pending: Weak<PendingMap>,
}

impl ResponseListenerHandle {
    /// Removes the listener without invoking it. Returns `false` when it has
    /// already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        let Some(pending) = self.pending.upgrade() else {
            return false;
        };
        match pending.remove(&self.registration_id) {
            Some((_, entry)) => {
                if let Some(task) = entry.timeout_task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .upgrade()
            .is_some_and(|pending| pending.contains_key(&self.registration_id))
    }
}

impl fmt::Debug for ResponseListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseListenerHandle")
            .field("registration_id", &self.registration_id)
            .finish()
    }
}
