//! # extension-hub: In-Process Extension Event Hub
//!
//! A runtime in which independently developed extensions cooperate by
//! exchanging events and publishing versioned shared state, plus a durable
//! retrying work queue for deferred delivery.
//!
//! ## Building Blocks
//!
//! ### 1. Events
//! - Event model and correlation ([`event`])
//! - Listener matching ([`event::listener`])
//! - One-shot response listeners with timeouts ([`event::response`])
//!
//! ### 2. Hub and Extensions
//! - Central dispatcher and registry ([`hub`])
//! - Per-extension container with its own ordered queue ([`container`])
//! - Extension contract and runtime handle ([`extension`])
//! - Restartable FIFO processing loop ([`orderer`])
//!
//! ### 3. Shared State
//! - Versioned per-extension state keyed by event position ([`shared_state`])
//!
//! ### 4. Deferred Work
//! - Persistent, ordered, retrying hit queue ([`hit_queue`])
//!
//! ## Event Flow
//!
//! ```text
//! dispatch → sequence number → hub queue → preprocessors → response listeners
//!                                        → history
//!                                        → every container queue → listeners
//! ```
//!
//! Every container sees events in sequence order. Shared state versions are
//! stamped with the same sequence positions, which is what lets an extension
//! read another one's state "as of" the event it is handling.

pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod extension;
pub mod hit_queue;
pub mod hub;
pub mod orderer;
pub mod shared_state;

#[cfg(test)]
mod test_util;

// Re-exports
pub use config::{HitQueueConfig, HubConfig};
pub use error::*;
pub use event::{event_source, event_type, Event, EventData};
pub use extension::{Extension, ExtensionRuntime, ExtensionType};
pub use hub::{EventHub, HubError, HubResult};
pub use shared_state::{SharedStateResolution, SharedStateResult, SharedStateStatus, SharedStateType};
