//! # Shared State
//!
//! Every extension publishes its public data as a versioned [`SharedState`].
//! Versions are keyed by the hub sequence position of the event that produced
//! them, so other extensions can ask "what was this extension's state as of
//! event N" and get an answer that is consistent with the event stream.
//!
//! ## Version lifecycle
//!
//! ```text
//! set(pos, data)          ──► Set(data)
//! set_pending(pos)        ──► Pending ──resolve_pending(Some)──► Set(data)
//!                                     └─resolve_pending(None)──► None
//! ```
//!
//! Positions strictly increase. A pending version carries the previous data
//! as a placeholder until it is resolved.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::EventData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum SharedStateStatus {
    Set,
    Pending,
    None,
}

/// How a read treats pending versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SharedStateResolution {
    /// Most recent Set version, skipping pending and None versions.
    LastSet,
    /// Most recent version whatever its status.
    #[default]
    Any,
}

/// Each extension owns one store per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
pub enum SharedStateType {
    #[default]
    Standard,
    Xdm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SharedStateResult {
    pub status: SharedStateStatus,
    pub value: Option<EventData>,
}

impl SharedStateResult {
    pub fn none() -> Self {
        Self {
            status: SharedStateStatus::None,
            value: None,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: SharedStateStatus::Pending,
            value: None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.status == SharedStateStatus::Set
    }
}

#[derive(Debug, Clone)]
struct Version {
    position: u64,
    status: SharedStateStatus,
    data: Option<EventData>,
}

impl From<&Version> for SharedStateResult {
    fn from(version: &Version) -> Self {
        SharedStateResult {
            status: version.status,
            value: version.data.clone(),
        }
    }
}

/// Versioned state table of a single extension.
///
/// Reads take a shared lock and may run concurrently with each other and
/// with writes issued from the owning extension's task.
pub struct SharedState {
    name: String,
    versions: RwLock<Vec<Version>>,
}

impl SharedState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn latest_position(&self) -> Option<u64> {
        self.read().last().map(|v| v.position)
    }

    /// Adds a Set version at `position`.
    pub fn set(&self, position: u64, data: EventData) -> StateResult<()> {
        let mut versions = self.write();
        if let Some(pending) = versions
            .iter()
            .find(|v| v.status == SharedStateStatus::Pending && v.position < position)
        {
            return Err(SharedStateError::PendingOutstanding {
                name: self.name.clone(),
                pending_position: pending.position,
            });
        }
        self.push(
            &mut versions,
            Version {
                position,
                status: SharedStateStatus::Set,
                data: Some(data),
            },
        )
    }

    /// Adds a Pending version at `position`, carrying the latest data as a
    /// placeholder.
    pub fn set_pending(&self, position: u64) -> StateResult<()> {
        let mut versions = self.write();
        let placeholder = versions.last().and_then(|v| v.data.clone());
        self.push(
            &mut versions,
            Version {
                position,
                status: SharedStateStatus::Pending,
                data: placeholder,
            },
        )
    }

    /// Resolves the pending version at `position` to Set (`Some`) or None.
    pub fn resolve_pending(&self, position: u64, data: Option<EventData>) -> StateResult<()> {
        let mut versions = self.write();
        match versions.iter_mut().rev().find(|v| v.position == position) {
            Some(version) if version.status == SharedStateStatus::Pending => {
                version.status = if data.is_some() {
                    SharedStateStatus::Set
                } else {
                    SharedStateStatus::None
                };
                version.data = data;
                debug!(
                    "SharedState({}) version {} resolved to {}",
                    self.name, position, version.status
                );
                Ok(())
            }
            _ => Err(SharedStateError::NotPending {
                name: self.name.clone(),
                position,
            }),
        }
    }

    /// Most recent version at or before `position`.
    pub fn resolve(&self, position: u64) -> SharedStateResult {
        self.read()
            .iter()
            .rev()
            .find(|v| v.position <= position)
            .map(SharedStateResult::from)
            .unwrap_or_else(SharedStateResult::none)
    }

    /// Most recent Set version at or before `position`.
    pub fn resolve_last_set(&self, position: u64) -> SharedStateResult {
        self.read()
            .iter()
            .rev()
            .find(|v| v.position <= position && v.status == SharedStateStatus::Set)
            .map(SharedStateResult::from)
            .unwrap_or_else(SharedStateResult::none)
    }

    pub fn resolve_with(&self, position: u64, resolution: SharedStateResolution) -> SharedStateResult {
        match resolution {
            SharedStateResolution::Any => self.resolve(position),
            SharedStateResolution::LastSet => self.resolve_last_set(position),
        }
    }

    fn push(&self, versions: &mut Vec<Version>, version: Version) -> StateResult<()> {
        if let Some(latest) = versions.last() {
            if latest.position >= version.position {
                debug!(
                    "SharedState({}) rejected version {}, latest is {}",
                    self.name, version.position, latest.position
                );
                return Err(SharedStateError::VersionConflict {
                    name: self.name.clone(),
                    position: version.position,
                    latest: latest.position,
                });
            }
        }
        versions.push(version);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Version>> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Version>> {
        self.versions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("name", &self.name)
            .field("versions", &self.read().len())
            .finish()
    }
}

type ResolveFn = Box<dyn FnOnce(Option<EventData>) + Send>;

/// One-shot handle resolving a pending shared state version.
///
/// Clones share the same guard: whichever call comes first resolves the
/// version, every later call is a logged no-op.
#[derive(Clone)]
pub struct SharedStateResolver {
    owner: String,
    position: u64,
    resolve: Arc<Mutex<Option<ResolveFn>>>,
}

impl SharedStateResolver {
    pub(crate) fn new<F>(owner: &str, position: u64, resolve: F) -> Self
    where
        F: FnOnce(Option<EventData>) + Send + 'static,
    {
        Self {
            owner: owner.to_string(),
            position,
            resolve: Arc::new(Mutex::new(Some(Box::new(resolve)))),
        }
    }

    /// Resolves the pending version with `data` (Set) or `None` (None).
    /// Returns `false` if this resolver was already used.
    pub fn resolve(&self, data: Option<EventData>) -> bool {
        let resolve = self
            .resolve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match resolve {
            Some(resolve) => {
                resolve(data);
                true
            }
            None => {
                warn!(
                    "Pending shared state {} of {} already resolved, ignoring",
                    self.position, self.owner
                );
                false
            }
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_resolved(&self) -> bool {
        self.resolve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for SharedStateResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStateResolver")
            .field("owner", &self.owner)
            .field("position", &self.position)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SharedStateError {
    #[error("Shared state {name}: version {position} is not newer than {latest}")]
    VersionConflict {
        name: String,
        position: u64,
        latest: u64,
    },
    #[error("Shared state {name}: pending version {pending_position} must be resolved first")]
    PendingOutstanding { name: String, pending_position: u64 },
    #[error("Shared state {name}: no pending version at {position}")]
    NotPending { name: String, position: u64 },
}

pub type StateResult<T> = Result<T, SharedStateError>;
