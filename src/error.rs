use thiserror::Error;

use crate::event::EventError;
use crate::hit_queue::{DataQueueError, HitQueueError};
use crate::hub::HubError;
use crate::shared_state::SharedStateError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
    #[error("Shared state error: {0}")]
    SharedState(#[from] SharedStateError),
    #[error("Data queue error: {0}")]
    DataQueue(#[from] DataQueueError),
    #[error("Hit queue error: {0}")]
    HitQueue(#[from] HitQueueError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
