use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DataQueueError, DataQueueResult};

/// A unit of deferred work stored in a [`DataQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntity {
    pub unique_identifier: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl DataEntity {
    pub fn new(data: Option<Vec<u8>>) -> Self {
        Self::with_identifier(&Uuid::new_v4().to_string(), data)
    }

    pub fn with_identifier(unique_identifier: &str, data: Option<Vec<u8>>) -> Self {
        Self {
            unique_identifier: unique_identifier.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// FIFO store backing a [`super::PersistentHitQueue`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataQueue: Send + Sync {
    async fn add(&self, entity: DataEntity) -> DataQueueResult<()>;
    /// Oldest entity without removing it.
    async fn peek(&self) -> DataQueueResult<Option<DataEntity>>;
    /// Removes the oldest entity.
    async fn remove(&self) -> DataQueueResult<()>;
    async fn clear(&self) -> DataQueueResult<()>;
    async fn count(&self) -> DataQueueResult<usize>;
    /// Every later call fails with [`DataQueueError::Closed`].
    async fn close(&self) -> DataQueueResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryDataQueue {
    entities: Mutex<VecDeque<DataEntity>>,
    closed: AtomicBool,
}

impl InMemoryDataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> DataQueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DataQueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataQueue for InMemoryDataQueue {
    async fn add(&self, entity: DataEntity) -> DataQueueResult<()> {
        self.ensure_open()?;
        self.entities.lock().await.push_back(entity);
        Ok(())
    }

    async fn peek(&self) -> DataQueueResult<Option<DataEntity>> {
        self.ensure_open()?;
        Ok(self.entities.lock().await.front().cloned())
    }

    async fn remove(&self) -> DataQueueResult<()> {
        self.ensure_open()?;
        self.entities.lock().await.pop_front();
        Ok(())
    }

    async fn clear(&self) -> DataQueueResult<()> {
        self.ensure_open()?;
        self.entities.lock().await.clear();
        Ok(())
    }

    async fn count(&self) -> DataQueueResult<usize> {
        self.ensure_open()?;
        Ok(self.entities.lock().await.len())
    }

    async fn close(&self) -> DataQueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_operations() {
        let queue = InMemoryDataQueue::new();
        let first = DataEntity::with_identifier("first", Some(b"payload".to_vec()));
        let second = DataEntity::with_identifier("second", None);
        queue.add(first.clone()).await.unwrap();
        queue.add(second.clone()).await.unwrap();

        assert_eq!(queue.count().await.unwrap(), 2);
        assert_eq!(queue.peek().await.unwrap(), Some(first));
        queue.remove().await.unwrap();
        assert_eq!(queue.peek().await.unwrap(), Some(second));

        queue.clear().await.unwrap();
        assert_eq!(queue.peek().await.unwrap(), None);
        // removing from an empty queue is not an error
        queue.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_calls() {
        let queue = InMemoryDataQueue::new();
        queue.close().await.unwrap();
        assert_eq!(
            queue.add(DataEntity::new(None)).await,
            Err(DataQueueError::Closed)
        );
        assert_eq!(queue.count().await, Err(DataQueueError::Closed));
    }
}
