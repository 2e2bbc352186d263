//! # Persistent Hit Queue
//!
//! Durable, ordered, retrying work queue. Hits are persisted in a
//! [`DataQueue`] first and handed to a [`HitProcessing`] implementation one at
//! a time, oldest first. A hit is only removed after the processor reports
//! success; a failure parks the worker for the processor's retry interval and
//! then retries the same hit, so later hits never overtake a failing one.
//!
//! The queue starts suspended. Call [`PersistentHitQueue::begin_processing`]
//! once the processor is able to send.

pub mod data_queue;
pub mod file_queue;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub use data_queue::{DataEntity, DataQueue, InMemoryDataQueue};
pub use file_queue::FileDataQueue;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HitProcessing: Send + Sync {
    /// How long to wait before retrying `entity` after a failure.
    fn retry_interval(&self, _entity: &DataEntity) -> Duration {
        DEFAULT_RETRY_INTERVAL
    }

    /// `true` removes the hit, `false` schedules a retry.
    async fn process_hit(&self, entity: &DataEntity) -> bool;

    /// Minimum backlog before processing starts. 0 processes every hit as
    /// soon as it is queued.
    fn batch_limit(&self) -> usize {
        0
    }
}

struct HitQueueInner {
    data_queue: Arc<dyn DataQueue>,
    processor: Arc<dyn HitProcessing>,
    suspended: AtomicBool,
    force: AtomicBool,
    closed: AtomicBool,
    /// Serializes head removal with `clear`.
    head: Mutex<()>,
    wake: Notify,
    shutdown: Notify,
}

impl HitQueueInner {
    fn trigger(&self) {
        self.wake.notify_one();
    }

    fn halted(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }

    async fn below_batch_limit(&self) -> bool {
        let limit = self.processor.batch_limit();
        if limit == 0 || self.force.load(Ordering::SeqCst) {
            return false;
        }
        match self.data_queue.count().await {
            Ok(count) => count < limit,
            Err(e) => {
                warn!("Failed to count queued hits: {}", e);
                true
            }
        }
    }

    /// Works through the backlog until it is empty or the queue is halted.
    async fn drain(&self) {
        if self.halted() || self.below_batch_limit().await {
            return;
        }

        loop {
            if self.halted() {
                return;
            }
            let entity = match self.data_queue.peek().await {
                Ok(Some(entity)) => entity,
                Ok(None) => {
                    self.force.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!("Failed to read the next hit: {}", e);
                    return;
                }
            };

            if self.processor.process_hit(&entity).await {
                trace!("Hit {} processed", entity.unique_identifier);
                match self.remove_head(&entity).await {
                    Ok(true) => {}
                    Ok(false) => debug!(
                        "Hit {} left the queue while in flight",
                        entity.unique_identifier
                    ),
                    Err(e) => {
                        error!("Failed to remove processed hit {}: {}", entity.unique_identifier, e);
                        return;
                    }
                }
                continue;
            }

            let retry_in = self.processor.retry_interval(&entity);
            debug!(
                "Hit {} failed, retrying in {:?}",
                entity.unique_identifier, retry_in
            );
            let closed = self.shutdown.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(retry_in) => {}
                _ = &mut closed => return,
            }
        }
    }

    /// Removes the head only if it is still `entity`; a `clear` during
    /// processing may have replaced it.
    async fn remove_head(&self, entity: &DataEntity) -> DataQueueResult<bool> {
        let _head = self.head.lock().await;
        match self.data_queue.peek().await? {
            Some(head) if head.unique_identifier == entity.unique_identifier => {
                self.data_queue.remove().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// # PersistentHitQueue
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use extension_hub::hit_queue::{DataEntity, HitProcessing, InMemoryDataQueue, PersistentHitQueue};
///
/// struct Sender;
///
/// #[async_trait]
/// impl HitProcessing for Sender {
///     async fn process_hit(&self, entity: &DataEntity) -> bool {
///         entity.data.is_some()
///     }
/// }
///
/// # async fn run() -> Result<(), extension_hub::hit_queue::HitQueueError> {
/// let queue = PersistentHitQueue::new(Arc::new(InMemoryDataQueue::new()), Arc::new(Sender));
/// queue.queue(DataEntity::new(Some(b"{}".to_vec()))).await?;
/// queue.begin_processing();
/// # Ok(())
/// # }
/// ```
pub struct PersistentHitQueue {
    inner: Arc<HitQueueInner>,
    worker: JoinHandle<()>,
}

impl PersistentHitQueue {
    /// Creates a suspended queue. Must be called inside a tokio runtime.
    pub fn new(data_queue: Arc<dyn DataQueue>, processor: Arc<dyn HitProcessing>) -> Self {
        let inner = Arc::new(HitQueueInner {
            data_queue,
            processor,
            suspended: AtomicBool::new(true),
            force: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            head: Mutex::new(()),
            wake: Notify::new(),
            shutdown: Notify::new(),
        });

        let worker_inner = inner.clone();
        let worker = tokio::spawn(async move {
            loop {
                worker_inner.wake.notified().await;
                if worker_inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                worker_inner.drain().await;
            }
            trace!("Hit queue worker exited");
        });

        Self { inner, worker }
    }

    /// Persists `entity` and schedules processing. Storage failures are
    /// returned as is and not retried.
    pub async fn queue(&self, entity: DataEntity) -> HitQueueResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HitQueueError::Closed);
        }
        self.inner.data_queue.add(entity).await?;
        self.inner.trigger();
        Ok(())
    }

    pub fn begin_processing(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.trigger();
    }

    /// Processes the backlog even when it is smaller than the batch limit.
    pub fn force_processing(&self) {
        self.inner.force.store(true, Ordering::SeqCst);
        self.begin_processing();
    }

    /// Stops after the hit currently being processed.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) -> HitQueueResult<()> {
        let _head = self.inner.head.lock().await;
        Ok(self.inner.data_queue.clear().await?)
    }

    pub async fn count(&self) -> HitQueueResult<usize> {
        Ok(self.inner.data_queue.count().await?)
    }

    /// Suspends for good and closes the underlying store.
    pub async fn close(&self) -> HitQueueResult<()> {
        self.inner.suspended.store(true, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        self.inner.trigger();
        self.inner.data_queue.close().await?;
        info!("Hit queue closed");
        Ok(())
    }
}

impl Drop for PersistentHitQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl fmt::Debug for PersistentHitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentHitQueue")
            .field("suspended", &self.is_suspended())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataQueueError {
    #[error("Data queue is closed")]
    Closed,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DataQueueResult<T> = Result<T, DataQueueError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HitQueueError {
    #[error("Hit queue is closed")]
    Closed,
    #[error("Data queue error: {0}")]
    Storage(#[from] DataQueueError),
}

pub type HitQueueResult<T> = Result<T, HitQueueError>;

#[cfg(test)]
mod tests {
    use super::data_queue::MockDataQueue;
    use super::*;
    use crate::test_util::wait_until;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn hit(id: &str) -> DataEntity {
        DataEntity::with_identifier(id, None)
    }

    /// Succeeds unless told to fail, recording the identifiers it accepted.
    #[derive(Default)]
    struct Recorder {
        processed: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        failures_left: AtomicUsize,
        batch_limit: usize,
    }

    #[async_trait]
    impl HitProcessing for Recorder {
        fn retry_interval(&self, _entity: &DataEntity) -> Duration {
            Duration::from_millis(20)
        }

        async fn process_hit(&self, entity: &DataEntity) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            self.processed
                .lock()
                .unwrap()
                .push(entity.unique_identifier.clone());
            true
        }

        fn batch_limit(&self) -> usize {
            self.batch_limit
        }
    }

    impl Recorder {
        fn processed(&self) -> Vec<String> {
            self.processed.lock().unwrap().clone()
        }
    }

    fn queue_with(recorder: Arc<Recorder>) -> (PersistentHitQueue, Arc<InMemoryDataQueue>) {
        let store = Arc::new(InMemoryDataQueue::new());
        (PersistentHitQueue::new(store.clone(), recorder), store)
    }

    #[tokio::test]
    async fn test_suspended_by_default() {
        let recorder = Arc::new(Recorder::default());
        let (queue, store) = queue_with(recorder.clone());
        queue.queue(hit("a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_suspended());
        let head = store.peek().await.unwrap().map(|e| e.unique_identifier);
        assert_eq!(head, Some("a".to_string()));
        assert!(recorder.processed().is_empty());
    }

    #[tokio::test]
    async fn test_processes_many_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (queue, _store) = queue_with(recorder.clone());
        queue.begin_processing();
        let ids: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        for id in &ids {
            queue.queue(hit(id)).await.unwrap();
        }

        assert!(wait_until(|| recorder.processed().len() == 100).await);
        assert_eq!(recorder.processed(), ids);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_head_blocks_later_hits() {
        let recorder = Arc::new(Recorder {
            failures_left: AtomicUsize::new(3),
            ..Recorder::default()
        });
        let (queue, _store) = queue_with(recorder.clone());
        queue.queue(hit("a")).await.unwrap();
        queue.queue(hit("b")).await.unwrap();
        queue.queue(hit("c")).await.unwrap();
        queue.begin_processing();

        assert!(wait_until(|| recorder.processed().len() == 3).await);
        assert_eq!(recorder.processed(), vec!["a", "b", "c"]);
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_retries_then_removes_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(AtomicUsize::new(0));
        let mut processor = MockHitProcessing::new();
        {
            let attempts = attempts.clone();
            processor.expect_process_hit().returning(move |_| {
                // fail twice, succeed on the third attempt
                attempts.fetch_add(1, Ordering::SeqCst) >= 2
            });
        }
        {
            let retries = retries.clone();
            processor.expect_retry_interval().returning(move |_| {
                retries.fetch_add(1, Ordering::SeqCst);
                Duration::from_millis(100)
            });
        }
        processor.expect_batch_limit().return_const(0usize);

        let store = Arc::new(InMemoryDataQueue::new());
        let queue = PersistentHitQueue::new(store.clone(), Arc::new(processor));
        queue.queue(hit("retry-me")).await.unwrap();
        queue.begin_processing();

        assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 2).await);
        // still persisted between attempts
        assert_eq!(store.count().await.unwrap(), 1);

        assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 3).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_suspend_and_begin_are_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let (queue, _store) = queue_with(recorder.clone());
        queue.suspend();
        queue.suspend();
        queue.queue(hit("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(recorder.processed().is_empty());

        queue.begin_processing();
        queue.begin_processing();
        queue.queue(hit("b")).await.unwrap();
        assert!(wait_until(|| recorder.processed().len() == 2).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.processed(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_batch_limit_and_force() {
        let recorder = Arc::new(Recorder {
            batch_limit: 3,
            ..Recorder::default()
        });
        let (queue, _store) = queue_with(recorder.clone());
        queue.begin_processing();
        queue.queue(hit("a")).await.unwrap();
        queue.queue(hit("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.processed().is_empty());

        queue.queue(hit("c")).await.unwrap();
        assert!(wait_until(|| recorder.processed().len() == 3).await);

        queue.queue(hit("d")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.processed().len(), 3);
        queue.force_processing();
        assert!(wait_until(|| recorder.processed().len() == 4).await);
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_to_caller() {
        let mut store = MockDataQueue::new();
        store
            .expect_add()
            .returning(|_| Err(DataQueueError::Storage("disk full".to_string())));
        let queue = PersistentHitQueue::new(Arc::new(store), Arc::new(Recorder::default()));

        assert_eq!(
            queue.queue(hit("a")).await,
            Err(HitQueueError::Storage(DataQueueError::Storage(
                "disk full".to_string()
            )))
        );
    }

    /// Holds hit "a" in the processor until released.
    #[derive(Default)]
    struct Gated {
        started: AtomicBool,
        release: Notify,
        processed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HitProcessing for Gated {
        async fn process_hit(&self, entity: &DataEntity) -> bool {
            if entity.unique_identifier == "a" {
                self.started.store(true, Ordering::SeqCst);
                self.release.notified().await;
            }
            self.processed
                .lock()
                .unwrap()
                .push(entity.unique_identifier.clone());
            true
        }
    }

    #[tokio::test]
    async fn test_clear_during_processing_keeps_new_hits() {
        let processor = Arc::new(Gated::default());
        let store = Arc::new(InMemoryDataQueue::new());
        let queue = PersistentHitQueue::new(store.clone(), processor.clone());
        queue.queue(hit("a")).await.unwrap();
        queue.begin_processing();
        assert!(wait_until(|| processor.started.load(Ordering::SeqCst)).await);

        queue.clear().await.unwrap();
        queue.queue(hit("b")).await.unwrap();
        processor.release.notify_one();

        assert!(wait_until(|| processor.processed.lock().unwrap().len() == 2).await);
        assert_eq!(*processor.processed.lock().unwrap(), vec!["a", "b"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let recorder = Arc::new(Recorder::default());
        let (queue, _store) = queue_with(recorder.clone());
        queue.queue(hit("a")).await.unwrap();
        queue.queue(hit("b")).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 2);

        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);

        queue.close().await.unwrap();
        assert!(queue.is_suspended());
        assert_eq!(queue.queue(hit("c")).await, Err(HitQueueError::Closed));
        assert!(recorder.processed().is_empty());
    }
}
