//! # Operation Orderer
//!
//! A restartable, single-consumer FIFO processing loop. Items are handed to a
//! handler one at a time on a dedicated tokio task; the next item is never
//! started before the handler for the current one returns.
//!
//! The handler's return value drives the queue:
//!
//! - `true`: the item is done, continue with the next one
//! - `false`: not ready, keep the item at the head and stop draining until
//!   the next [`OperationOrderer::add`] or [`OperationOrderer::start`]
//!
//! Stopping only suspends processing; queued items survive for a later start.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, trace};

pub type OrdererHandler<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

type Finalizer = Box<dyn FnOnce() + Send>;

enum Drained {
    Processed,
    Idle,
}

struct OrdererInner<T> {
    tag: String,
    items: Mutex<VecDeque<T>>,
    handler: RwLock<Option<OrdererHandler<T>>>,
    active: AtomicBool,
    closed: AtomicBool,
    finalizer: Mutex<Option<Finalizer>>,
    wake: Notify,
}

impl<T> OrdererInner<T> {
    fn trigger_if_needed(&self) {
        if self.active.load(Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    fn drain_one(&self) -> Drained {
        if !self.active.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Drained::Idle;
        }
        let Some(handler) = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Drained::Idle;
        };
        let Some(item) = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        else {
            return Drained::Idle;
        };

        let processed = match catch_unwind(AssertUnwindSafe(|| handler(&item))) {
            Ok(processed) => processed,
            Err(_) => {
                error!("OperationOrderer({}) handler panicked, dropping item", self.tag);
                true
            }
        };

        if processed {
            Drained::Processed
        } else {
            trace!("OperationOrderer({}) head not ready, pausing", self.tag);
            self.items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_front(item);
            Drained::Idle
        }
    }

    fn finish(&self) {
        let finalizer = self
            .finalizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(finalizer) = finalizer {
            if catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
                error!("OperationOrderer({}) close callback panicked", self.tag);
            }
        }
    }
}

/// FIFO job queue with a pluggable per-item handler.
///
/// Must be created inside a tokio runtime; the consumer runs as a spawned
/// task that lives until the orderer is closed or dropped.
pub struct OperationOrderer<T: Send + 'static> {
    inner: Arc<OrdererInner<T>>,
}

impl<T: Send + 'static> OperationOrderer<T> {
    /// Creates a stopped orderer. `tag` only shows up in logs.
    pub fn new(tag: &str) -> Self {
        let inner = Arc::new(OrdererInner {
            tag: tag.to_string(),
            items: Mutex::new(VecDeque::new()),
            handler: RwLock::new(None),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            finalizer: Mutex::new(None),
            wake: Notify::new(),
        });

        let worker = inner.clone();
        tokio::spawn(async move {
            loop {
                worker.wake.notified().await;
                if worker.closed.load(Ordering::SeqCst) {
                    break;
                }
                while let Drained::Processed = worker.drain_one() {
                    // re-check `active` between items and let sibling tasks run
                    tokio::task::yield_now().await;
                }
            }
            worker.finish();
            trace!("OperationOrderer({}) worker exited", worker.tag);
        });

        Self { inner }
    }

    /// Appends an item and schedules processing if the queue is running.
    pub fn add(&self, item: T) {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.inner.trigger_if_needed();
    }

    /// Installs the per-item handler; processing waits until one is set.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
        self.inner.trigger_if_needed();
    }

    pub fn start(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
        self.inner.trigger_if_needed();
    }

    /// Starts the queue once `delay` has elapsed.
    pub fn start_after(&self, delay: Duration) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.active.store(true, Ordering::SeqCst);
                inner.trigger_if_needed();
            }
        });
    }

    /// Suspends processing. The item currently in the handler finishes; the
    /// rest stay queued.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    /// Stops for good: the worker exits and queued items are discarded.
    pub fn close(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.wake.notify_one();
    }

    /// Closes the orderer and runs `on_closed` on the worker once the item
    /// currently in the handler, if any, has returned.
    pub fn close_with<F>(&self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self
            .inner
            .finalizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(on_closed));
        self.close();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Items waiting to be handled, excluding one currently in the handler.
    pub fn len(&self) -> usize {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Drop for OperationOrderer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Send + 'static> fmt::Debug for OperationOrderer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationOrderer")
            .field("tag", &self.inner.tag)
            .field("active", &self.is_active())
            .field("len", &self.len())
            .finish()
    }
}
