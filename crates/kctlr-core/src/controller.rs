//! Reconciliation controller.
//!
//! Drives the lifecycle `Created -> Running -> Draining -> Stopped`:
//! 1. Start the informer and wait for its cache to sync
//! 2. Spawn the worker pool
//! 3. On the stop signal, shut the queue down and wait for every worker
//!
//! Each worker takes one [`IndexKey`] at a time, resolves it against the
//! cache and dispatches to the [`Handler`]. Failures are retried with
//! per-key backoff up to `max_retries`, then dropped and reported.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_SYNC_POLL_INTERVAL};
use crate::report::{ErrorSink, TracingErrorSink};
use crate::{
    ControllerConfig, ControllerError, Handler, IndexKey, Informer, KeyedCache,
    QueueingEventHandler, WorkQueue,
};

/// Pause before restarting a worker that panicked.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    /// Constructed, `run` not called yet.
    Created = 0,
    /// Waiting for the cache or processing items.
    Running = 1,
    /// Stop signal received, workers finishing their current item.
    Draining = 2,
    /// Every worker has exited.
    Stopped = 3,
}

impl From<u8> for ControllerState {
    fn from(v: u8) -> Self {
        match v {
            0 => ControllerState::Created,
            1 => ControllerState::Running,
            2 => ControllerState::Draining,
            _ => ControllerState::Stopped,
        }
    }
}

/// Level-triggered controller for one resource kind.
pub struct Controller<T, C, I, H> {
    queue: WorkQueue<IndexKey>,
    informer: Arc<I>,
    cache: Arc<C>,
    handler: Arc<H>,
    max_retries: u32,
    sync_poll_interval: Duration,
    error_sink: Arc<dyn ErrorSink>,
    state: AtomicU8,
    _object: PhantomData<fn() -> T>,
}

impl<T, C, I, H> Controller<T, C, I, H>
where
    T: Send + 'static,
    C: KeyedCache<T> + 'static,
    I: Informer + 'static,
    H: Handler<T> + 'static,
{
    /// Create a controller. Performs no I/O.
    pub fn new(queue: WorkQueue<IndexKey>, informer: Arc<I>, cache: Arc<C>, handler: H) -> Self {
        Self {
            queue,
            informer,
            cache,
            handler: Arc::new(handler),
            max_retries: DEFAULT_MAX_RETRIES,
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
            error_sink: Arc::new(TracingErrorSink),
            state: AtomicU8::new(ControllerState::Created as u8),
            _object: PhantomData,
        }
    }

    /// Create a controller whose queue and retry policy come from `config`.
    pub fn with_config(config: &ControllerConfig, informer: Arc<I>, cache: Arc<C>, handler: H) -> Self {
        Self::new(config.queue(), informer, cache, handler)
            .with_max_retries(config.max_retries)
            .with_sync_poll_interval(config.sync_poll_interval)
    }

    /// Set the number of automatic retries before a key is dropped.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the interval between cache sync checks.
    pub fn with_sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = interval;
        self
    }

    /// Report terminal failures to `sink` instead of the log.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// The queue workers drain.
    pub fn queue(&self) -> &WorkQueue<IndexKey> {
        &self.queue
    }

    /// Event handler that feeds this controller's queue.
    pub fn event_handler(&self, kind: impl Into<String>) -> QueueingEventHandler {
        QueueingEventHandler::new(self.queue.clone(), kind)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        ControllerState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether the informer's cache has synced.
    pub fn has_synced(&self) -> bool {
        self.informer.has_synced()
    }

    fn worker(&self) -> Worker<T, C, H> {
        Worker {
            queue: self.queue.clone(),
            cache: Arc::clone(&self.cache),
            handler: Arc::clone(&self.handler),
            max_retries: self.max_retries,
            error_sink: Arc::clone(&self.error_sink),
            _object: PhantomData,
        }
    }

    /// Run the controller until `stop` fires.
    ///
    /// Returns once every worker has exited. If `stop` fires before the
    /// cache has synced, no worker is started and
    /// [`ControllerError::CacheSyncTimeout`] is returned.
    pub async fn run(
        &self,
        worker_count: usize,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        if self
            .state
            .compare_exchange(
                ControllerState::Created as u8,
                ControllerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ControllerError::AlreadyStarted);
        }

        info!(worker_count, "starting controller");

        let informer_handle = {
            let informer = Arc::clone(&self.informer);
            let stop = stop.clone();
            tokio::spawn(async move { informer.run(stop).await })
        };

        if !self.wait_for_cache_sync(&mut stop).await {
            let err = ControllerError::CacheSyncTimeout;
            self.error_sink.report(&err);
            self.queue.shut_down();
            if let Err(e) = informer_handle.await {
                warn!(error = %e, "informer task failed");
            }
            self.set_state(ControllerState::Stopped);
            return Err(err);
        }

        debug!("caches synced, spawning workers");
        let worker = Arc::new(self.worker());
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker_id| spawn_supervised(Arc::clone(&worker), worker_id))
            .collect();

        wait_for_stop(&mut stop).await;

        info!("stopping controller");
        self.set_state(ControllerState::Draining);
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker supervisor failed");
            }
        }
        if let Err(e) = informer_handle.await {
            warn!(error = %e, "informer task failed");
        }

        self.set_state(ControllerState::Stopped);
        info!("controller stopped");
        Ok(())
    }

    /// Poll `has_synced` until it holds or `stop` fires.
    async fn wait_for_cache_sync(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let mut ticker = tokio::time::interval(self.sync_poll_interval);
        loop {
            if self.informer.has_synced() {
                return true;
            }
            tokio::select! {
                _ = wait_for_stop(stop) => return false,
                _ = ticker.tick() => {}
            }
        }
    }
}

/// Resolves when `stop` reads `true` or its sender is dropped.
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Run a worker loop, restarting it after a panic until the queue shuts down.
fn spawn_supervised<T, C, H>(worker: Arc<Worker<T, C, H>>, worker_id: usize) -> JoinHandle<()>
where
    T: Send + 'static,
    C: KeyedCache<T> + 'static,
    H: Handler<T> + 'static,
{
    tokio::spawn(async move {
        loop {
            let run = {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move { worker.run(worker_id).await })
            };

            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    worker
                        .error_sink
                        .report(&ControllerError::WorkerPanicked { worker_id });
                    if worker.queue.is_shutting_down() {
                        break;
                    }
                    warn!(worker_id, "restarting worker");
                    tokio::time::sleep(WORKER_RESTART_DELAY).await;
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "worker cancelled");
                    break;
                }
            }
        }
    })
}

/// Releases a checked-out key on every exit path, including panics.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<IndexKey>,
    key: &'a IndexKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        // A panicking handler never reaches `handle_err`; drop its retry history here.
        if std::thread::panicking() {
            self.queue.forget(self.key);
        }
        self.queue.done(self.key);
    }
}

/// State shared by the worker loops.
struct Worker<T, C, H> {
    queue: WorkQueue<IndexKey>,
    cache: Arc<C>,
    handler: Arc<H>,
    max_retries: u32,
    error_sink: Arc<dyn ErrorSink>,
    _object: PhantomData<fn() -> T>,
}

impl<T, C, H> Worker<T, C, H>
where
    T: Send + 'static,
    C: KeyedCache<T>,
    H: Handler<T>,
{
    async fn run(&self, worker_id: usize) {
        debug!(worker_id, "worker started");
        while self.process_next_item().await {}
        debug!(worker_id, "worker stopped");
    }

    /// Process one key. Returns `false` once the queue has shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _done = DoneGuard {
            queue: &self.queue,
            key: &key,
        };

        let result = self.process_item(&key).await;
        self.handle_err(result, &key);
        true
    }

    /// Resolve a key against the cache and invoke the handler.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn process_item(&self, key: &IndexKey) -> Result<(), ControllerError> {
        let handler_err = |source| ControllerError::Handler {
            key: key.clone(),
            source,
        };

        let Some(new) = self.fetch(&key.new)? else {
            return self
                .handler
                .delete(&key.new, None)
                .await
                .map_err(handler_err);
        };

        let Some(old_key) = key.old.as_deref() else {
            return self.handler.create(new).await.map_err(handler_err);
        };

        let old = self.fetch(old_key)?;
        if old.is_none() {
            // The handler has to cope with a missing old object.
            warn!(old_key, "old object no longer exists in store");
        }

        self.handler.update(old, new).await.map_err(handler_err)
    }

    fn fetch(&self, key: &str) -> Result<Option<T>, ControllerError> {
        self.cache.get_by_key(key).map_err(|source| {
            error!(key, error = %source, "fetching object from store failed");
            ControllerError::Cache {
                key: key.to_string(),
                source,
            }
        })
    }

    /// Forget on success, requeue with backoff on failure, drop past the ceiling.
    fn handle_err(&self, result: Result<(), ControllerError>, key: &IndexKey) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        let attempts = self.queue.num_requeues(key);
        if attempts < self.max_retries {
            warn!(key = %key, attempt = attempts + 1, error = %err, "error syncing object, requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        error!(key = %key, attempts, error = %err, "dropping object out of the queue");
        self.error_sink.report(&ControllerError::RetriesExhausted {
            key: key.clone(),
            attempts,
            source: Box::new(err),
        });
    }
}
