//! Channel-fed informer.
//!
//! Startup sequence:
//! 1. Populate the store from the initial listing
//! 2. Go live, announcing every listed object as added
//! 3. Apply watch events as they arrive, plus periodic resyncs
//!
//! Handlers are called synchronously on the informer task, after the store
//! has been updated, so a handler never observes a store older than the
//! notification it received.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use kctlr_core::{DeletedObject, Informer, Keyed, ResourceEventHandler};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{MemoryStore, SyncState};

/// A change observed by the watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(DeletedObject<T>),
}

struct WatchSource<T> {
    initial: Vec<T>,
    events: mpsc::Receiver<WatchEvent<T>>,
}

/// Keeps a [`MemoryStore`] in sync with a stream of watch events and fans
/// notifications out to registered handlers.
pub struct SharedInformer<T> {
    store: Arc<MemoryStore<T>>,
    source: Mutex<Option<WatchSource<T>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<T>>>>,
    resync_period: Option<Duration>,
    synced: AtomicBool,
}

impl<T> SharedInformer<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<MemoryStore<T>>,
        initial: Vec<T>,
        events: mpsc::Receiver<WatchEvent<T>>,
    ) -> Self {
        Self {
            store,
            source: Mutex::new(Some(WatchSource { initial, events })),
            handlers: RwLock::new(Vec::new()),
            resync_period: None,
            synced: AtomicBool::new(false),
        }
    }

    /// Replay an update notification for every cached object each `period`.
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Register a handler. Handlers added after the informer went live
    /// only see subsequent notifications.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// The store this informer keeps in sync.
    pub fn store(&self) -> &Arc<MemoryStore<T>> {
        &self.store
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn populate(&self, initial: Vec<T>) {
        self.store.set_state(SyncState::Syncing);

        let listed: Vec<T> = initial
            .into_iter()
            .filter(|obj| {
                let keyed = obj.key().is_some();
                if !keyed {
                    warn!("skipping listed object without a key");
                }
                keyed
            })
            .collect();

        // Every object is keyed, so replace cannot fail.
        if let Err(e) = self.store.replace(listed.clone()) {
            warn!(error = %e, "failed to populate store");
        }

        self.store.set_state(SyncState::Live);
        self.synced.store(true, Ordering::SeqCst);
        info!(objects = self.store.len(), "informer is live");

        let handlers = self.handlers();
        for obj in &listed {
            for handler in &handlers {
                handler.on_add(obj);
            }
        }
    }

    fn apply(&self, event: WatchEvent<T>) {
        let handlers = self.handlers();
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let previous = match self.store.upsert(obj.clone()) {
                    Ok(previous) => previous,
                    Err(e) => {
                        warn!(error = %e, "dropping watch event");
                        return;
                    }
                };
                for handler in &handlers {
                    match &previous {
                        Some(old) => handler.on_update(old, &obj),
                        None => handler.on_add(&obj),
                    }
                }
            }
            WatchEvent::Deleted(deleted) => {
                let Some(key) = deleted.key() else {
                    warn!("dropping delete event without a key");
                    return;
                };
                let removed = self.store.delete(&key);
                let deleted = match deleted {
                    DeletedObject::FinalStateUnknown {
                        key,
                        last_known: None,
                    } => DeletedObject::FinalStateUnknown {
                        key,
                        last_known: removed,
                    },
                    other => other,
                };
                for handler in &handlers {
                    handler.on_delete(&deleted);
                }
            }
        }
    }

    fn resync(&self) {
        let objects = self.store.list();
        debug!(objects = objects.len(), "resyncing");
        let handlers = self.handlers();
        for obj in &objects {
            for handler in &handlers {
                handler.on_update(obj, obj);
            }
        }
    }

    fn resync_timer(&self) -> Option<Interval> {
        self.resync_period.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        })
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<T> Informer for SharedInformer<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    async fn run(&self, mut stop: watch::Receiver<bool>) {
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(WatchSource { initial, mut events }) = source else {
            warn!("informer is already running");
            return;
        };

        self.populate(initial);

        let mut resync = self.resync_timer();
        let mut watching = true;
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                event = events.recv(), if watching => match event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("watch channel closed");
                        watching = false;
                    }
                },
                _ = tick(&mut resync) => self.resync(),
            }
        }

        info!("informer stopped");
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
