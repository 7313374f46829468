//! Lazy cache of shared variables
//!
//! The first [`LazyCache::lazy_pull`] of a variable pulls it, creates a cache
//! entry and subscribes to the variable's update channel. Later reads are
//! served from memory until an update notification marks the entry stale.
//!
//! # Refresh policy
//!
//! - [`RefreshMode::Eager`]: a notification immediately queues a background
//!   pull through the pipeline; readers arriving meanwhile wait for it.
//! - [`RefreshMode::Lazy`]: a notification only marks the entry stale; the
//!   next reader pulls synchronously.
//!
//! Refreshes are single flight: while one is outstanding for a variable,
//! every other reader of that variable waits for its outcome instead of
//! issuing its own pull. A failed refresh keeps the previous value, leaves
//! the entry stale and reports the error to the readers that waited for it.
//!
//! # Update counting
//!
//! Each entry counts the updates observed since it was created. Stored
//! serials increase by one per write, so a pipelined pull bringing a newer
//! serial into a fresh entry counts the serial difference and absorbs the
//! notifications still on their way; every update is counted once.

use crate::config::{RefreshMode, SmaxConfig};
use crate::error::{Result, SmaxError};
use crate::notify::{NotifyRegistry, Pattern, SubscriptionId};
use crate::pipeline::{EnqueueMode, Operation, PipelineEngine, PullObserver, Responder, Response};
use crate::types::{PulledValue, VarRef};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct EntryState {
    value: Option<PulledValue>,
    stale: bool,
    refreshing: bool,
    /// An update arrived while a refresh was outstanding
    rerun: bool,
    update_count: u64,
    /// Updates already counted from a pulled serial, awaiting their notification
    absorbed: u64,
    /// Bumped at the end of every refresh
    generation: u64,
    last_error: Option<SmaxError>,
    ended: bool,
}

struct CacheEntry {
    var: VarRef,
    subscription: SubscriptionId,
    state: Mutex<EntryState>,
    changed: Condvar,
}

impl CacheEntry {
    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn into_value(result: Result<Response>) -> Result<PulledValue> {
    result.and_then(Response::into_value)
}

struct CacheInner {
    engine: Arc<PipelineEngine>,
    registry: Arc<NotifyRegistry>,
    mode: RefreshMode,
    read_timeout: Duration,
    entries: Mutex<HashMap<VarRef, Arc<CacheEntry>>>,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<VarRef, Arc<CacheEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, var: &VarRef) -> Option<Arc<CacheEntry>> {
        self.entries().get(var).cloned()
    }

    fn get_or_create(&self, var: &VarRef) -> Result<Arc<CacheEntry>> {
        if let Some(entry) = self.get(var) {
            return Ok(entry);
        }

        // Subscribing may hit the network; the map stays unlocked meanwhile
        let subscription = self
            .registry
            .subscribe(Pattern::Variable(var.clone()), None)?;

        let mut entries = self.entries();
        if let Some(existing) = entries.get(var) {
            let existing = Arc::clone(existing);
            drop(entries);
            // Lost the race to another reader
            self.registry.unsubscribe(subscription);
            return Ok(existing);
        }

        let entry = Arc::new(CacheEntry {
            var: var.clone(),
            subscription,
            state: Mutex::new(EntryState::default()),
            changed: Condvar::new(),
        });
        entries.insert(var.clone(), Arc::clone(&entry));
        tracing::debug!("Lazy cache entry created for {}", var);
        Ok(entry)
    }

    fn read(self: &Arc<Self>, entry: &Arc<CacheEntry>) -> Result<PulledValue> {
        let deadline = Instant::now() + self.read_timeout;
        let mut waited_on: Option<u64> = None;
        let mut state = entry.lock();

        loop {
            if let Some(value) = &state.value {
                if !state.stale && !state.refreshing {
                    return Ok(value.clone());
                }
            }

            if state.refreshing {
                waited_on.get_or_insert(state.generation);
                let now = Instant::now();
                if now >= deadline {
                    return Err(SmaxError::Timeout(format!(
                        "refresh of {} still outstanding after {:?}",
                        entry.var, self.read_timeout
                    )));
                }
                state = entry
                    .changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            // The refresh we waited for failed: share its outcome
            if let (Some(seen), Some(err)) = (waited_on, &state.last_error) {
                if state.generation > seen {
                    return Err(err.clone());
                }
            }

            state.refreshing = true;
            drop(state);

            let result = into_value(self.engine.execute_now(Operation::Pull(entry.var.clone())));
            self.finish_refresh(entry, result.clone());
            return result;
        }
    }

    fn finish_refresh(self: &Arc<Self>, entry: &Arc<CacheEntry>, result: Result<PulledValue>) {
        let mut state = entry.lock();
        state.refreshing = false;
        state.generation += 1;

        match result {
            Ok(value) => {
                state.value = Some(value);
                state.stale = false;
                state.last_error = None;
            }
            Err(err) => {
                tracing::warn!("Refresh of {} failed: {}", entry.var, err);
                state.stale = true;
                state.last_error = Some(err);
            }
        }

        let rerun = std::mem::take(&mut state.rerun);
        if rerun {
            state.stale = true;
        }
        let again = rerun && self.mode == RefreshMode::Eager && !state.ended;
        if again {
            state.refreshing = true;
        }
        drop(state);
        entry.changed.notify_all();

        if again {
            let _ = self.schedule_refresh(entry);
        }
    }

    /// Queue a background pull for an entry already marked refreshing
    fn schedule_refresh(self: &Arc<Self>, entry: &Arc<CacheEntry>) -> Result<()> {
        let cache = Arc::clone(self);
        let target = Arc::clone(entry);
        let responder: Responder = Box::new(move |result| {
            cache.finish_refresh(&target, into_value(result));
        });

        match self.engine.enqueue(
            Operation::Pull(entry.var.clone()),
            Some(responder),
            EnqueueMode::NonBlocking,
        ) {
            Ok(id) => {
                tracing::trace!("Queued refresh #{} for {}", id, entry.var);
                Ok(())
            }
            Err(err) => {
                // Leave it stale; the next reader refreshes synchronously
                tracing::debug!("Could not queue refresh of {}: {}", entry.var, err);
                entry.lock().refreshing = false;
                entry.changed.notify_all();
                Err(err)
            }
        }
    }

    fn on_update(self: &Arc<Self>, var: &VarRef) {
        let Some(entry) = self.get(var) else {
            return;
        };

        let mut state = entry.lock();
        if state.absorbed > 0 {
            state.absorbed -= 1;
            return;
        }
        state.update_count += 1;
        state.stale = true;

        if state.refreshing {
            state.rerun = true;
            return;
        }
        if self.mode == RefreshMode::Eager && !state.ended {
            state.refreshing = true;
            drop(state);
            let _ = self.schedule_refresh(&entry);
        }
    }

    fn mark_all_stale(self: &Arc<Self>) {
        let entries: Vec<Arc<CacheEntry>> = self.entries().values().cloned().collect();
        for entry in entries {
            let mut state = entry.lock();
            if state.value.is_none() {
                continue;
            }
            state.stale = true;
            state.absorbed = 0;
            if state.refreshing {
                state.rerun = true;
                continue;
            }
            if self.mode == RefreshMode::Eager {
                state.refreshing = true;
                drop(state);
                let _ = self.schedule_refresh(&entry);
            }
        }
    }

    fn remove(&self, entry: &CacheEntry) {
        entry.lock().ended = true;
        entry.changed.notify_all();
        self.registry.unsubscribe(entry.subscription);
    }
}

impl PullObserver for CacheInner {
    fn observe_pull(&self, value: &PulledValue) {
        let Some(entry) = self.get(&value.var) else {
            return;
        };

        let mut state = entry.lock();
        // The refresh itself will install its result
        if state.refreshing {
            return;
        }
        let old_serial = match &state.value {
            Some(old) if value.meta.serial <= old.meta.serial => return,
            Some(old) => Some(old.meta.serial),
            None => None,
        };

        if let Some(old_serial) = old_serial {
            if !state.stale {
                let newer = value.meta.serial - old_serial;
                state.update_count += newer;
                state.absorbed += newer;
            }
        }
        state.value = Some(value.clone());
    }
}

/// Cache of lazily pulled variables
pub struct LazyCache {
    inner: Arc<CacheInner>,
}

impl LazyCache {
    /// Create a cache and register it to see every pulled value
    pub fn new(
        engine: Arc<PipelineEngine>,
        registry: Arc<NotifyRegistry>,
        config: &SmaxConfig,
    ) -> Self {
        let inner = Arc::new(CacheInner {
            engine,
            registry,
            mode: config.refresh_mode,
            read_timeout: config.pipe_read_timeout(),
            entries: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&inner);
        let observer: Weak<dyn PullObserver> = weak;
        inner.engine.set_observer(observer);
        Self { inner }
    }

    /// Refresh policy in effect
    pub fn mode(&self) -> RefreshMode {
        self.inner.mode
    }

    /// Return the cached value, pulling it first if it is missing or stale
    pub fn lazy_pull(&self, var: &VarRef) -> Result<PulledValue> {
        let entry = self.inner.get_or_create(var)?;
        self.inner.read(&entry)
    }

    /// Start caching a variable and queue its first pull without waiting
    pub fn prefetch(&self, var: &VarRef) -> Result<()> {
        let entry = self.inner.get_or_create(var)?;
        let mut state = entry.lock();
        if state.refreshing || (state.value.is_some() && !state.stale) {
            return Ok(());
        }
        state.refreshing = true;
        drop(state);
        self.inner.schedule_refresh(&entry)
    }

    /// Cached value without any round trip, stale or not
    pub fn peek(&self, var: &VarRef) -> Option<PulledValue> {
        self.inner.get(var).and_then(|e| e.lock().value.clone())
    }

    /// Updates observed since the entry was created, `None` if not cached
    pub fn update_count(&self, var: &VarRef) -> Option<u64> {
        self.inner.get(var).map(|e| e.lock().update_count)
    }

    /// Whether the cached value is known to be outdated
    pub fn is_stale(&self, var: &VarRef) -> Option<bool> {
        self.inner.get(var).map(|e| e.lock().stale)
    }

    /// Error of the last failed refresh, if the entry has one
    pub fn last_error(&self, var: &VarRef) -> Option<SmaxError> {
        self.inner.get(var).and_then(|e| e.lock().last_error.clone())
    }

    /// Whether a variable is cached
    pub fn contains(&self, var: &VarRef) -> bool {
        self.inner.entries().contains_key(var)
    }

    /// Stop caching a variable and drop its implicit subscription
    pub fn end(&self, var: &VarRef) -> bool {
        let removed = self.inner.entries().remove(var);
        match removed {
            Some(entry) => {
                self.inner.remove(&entry);
                tracing::debug!("Lazy cache entry ended for {}", var);
                true
            }
            None => false,
        }
    }

    /// End every entry; returns how many were removed
    pub fn flush(&self) -> usize {
        let entries: Vec<Arc<CacheEntry>> = self.inner.entries().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            self.inner.remove(entry);
        }
        entries.len()
    }

    /// Number of cached variables
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// React to an update notification for `var`
    pub fn on_update(&self, var: &VarRef) {
        self.inner.on_update(var);
    }

    /// Updates may have been missed (e.g. after a reconnect)
    pub fn mark_all_stale(&self) {
        self.inner.mark_all_stale();
    }
}
