//! Notification registry
//!
//! Callers can register callbacks for, or block on, updates of specific
//! variables, whole groups, or anything at all.
//!
//! # Architecture
//!
//! ```text
//!  listener thread                         dispatcher thread
//! ┌──────────────────────┐   (event,     ┌──────────────────────┐
//! │ dispatch(event)      │    matching)  │ invoke callbacks in  │
//! │  - release waiters   │ ───────────►  │ subscription order   │
//! │  - snapshot matches  │   crossbeam   │ skip unsubscribed    │
//! └──────────────────────┘               └──────────────────────┘
//! ```
//!
//! Slow callbacks therefore never stall intake of further notifications.
//!
//! # Lifecycle
//!
//! A subscription goes `subscribed -> (notified)* -> unsubscribed`. Once
//! [`NotifyRegistry::unsubscribe`] returns, the callback is never invoked
//! again: events already queued for it are dropped, and a call in progress
//! on the dispatcher thread is waited for (unless `unsubscribe` is itself
//! called from a callback, which would deadlock).
//!
//! # Channels
//!
//! Transport channels are reference counted. The first subscription needing
//! a channel subscribes it on the transport, the last one leaving
//! unsubscribes it. The lazy cache's implicit subscriptions share the same
//! counts.

pub mod pattern;

pub use pattern::Pattern;

use crate::error::{Result, SmaxError};
use crate::transport::{parse_channel, Transport};
use crate::types::UpdateEvent;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Unique subscription identifier.
///
/// Monotonically assigned by [`NotifyRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked on the dispatcher thread for every matching update
pub type UpdateCallback = Arc<dyn Fn(&UpdateEvent) + Send + Sync + 'static>;

struct Subscriber {
    id: SubscriptionId,
    pattern: Pattern,
    callback: Option<UpdateCallback>,
    active: AtomicBool,
    /// Held by the dispatcher for the duration of each invocation
    invoke: Mutex<()>,
}

struct Waiter {
    pattern: Pattern,
    outcome: Mutex<Option<Result<UpdateEvent>>>,
    released: Condvar,
}

impl Waiter {
    fn release(&self, outcome: Result<UpdateEvent>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.released.notify_all();
    }
}

/// A waiter registered by [`NotifyRegistry::arm_wait`]
pub struct PendingWait<'a> {
    registry: &'a NotifyRegistry,
    waiter: Arc<Waiter>,
}

impl PendingWait<'_> {
    /// Block until the armed pattern is updated or `timeout` passes
    pub fn wait(self, timeout: Duration) -> Result<UpdateEvent> {
        let waiter = &self.waiter;
        let deadline = Instant::now() + timeout;
        let mut outcome = waiter
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            outcome = waiter
                .released
                .wait_timeout(outcome, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(outcome);

        self.registry.remove_waiter(waiter);
        // Released between the deadline and the removal
        if let Some(result) = waiter
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return result;
        }
        Err(SmaxError::Timeout(format!(
            "no update for {} within {:?}",
            waiter.pattern, timeout
        )))
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        self.registry.remove_waiter(&self.waiter);
    }
}

struct Dispatch {
    event: UpdateEvent,
    subscribers: Vec<Arc<Subscriber>>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    /// Ordered by id, i.e. by subscription order
    subscribers: BTreeMap<SubscriptionId, Arc<Subscriber>>,
    channels: HashMap<String, usize>,
    waiters: Vec<Arc<Waiter>>,
}

/// Registry of update subscriptions and waiters
pub struct NotifyRegistry {
    transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
    sequence: AtomicU64,
    dispatch_tx: Mutex<Option<Sender<Dispatch>>>,
    dispatch_rx: Receiver<Dispatch>,
    dispatcher_thread: OnceLock<ThreadId>,
}

impl NotifyRegistry {
    /// Create a registry; call [`start`](Self::start) to spawn the dispatcher
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            transport,
            state: Mutex::new(RegistryState::default()),
            sequence: AtomicU64::new(0),
            dispatch_tx: Mutex::new(Some(tx)),
            dispatch_rx: rx,
            dispatcher_thread: OnceLock::new(),
        })
    }

    /// Spawn the dispatcher thread. It exits after [`close`](Self::close).
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let registry = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("smax-dispatch".to_string())
            .spawn(move || registry.run_dispatcher())?;
        Ok(handle)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Subscriptions ====================

    /// Subscribe to updates selected by `pattern`.
    ///
    /// Without a callback the subscription only keeps the transport channel
    /// open (used for waiters and the lazy cache).
    pub fn subscribe(
        &self,
        pattern: Pattern,
        callback: Option<UpdateCallback>,
    ) -> Result<SubscriptionId> {
        let channel = pattern.channel();
        let mut state = self.lock();

        let count = state.channels.get(&channel).copied().unwrap_or(0);
        if count == 0 {
            match self.transport.subscribe_channel(&channel) {
                Ok(()) => tracing::debug!("Subscribed to {}", channel),
                // Reconnect will resubscribe every counted channel
                Err(e) if e.is_connection_lost() => {
                    tracing::debug!("Deferring subscription to {}: {}", channel, e)
                }
                Err(e) => return Err(e.with_context(format!("subscribe {}", pattern))),
            }
        }
        state.channels.insert(channel, count + 1);

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.insert(
            id,
            Arc::new(Subscriber {
                id,
                pattern,
                callback,
                active: AtomicBool::new(true),
                invoke: Mutex::new(()),
            }),
        );
        Ok(id)
    }

    /// Remove a subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.subscribers.remove(&id);
            if let Some(subscriber) = &removed {
                self.release_channel(&mut state, &subscriber.pattern.channel());
            }
            removed
        };

        match removed {
            Some(subscriber) => {
                self.deactivate(&subscriber);
                true
            }
            None => false,
        }
    }

    /// Remove every subscription with the given pattern, or all of them.
    /// Returns the number removed.
    pub fn unsubscribe_all(&self, pattern: Option<&Pattern>) -> usize {
        let removed: Vec<Arc<Subscriber>> = {
            let mut state = self.lock();
            let ids: Vec<SubscriptionId> = state
                .subscribers
                .values()
                .filter(|s| pattern.map_or(true, |p| &s.pattern == p))
                .map(|s| s.id)
                .collect();
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(subscriber) = state.subscribers.remove(&id) {
                    self.release_channel(&mut state, &subscriber.pattern.channel());
                    removed.push(subscriber);
                }
            }
            removed
        };

        for subscriber in &removed {
            self.deactivate(subscriber);
        }
        removed.len()
    }

    fn release_channel(&self, state: &mut RegistryState, channel: &str) {
        let remaining = match state.channels.get_mut(channel) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.channels.remove(channel);
            if let Err(e) = self.transport.unsubscribe_channel(channel) {
                tracing::warn!("Failed to unsubscribe from {}: {}", channel, e);
            } else {
                tracing::debug!("Unsubscribed from {}", channel);
            }
        }
    }

    fn deactivate(&self, subscriber: &Subscriber) {
        subscriber.active.store(false, Ordering::SeqCst);
        let on_dispatcher = self.dispatcher_thread.get() == Some(&std::thread::current().id());
        if !on_dispatcher {
            // Wait out an invocation already in progress
            drop(
                subscriber
                    .invoke
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
    }

    /// Subscribe every counted channel again on the transport (after reconnect)
    pub fn resubscribe_all(&self) {
        let channels: Vec<String> = self.lock().channels.keys().cloned().collect();
        for channel in channels {
            if let Err(e) = self.transport.subscribe_channel(&channel) {
                tracing::warn!("Failed to resubscribe to {}: {}", channel, e);
            }
        }
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Transport channels currently held, with their reference counts
    pub fn channel_counts(&self) -> HashMap<String, usize> {
        self.lock().channels.clone()
    }

    // ==================== Inbound updates ====================

    /// Turn a transport message into an update event
    pub fn event_from_message(&self, channel: &str, payload: &str) -> Result<UpdateEvent> {
        let var = parse_channel(channel)?;
        Ok(UpdateEvent {
            var,
            origin: payload.to_string(),
            received_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    /// Release matching waiters and queue the event for matching callbacks
    pub fn dispatch(&self, event: UpdateEvent) {
        let subscribers = {
            let mut state = self.lock();

            let (matched, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
                .into_iter()
                .partition(|w| w.pattern.matches(&event.var));
            state.waiters = kept;
            for waiter in matched {
                waiter.release(Ok(event.clone()));
            }

            state
                .subscribers
                .values()
                .filter(|s| s.callback.is_some() && s.pattern.matches(&event.var))
                .cloned()
                .collect::<Vec<_>>()
        };

        if subscribers.is_empty() {
            return;
        }

        let tx = self
            .dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => {
                if tx.send(Dispatch { event, subscribers }).is_err() {
                    tracing::warn!("Dispatcher gone, dropping update");
                }
            }
            None => tracing::debug!("Registry closed, dropping update for {}", event.var),
        }
    }

    fn run_dispatcher(&self) {
        let _ = self.dispatcher_thread.set(std::thread::current().id());
        tracing::info!("Notification dispatcher started");

        for job in self.dispatch_rx.iter() {
            for subscriber in &job.subscribers {
                let Some(callback) = subscriber.callback.as_ref() else {
                    continue;
                };
                let _guard = subscriber
                    .invoke
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if !subscriber.active.load(Ordering::SeqCst) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(&job.event))).is_err() {
                    tracing::error!("Callback of {} panicked on {}", subscriber.id, job.event.var);
                }
            }
        }

        tracing::info!("Notification dispatcher stopped");
    }

    // ==================== Waiting ====================

    /// Block until an update selected by `pattern` arrives.
    ///
    /// Every waiter matching an event is released by it. Fails with
    /// `Timeout`, with `Interrupted` after [`release_waits`](Self::release_waits),
    /// or with `ConnectionLost` when the connection drops.
    pub fn wait_on(&self, pattern: Pattern, timeout: Duration) -> Result<UpdateEvent> {
        self.arm_wait(pattern).wait(timeout)
    }

    /// Register a waiter now and block on it later.
    ///
    /// Updates arriving between this call and [`PendingWait::wait`] are not
    /// missed. Dropping the returned value removes the waiter.
    pub fn arm_wait(&self, pattern: Pattern) -> PendingWait<'_> {
        let waiter = Arc::new(Waiter {
            pattern,
            outcome: Mutex::new(None),
            released: Condvar::new(),
        });
        self.lock().waiters.push(Arc::clone(&waiter));
        PendingWait {
            registry: self,
            waiter,
        }
    }

    fn remove_waiter(&self, waiter: &Arc<Waiter>) {
        self.lock().waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }

    fn release_all(&self, error: SmaxError) -> usize {
        let waiters = std::mem::take(&mut self.lock().waiters);
        for waiter in &waiters {
            waiter.release(Err(error.clone()));
        }
        waiters.len()
    }

    /// Release every blocked waiter with `Interrupted`. Returns how many.
    pub fn release_waits(&self) -> usize {
        self.release_all(SmaxError::Interrupted("waits released".to_string()))
    }

    /// Release every blocked waiter with `ConnectionLost`
    pub fn on_disconnect(&self) -> usize {
        self.release_all(SmaxError::ConnectionLost(
            "disconnected while waiting for an update".to_string(),
        ))
    }

    /// Number of callers currently blocked in a wait
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Stop accepting events; the dispatcher exits once its queue drains
    pub fn close(&self) {
        self.dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.release_all(SmaxError::Interrupted("session closed".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::VarRef;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn var(id: &str) -> VarRef {
        VarRef::parse(id).unwrap()
    }

    fn setup() -> (Arc<MemoryTransport>, Arc<NotifyRegistry>, JoinHandle<()>) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = NotifyRegistry::new(transport.clone());
        let dispatcher = registry.start().unwrap();
        (transport, registry, dispatcher)
    }

    fn event(registry: &NotifyRegistry, id: &str) -> UpdateEvent {
        registry
            .event_from_message(&format!("smax:{}", id), "test")
            .unwrap()
    }

    #[test]
    fn test_channel_reference_counting() {
        let (transport, registry, dispatcher) = setup();
        let p = Pattern::Variable(var("weather:temp"));

        let a = registry.subscribe(p.clone(), None).unwrap();
        let b = registry.subscribe(p.clone(), None).unwrap();
        assert_eq!(transport.subscribed_channels(), vec!["smax:weather:temp"]);
        assert_eq!(registry.channel_counts()["smax:weather:temp"], 2);

        assert!(registry.unsubscribe(a));
        assert_eq!(transport.subscribed_channels().len(), 1);
        assert!(registry.unsubscribe(b));
        assert!(transport.subscribed_channels().is_empty());
        assert!(!registry.unsubscribe(b));

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_callbacks_in_subscription_order() {
        let (_transport, registry, dispatcher) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();

        for tag in ["any", "group", "exact"] {
            let tx = tx.clone();
            let pattern = match tag {
                "any" => Pattern::Any,
                "group" => Pattern::Group("weather".into()),
                _ => Pattern::Variable(var("weather:temp")),
            };
            let cb: UpdateCallback = Arc::new(move |_e: &UpdateEvent| tx.send(tag).unwrap());
            registry.subscribe(pattern, Some(cb)).unwrap();
        }

        registry.dispatch(event(&registry, "weather:temp"));
        let order: Vec<&str> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, vec!["any", "group", "exact"]);

        registry.dispatch(event(&registry, "power:load"));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "any");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_queued_events_dropped_after_unsubscribe() {
        let (_transport, registry, dispatcher) = setup();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let calls = Arc::new(AtomicUsize::new(0));

        // First subscriber blocks the dispatcher until released
        let blocker: UpdateCallback = Arc::new(move |_e: &UpdateEvent| {
            let _ = gate_rx.recv();
        });
        registry.subscribe(Pattern::Any, Some(blocker)).unwrap();

        let counted = calls.clone();
        let cb: UpdateCallback = Arc::new(move |_e: &UpdateEvent| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let id = registry
            .subscribe(Pattern::Variable(var("a:b")), Some(cb))
            .unwrap();

        registry.dispatch(event(&registry, "a:b"));
        registry.dispatch(event(&registry, "a:b"));
        assert!(registry.unsubscribe(id));

        drop(gate_tx);
        registry.close();
        dispatcher.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_from_own_callback() {
        let (_transport, registry, dispatcher) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let cb: UpdateCallback = {
            let registry = Arc::clone(&registry);
            let calls = calls.clone();
            let own_id = own_id.clone();
            Arc::new(move |_e: &UpdateEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock().unwrap() {
                    registry.unsubscribe(id);
                }
            })
        };
        let id = registry.subscribe(Pattern::Any, Some(cb)).unwrap();
        *own_id.lock().unwrap() = Some(id);

        registry.dispatch(event(&registry, "a:b"));
        registry.dispatch(event(&registry, "a:c"));

        let deadline = Instant::now() + WAIT;
        while registry.subscription_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.subscription_count(), 0);

        registry.close();
        dispatcher.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiters_released_together() {
        let (_transport, registry, dispatcher) = setup();

        let spawn_wait = |pattern: Pattern| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.wait_on(pattern, WAIT))
        };
        let exact = spawn_wait(Pattern::Variable(var("weather:temp")));
        let group = spawn_wait(Pattern::Group("weather".into()));
        let unrelated = spawn_wait(Pattern::Variable(var("power:load")));

        while registry.waiter_count() < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        registry.dispatch(event(&registry, "weather:temp"));

        assert_eq!(exact.join().unwrap().unwrap().var, var("weather:temp"));
        assert_eq!(group.join().unwrap().unwrap().var, var("weather:temp"));
        assert_eq!(registry.waiter_count(), 1);

        assert_eq!(registry.release_waits(), 1);
        assert!(matches!(
            unrelated.join().unwrap(),
            Err(SmaxError::Interrupted(_))
        ));

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let (_transport, registry, dispatcher) = setup();
        let err = registry
            .wait_on(Pattern::Any, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SmaxError::Timeout(_)));
        assert_eq!(registry.waiter_count(), 0);

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_armed_wait_sees_earlier_update() {
        let (_transport, registry, dispatcher) = setup();

        let pending = registry.arm_wait(Pattern::Key("temp".into()));
        assert_eq!(registry.waiter_count(), 1);
        registry.dispatch(event(&registry, "weather:station1:temp"));

        let update = pending.wait(Duration::from_millis(20)).unwrap();
        assert_eq!(update.var, var("weather:station1:temp"));
        assert_eq!(registry.waiter_count(), 0);

        drop(registry.arm_wait(Pattern::Any));
        assert_eq!(registry.waiter_count(), 0);

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_subscribe_while_disconnected_is_deferred() {
        let (transport, registry, dispatcher) = setup();
        transport.disconnect();

        registry
            .subscribe(Pattern::Group("weather".into()), None)
            .unwrap();
        assert!(transport.subscribed_channels().is_empty());

        transport.reconnect();
        registry.resubscribe_all();
        assert_eq!(transport.subscribed_channels(), vec!["smax:weather:*"]);

        registry.close();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (_transport, registry, dispatcher) = setup();
        let a = event(&registry, "a:b");
        let b = event(&registry, "a:b");
        assert!(b.sequence > a.sequence);
        assert!(registry.event_from_message("bogus", "x").is_err());

        registry.close();
        dispatcher.join().unwrap();
    }
}
