//! Client session
//!
//! A [`Session`] owns everything the client layer keeps per process: the
//! pipeline engine, the notification registry, the lazy cache and the three
//! background threads driving them. It is opened on a [`Transport`] and
//! stopped by [`Session::shutdown`] or by dropping it.
//!
//! # Threads
//!
//! - `smax-pipeline` - sends queued requests and resolves their replies
//! - `smax-listener` - reads transport events: refreshes the cache, releases
//!   waiters, forwards updates to the dispatcher, reacts to (re)connects
//! - `smax-dispatch` - runs subscription callbacks
//!
//! # Reconnects
//!
//! On `Connected` the session resumes the pipeline (resending the queue when
//! configured to), subscribes every active channel again, marks all cached
//! values stale, sends the shares held in resilient mode and then runs the
//! user's connect hooks. On `Disconnected` it fails or holds the queue,
//! releases waiters with `ConnectionLost` and runs the disconnect hooks.
//!
//! # Example
//!
//! ```ignore
//! use smax_client::{Session, SmaxConfig, VarRef};
//! use smax_client::transport::MemoryTransport;
//! use std::sync::Arc;
//!
//! let session = Session::open(Arc::new(MemoryTransport::new()), SmaxConfig::default())?;
//! let temp = VarRef::parse("weather:temp")?;
//!
//! session.share_value(&temp, &21.5f64)?;
//! let handle = session.queue_pull(&temp)?;
//! let sync = session.create_sync_point();
//! let failures = sync.wait(Duration::from_secs(1))?;
//! let value: f64 = session.lazy_pull_value(&temp)?;
//! ```

use crate::cache::LazyCache;
use crate::codec::{Decode, Encode};
use crate::config::{QueueFullPolicy, SmaxConfig};
use crate::error::{Result, ResultExt, SmaxError};
use crate::notify::{NotifyRegistry, Pattern, SubscriptionId, UpdateCallback};
use crate::pipeline::{
    EnqueueMode, Handle, Operation, PipelineEngine, PipelineStats, PullHandle, RequestId,
    Responder, Response, ShareHandle, SyncPoint,
};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Payload, PulledValue, UpdateEvent, VarRef, SEPARATOR};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the listener checks for shutdown while idle
const LISTENER_POLL: Duration = Duration::from_millis(100);

/// Hook run after a connect or disconnect has been handled
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync + 'static>;

struct SessionInner {
    config: SmaxConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<PipelineEngine>,
    registry: Arc<NotifyRegistry>,
    cache: LazyCache,
    running: AtomicBool,
    connected: AtomicBool,
    connect_hooks: Mutex<Vec<LifecycleHook>>,
    disconnect_hooks: Mutex<Vec<LifecycleHook>>,
    /// Latest value per variable shared while disconnected
    pending_shares: Mutex<BTreeMap<VarRef, Payload>>,
}

impl SessionInner {
    fn run_listener(self: &Arc<Self>, events: Receiver<TransportEvent>) {
        tracing::info!("Event listener started");
        while self.running.load(Ordering::SeqCst) {
            match events.recv_timeout(LISTENER_POLL) {
                Ok(TransportEvent::Message { channel, payload }) => {
                    self.handle_message(&channel, &payload)
                }
                Ok(TransportEvent::Connected) => self.handle_connect(),
                Ok(TransportEvent::Disconnected) => self.handle_disconnect(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Transport event stream closed");
                    self.handle_disconnect();
                    break;
                }
            }
        }
        tracing::info!("Event listener stopped");
    }

    fn handle_message(&self, channel: &str, payload: &str) {
        let event = match self.registry.event_from_message(channel, payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Ignoring message on {}: {}", channel, e);
                return;
            }
        };
        tracing::trace!("Update #{} for {} from {}", event.sequence, event.var, event.origin);

        self.cache.on_update(&event.var);
        self.registry.dispatch(event);
    }

    fn handle_connect(self: &Arc<Self>) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Connected");

        self.engine.on_connect();
        self.registry.resubscribe_all();
        self.cache.mark_all_stale();
        self.send_pending_shares();

        let hooks = self
            .connect_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook();
        }
    }

    fn handle_disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Disconnected");

        self.engine.on_disconnect();
        let released = self.registry.on_disconnect();
        if released > 0 {
            tracing::debug!("Released {} waiters on disconnect", released);
        }

        let hooks = self
            .disconnect_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook();
        }
    }

    /// Queue the held shares without blocking. Shares that do not fit are
    /// held again and retried once the pipeline has drained what is ahead.
    fn send_pending_shares(self: &Arc<Self>) {
        let pending = std::mem::take(
            &mut *self
                .pending_shares
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if pending.is_empty() {
            return;
        }
        tracing::info!("Sending {} shares held while disconnected", pending.len());

        let mut deferred = 0;
        for (var, payload) in pending {
            let op = Operation::Share {
                var: var.clone(),
                payload: payload.clone(),
            };
            match self.engine.enqueue(op, None, EnqueueMode::NonBlocking) {
                Ok(_) => {}
                Err(SmaxError::QueueFull { .. }) => {
                    deferred += 1;
                    self.hold_share(var, payload);
                }
                Err(e) => {
                    tracing::warn!("Could not resend share of {}: {}", var, e);
                    if e.is_connection_lost() {
                        self.hold_share(var, payload);
                    }
                }
            }
        }

        if deferred > 0 {
            tracing::debug!("Queue full, {} held shares wait for capacity", deferred);
            let session = Arc::downgrade(self);
            self.engine.queue_callback(move || {
                if let Some(session) = session.upgrade() {
                    if session.connected.load(Ordering::SeqCst) {
                        session.send_pending_shares();
                    }
                }
            });
        }
    }

    fn hold_share(&self, var: VarRef, payload: Payload) {
        tracing::debug!("Holding share of {} until reconnect", var);
        self.pending_shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(var, payload);
    }

    /// Whether a share should be held instead of sent
    fn should_hold(&self) -> bool {
        self.config.resilient_shares && !self.transport.is_connected()
    }
}

/// An open client session
pub struct Session {
    inner: Arc<SessionInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Start the sender, listener and dispatcher threads on `transport`
    pub fn open(transport: Arc<dyn Transport>, config: SmaxConfig) -> Result<Self> {
        config.validate()?;

        let engine = PipelineEngine::new(Arc::clone(&transport), &config);
        let registry = NotifyRegistry::new(Arc::clone(&transport));
        let cache = LazyCache::new(Arc::clone(&engine), Arc::clone(&registry), &config);
        let events = transport.events();

        let inner = Arc::new(SessionInner {
            connected: AtomicBool::new(transport.is_connected()),
            config,
            transport,
            engine,
            registry,
            cache,
            running: AtomicBool::new(true),
            connect_hooks: Mutex::new(Vec::new()),
            disconnect_hooks: Mutex::new(Vec::new()),
            pending_shares: Mutex::new(BTreeMap::new()),
        });

        let mut threads = Vec::with_capacity(3);
        threads.push(inner.engine.start().context("start pipeline sender")?);
        threads.push(inner.registry.start().context("start dispatcher")?);

        let listener = Arc::clone(&inner);
        let spawned = std::thread::Builder::new()
            .name("smax-listener".to_string())
            .spawn(move || listener.run_listener(events));
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                inner.engine.shutdown();
                inner.registry.close();
                return Err(SmaxError::from(e).with_context("start listener"));
            }
        }

        tracing::info!("Session opened ({})", inner.config);
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// The configuration the session runs with
    pub fn config(&self) -> &SmaxConfig {
        &self.inner.config
    }

    /// Whether the session currently considers itself connected
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn enqueue_mode(&self) -> EnqueueMode {
        match self.inner.config.queue_full_policy {
            QueueFullPolicy::Block => EnqueueMode::Blocking,
            QueueFullPolicy::Fail => EnqueueMode::NonBlocking,
        }
    }

    // ==================== Pulls ====================

    /// Pull a value in its own round trip
    pub fn pull(&self, var: &VarRef) -> Result<PulledValue> {
        self.inner
            .engine
            .execute_now(Operation::Pull(var.clone()))
            .and_then(Response::into_value)
    }

    /// Pull and decode a value in its own round trip
    pub fn pull_value<T: Decode>(&self, var: &VarRef) -> Result<T> {
        T::decode(&self.pull(var)?)
    }

    /// Queue a pull; with the pipeline disabled this is a blocking pull
    /// returning an already resolved handle
    pub fn queue_pull(&self, var: &VarRef) -> Result<PullHandle> {
        if !self.inner.config.pipeline_enabled {
            return Ok(Handle::resolved(self.pull(var)));
        }
        self.inner.engine.submit_pull(var.clone(), self.enqueue_mode())
    }

    /// Queue a pull, failing with `QueueFull` instead of waiting for capacity
    pub fn try_queue_pull(&self, var: &VarRef) -> Result<PullHandle> {
        if !self.inner.config.pipeline_enabled {
            return Ok(Handle::resolved(self.pull(var)));
        }
        self.inner
            .engine
            .submit_pull(var.clone(), EnqueueMode::NonBlocking)
    }

    /// Queue a pull whose result goes to `callback` (on the sender thread).
    ///
    /// Returns the request id, or `None` when the pipeline is disabled and the
    /// callback already ran on this thread.
    pub fn queue_pull_with<F>(&self, var: &VarRef, callback: F) -> Result<Option<RequestId>>
    where
        F: FnOnce(Result<PulledValue>) + Send + 'static,
    {
        if !self.inner.config.pipeline_enabled {
            callback(self.pull(var));
            return Ok(None);
        }
        let responder: Responder =
            Box::new(move |result| callback(result.and_then(Response::into_value)));
        self.inner
            .engine
            .enqueue(Operation::Pull(var.clone()), Some(responder), self.enqueue_mode())
            .map(Some)
    }

    // ==================== Shares ====================

    /// Share a value in its own round trip.
    ///
    /// In resilient mode a share issued while disconnected is held and sent
    /// on reconnect (only the latest value per variable is kept).
    pub fn share(&self, var: &VarRef, payload: Payload) -> Result<()> {
        if self.inner.should_hold() {
            self.inner.hold_share(var.clone(), payload);
            return Ok(());
        }

        let op = Operation::Share {
            var: var.clone(),
            payload: payload.clone(),
        };
        match self.inner.engine.execute_now(op) {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_lost() && self.inner.config.resilient_shares => {
                self.inner.hold_share(var.clone(), payload);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Encode and share a value in its own round trip
    pub fn share_value<T: Encode + ?Sized>(&self, var: &VarRef, value: &T) -> Result<()> {
        self.share(var, value.encode())
    }

    /// Queue a share
    pub fn queue_share(&self, var: &VarRef, payload: Payload) -> Result<ShareHandle> {
        if self.inner.should_hold() {
            self.inner.hold_share(var.clone(), payload);
            return Ok(Handle::resolved(Ok(())));
        }
        if !self.inner.config.pipeline_enabled {
            return Ok(Handle::resolved(self.share(var, payload)));
        }
        self.inner
            .engine
            .submit_share(var.clone(), payload, self.enqueue_mode())
    }

    /// Encode and queue a share
    pub fn queue_share_value<T: Encode + ?Sized>(
        &self,
        var: &VarRef,
        value: &T,
    ) -> Result<ShareHandle> {
        self.queue_share(var, value.encode())
    }

    /// Queue a share whose outcome goes to `callback` (on the sender thread)
    pub fn queue_share_with<F>(
        &self,
        var: &VarRef,
        payload: Payload,
        callback: F,
    ) -> Result<Option<RequestId>>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self.inner.should_hold() || !self.inner.config.pipeline_enabled {
            callback(self.share(var, payload));
            return Ok(None);
        }
        let responder: Responder = Box::new(move |result| callback(result.map(|_| ())));
        self.inner
            .engine
            .enqueue(
                Operation::Share {
                    var: var.clone(),
                    payload,
                },
                Some(responder),
                self.enqueue_mode(),
            )
            .map(Some)
    }

    /// Shares held while disconnected, waiting to be sent
    pub fn pending_shares(&self) -> usize {
        self.inner
            .pending_shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ==================== Pipeline control ====================

    /// Capture a barrier over every request issued so far
    pub fn create_sync_point(&self) -> SyncPoint {
        SyncPoint::new(&self.inner.engine)
    }

    /// Block until every request issued so far is terminal
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.engine.flush(timeout)
    }

    /// Run `callback` once every request issued before this call is terminal
    pub fn queue_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.engine.queue_callback(callback);
    }

    /// Pipeline statistics snapshot
    pub fn stats(&self) -> PipelineStats {
        self.inner.engine.stats()
    }

    /// Requests queued or in flight
    pub fn outstanding(&self) -> usize {
        self.inner.engine.outstanding()
    }

    // ==================== Lazy cache ====================

    /// Cached read; pulls only when the variable is missing or stale
    pub fn lazy_pull(&self, var: &VarRef) -> Result<PulledValue> {
        self.inner.cache.lazy_pull(var)
    }

    /// Cached read, decoded
    pub fn lazy_pull_value<T: Decode>(&self, var: &VarRef) -> Result<T> {
        T::decode(&self.inner.cache.lazy_pull(var)?)
    }

    /// Start caching a variable without waiting for its value
    pub fn prefetch(&self, var: &VarRef) -> Result<()> {
        self.inner.cache.prefetch(var)
    }

    /// Cached value without a round trip, possibly stale
    pub fn peek(&self, var: &VarRef) -> Option<PulledValue> {
        self.inner.cache.peek(var)
    }

    /// Updates seen since the variable started being cached
    pub fn update_count(&self, var: &VarRef) -> Option<u64> {
        self.inner.cache.update_count(var)
    }

    /// Stop caching a variable
    pub fn end_lazy(&self, var: &VarRef) -> bool {
        self.inner.cache.end(var)
    }

    /// Stop caching everything; returns how many entries were removed
    pub fn flush_lazy(&self) -> usize {
        self.inner.cache.flush()
    }

    /// The lazy cache
    pub fn cache(&self) -> &LazyCache {
        &self.inner.cache
    }

    // ==================== Notifications ====================

    /// Subscribe a callback to updates selected by `pattern`
    pub fn subscribe<F>(&self, pattern: Pattern, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        self.inner.registry.subscribe(pattern, Some(callback))
    }

    /// Subscribe without a callback, e.g. to make updates visible to waits
    pub fn watch(&self, pattern: Pattern) -> Result<SubscriptionId> {
        self.inner.registry.subscribe(pattern, None)
    }

    /// Remove a subscription; its callback never runs after this returns
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    /// Remove every subscription with `pattern`, or all of them
    pub fn unsubscribe_all(&self, pattern: Option<&Pattern>) -> usize {
        self.inner.registry.unsubscribe_all(pattern)
    }

    /// Block until any subscribed variable is updated
    pub fn wait_on_any(&self, timeout: Duration) -> Result<UpdateEvent> {
        self.inner.registry.wait_on(Pattern::Any, timeout)
    }

    /// Block until `var` is updated (requires a matching subscription)
    pub fn wait_on_variable(&self, var: &VarRef, timeout: Duration) -> Result<UpdateEvent> {
        self.inner
            .registry
            .wait_on(Pattern::Variable(var.clone()), timeout)
    }

    /// Block until a variable in `group` is updated (requires a matching
    /// subscription)
    pub fn wait_on_group(&self, group: &str, timeout: Duration) -> Result<UpdateEvent> {
        self.inner
            .registry
            .wait_on(Pattern::Group(group.to_string()), timeout)
    }

    /// Block until a variable named `key` in any table is updated (requires
    /// a matching subscription)
    pub fn wait_on_key(&self, key: &str, timeout: Duration) -> Result<UpdateEvent> {
        if key.is_empty() || key.contains(SEPARATOR) {
            return Err(SmaxError::InvalidName(format!(
                "'{}' is not a variable key",
                key
            )));
        }
        self.inner
            .registry
            .wait_on(Pattern::Key(key.to_string()), timeout)
    }

    /// Release every blocked wait with `Interrupted`
    pub fn release_waits(&self) -> usize {
        self.inner.registry.release_waits()
    }

    // ==================== Control ====================

    /// Share a command to `var` and return the value another process writes
    /// to `reply` in response.
    ///
    /// The wait for the reply starts before the command is sent. Fails with
    /// `Timeout` when no reply update arrives within `timeout`.
    pub fn control(
        &self,
        var: &VarRef,
        payload: Payload,
        reply: &VarRef,
        timeout: Duration,
    ) -> Result<PulledValue> {
        let subscription = self.watch(Pattern::Variable(reply.clone()))?;
        let result = self.exchange(var, payload, reply, timeout);
        self.unsubscribe(subscription);
        result
    }

    /// Encode a command, send it with [`control`](Self::control) and decode
    /// the reply
    pub fn control_value<C, R>(
        &self,
        var: &VarRef,
        command: &C,
        reply: &VarRef,
        timeout: Duration,
    ) -> Result<R>
    where
        C: Encode + ?Sized,
        R: Decode,
    {
        R::decode(&self.control(var, command.encode(), reply, timeout)?)
    }

    fn exchange(
        &self,
        var: &VarRef,
        payload: Payload,
        reply: &VarRef,
        timeout: Duration,
    ) -> Result<PulledValue> {
        let pending = self
            .inner
            .registry
            .arm_wait(Pattern::Variable(reply.clone()));
        self.share(var, payload)
            .with_context(|| format!("sending control command to {}", var))?;
        pending
            .wait(timeout)
            .with_context(|| format!("waiting for reply on {}", reply))?;
        self.pull(reply)
    }

    // ==================== Lifecycle ====================

    /// Run `hook` after every (re)connect has been handled
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .connect_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Run `hook` after every disconnect has been handled
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .disconnect_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Stop the background threads. Queued requests fail with
    /// `ConnectionLost`; blocked waits are released with `Interrupted`.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down session");

        self.inner.engine.shutdown();
        self.inner.registry.close();

        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Background thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
