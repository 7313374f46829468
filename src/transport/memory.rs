//! In-memory keyed store implementing [`Transport`]
//!
//! This module provides a transport that keeps the whole store in process
//! memory. It is used by the test suite and the benchmarks, and is handy
//! for running code against the client without a server.
//!
//! # Features
//!
//! - **Stored metadata**: every share bumps the variable's serial and records
//!   type, dimensions, timestamp and origin
//! - **Notifications**: shares publish on `smax:<table>:<key>` to matching
//!   subscribed channels and patterns
//! - **Remote writers**: [`MemoryTransport::share_remote`] simulates another
//!   process writing a value
//! - **Fault injection**: pause/resume round trips, fail the next round trip,
//!   drop and restore the connection, close the event stream
//! - **Call accounting**: number of round trips and commands executed
//!
//! # Example
//!
//! ```ignore
//! use smax_client::transport::MemoryTransport;
//!
//! let transport = MemoryTransport::new();
//! transport.share_remote("sensor", &VarRef::parse("weather:temp")?, 21.5f64.encode());
//!
//! transport.pause();
//! // ... enqueue requests; the sender blocks inside execute()
//! transport.disconnect();
//! ```

use super::{
    channel_matches, encode_pull_reply, variable_channel, Command, Reply, Transport,
    TransportEvent,
};
use crate::error::{Result, SmaxError};
use crate::types::{Metadata, Payload, PulledValue, VarRef};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Origin recorded for shares made through this transport
pub const DEFAULT_ORIGIN: &str = "localhost:smax-client";

#[derive(Debug, Default)]
struct StoreState {
    values: HashMap<VarRef, PulledValue>,
    subscriptions: HashSet<String>,
    fail_next: Option<SmaxError>,
}

/// In-memory store and transport
pub struct MemoryTransport {
    store: Mutex<StoreState>,
    origin: String,
    connected: AtomicBool,
    latency: Mutex<Option<Duration>>,

    paused: Mutex<bool>,
    resume: Condvar,
    blocked: AtomicUsize,

    events_tx: Mutex<Option<Sender<TransportEvent>>>,
    events_rx: Receiver<TransportEvent>,

    execute_calls: AtomicU64,
    commands_executed: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty, connected store
    pub fn new() -> Self {
        Self::with_origin(DEFAULT_ORIGIN)
    }

    /// Create an empty, connected store recording `origin` on shares
    pub fn with_origin(origin: impl Into<String>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            store: Mutex::new(StoreState::default()),
            origin: origin.into(),
            connected: AtomicBool::new(true),
            latency: Mutex::new(None),
            paused: Mutex::new(false),
            resume: Condvar::new(),
            blocked: AtomicUsize::new(0),
            events_tx: Mutex::new(Some(tx)),
            events_rx: rx,
            execute_calls: AtomicU64::new(0),
            commands_executed: AtomicU64::new(0),
        }
    }

    /// Add an artificial delay to every round trip
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
        self
    }

    // ==================== Store access ====================

    /// Write a value as another process would, publishing a notification
    pub fn share_remote(&self, origin: &str, var: &VarRef, payload: Payload) -> u64 {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let serial = Self::store_value(&mut store, origin, var, payload);
        self.publish(&store, var, origin);
        serial
    }

    /// Current stored value, bypassing the round trip accounting
    pub fn get(&self, var: &VarRef) -> Option<PulledValue> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .get(var)
            .cloned()
    }

    /// Current serial of a variable (0 when absent)
    pub fn serial(&self, var: &VarRef) -> u64 {
        self.get(var).map(|v| v.meta.serial).unwrap_or(0)
    }

    /// Channels and patterns currently subscribed
    pub fn subscribed_channels(&self) -> Vec<String> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut channels: Vec<String> = store.subscriptions.iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Publish a raw message on a channel, if anyone is subscribed
    pub fn publish_raw(&self, channel: &str, payload: &str) {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if store
            .subscriptions
            .iter()
            .any(|s| channel_matches(s, channel))
        {
            self.emit(TransportEvent::Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    // ==================== Fault injection ====================

    /// Hold every round trip at its start until [`resume`](Self::resume)
    pub fn pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Let held and future round trips proceed
    pub fn resume(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.resume.notify_all();
    }

    /// Number of round trips currently held by [`pause`](Self::pause)
    pub fn blocked_calls(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Make the next round trip fail with `error`
    pub fn fail_next(&self, error: SmaxError) {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_next = Some(error);
    }

    /// Drop the connection: held and future round trips fail with
    /// `ConnectionLost` and a `Disconnected` event is emitted
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("Memory transport disconnected");
            // Server side subscriptions do not survive a dropped connection
            self.store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscriptions
                .clear();
            {
                let _paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
                self.resume.notify_all();
            }
            self.emit(TransportEvent::Disconnected);
        }
    }

    /// Restore the connection and emit a `Connected` event
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::debug!("Memory transport reconnected");
            self.emit(TransportEvent::Connected);
        }
    }

    /// Close the event stream for good
    pub fn close_events(&self) {
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    // ==================== Accounting ====================

    /// Number of `execute` calls that reached the store
    pub fn execute_calls(&self) -> u64 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Number of commands executed across all round trips
    pub fn commands_executed(&self) -> u64 {
        self.commands_executed.load(Ordering::SeqCst)
    }

    // ==================== Internals ====================

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    fn store_value(store: &mut StoreState, origin: &str, var: &VarRef, payload: Payload) -> u64 {
        let serial = store.values.get(var).map(|v| v.meta.serial).unwrap_or(0) + 1;
        let mut meta = Metadata {
            type_tag: payload.type_tag,
            dims: payload.dims,
            timestamp: Utc::now(),
            origin: String::new(),
            serial,
        };
        meta.set_origin(origin);
        store.values.insert(
            var.clone(),
            PulledValue {
                var: var.clone(),
                bytes: payload.bytes,
                meta,
            },
        );
        serial
    }

    fn publish(&self, store: &StoreState, var: &VarRef, origin: &str) {
        let channel = variable_channel(var);
        if store
            .subscriptions
            .iter()
            .any(|s| channel_matches(s, &channel))
        {
            self.emit(TransportEvent::Message {
                channel,
                payload: origin.to_string(),
            });
        }
    }

    fn wait_if_paused(&self) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if !*paused {
            return;
        }
        self.blocked.fetch_add(1, Ordering::SeqCst);
        while *paused && self.connected.load(Ordering::SeqCst) {
            paused = self
                .resume
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.blocked.fetch_sub(1, Ordering::SeqCst);
    }

    fn run(&self, store: &mut StoreState, command: &Command) -> Reply {
        match command {
            Command::Pull(var) => match store.values.get(var) {
                Some(value) => encode_pull_reply(value),
                None => Reply::Nil,
            },
            Command::Share { var, payload } => {
                Self::store_value(store, &self.origin, var, payload.clone());
                self.publish(store, var, &self.origin);
                Reply::Int(1)
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn execute(&self, commands: &[Command]) -> Result<Vec<Reply>> {
        self.wait_if_paused();

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(SmaxError::ConnectionLost(
                "memory transport disconnected".to_string(),
            ));
        }

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = store.fail_next.take() {
            return Err(err);
        }

        self.commands_executed
            .fetch_add(commands.len() as u64, Ordering::SeqCst);
        Ok(commands.iter().map(|c| self.run(&mut store, c)).collect())
    }

    fn subscribe_channel(&self, channel: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SmaxError::ConnectionLost(format!(
                "cannot subscribe to {} while disconnected",
                channel
            )));
        }
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .insert(channel.to_string());
        Ok(())
    }

    fn unsubscribe_channel(&self, channel: &str) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .remove(channel);
        Ok(())
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
