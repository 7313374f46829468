//! Pipelined request engine
//!
//! Pull and share requests are queued locally and sent by a background
//! sender thread in batches, one round trip per batch. Replies are walked
//! back to their requests in order, so reply `i` of a batch always resolves
//! request `i`.
//!
//! # Architecture
//!
//! - [`PipelineEngine`] - Queue, capacity limits, completion watermark and the
//!   sender loop (thread `smax-pipeline`)
//! - [`Handle`] - Blocking handle for one request ([`PullHandle`], [`ShareHandle`])
//! - [`SyncPoint`] - Barrier over every request issued before it was created
//! - [`PipelineStats`] - Throughput, latency and failure accounting
//!
//! # Resolution order
//!
//! For every reply the sender, in order: decodes it, populates the lazy cache
//! entry of the variable (through the registered [`PullObserver`]), delivers
//! the result to the request's responder and finally marks the request
//! terminal, which advances the completion watermark and wakes flushes, sync
//! points and queued callbacks.
//!
//! A result with no responder that turns out to be an error is counted in
//! [`PipelineStats::unconsumed_failures`] and recorded as the last error.
//!
//! # Disconnects
//!
//! Requests in flight when the connection drops fail with `ConnectionLost`.
//! Queued requests are kept and sent after reconnect when
//! `restore_queue_on_reconnect` is set; otherwise they fail as well.

pub mod sync;

pub use sync::SyncPoint;

use crate::config::SmaxConfig;
use crate::error::{Result, SmaxError};
use crate::transport::{decode_pull_reply, decode_share_reply, Command, Reply, Transport};
use crate::types::{Payload, PulledValue, VarRef};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Identifier of a pipelined request, strictly increasing within a session
pub type RequestId = u64;

/// Size of the rolling window for recent round trip times
const RECENT_WINDOW_SIZE: usize = 100;

/// Kind of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Pull,
    Share,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Pull => write!(f, "pull"),
            OpKind::Share => write!(f, "share"),
        }
    }
}

/// A request to send through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read a variable with its metadata
    Pull(VarRef),
    /// Write a variable
    Share { var: VarRef, payload: Payload },
}

impl Operation {
    /// The variable addressed
    pub fn var(&self) -> &VarRef {
        match self {
            Operation::Pull(var) => var,
            Operation::Share { var, .. } => var,
        }
    }

    /// Pull or share
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Pull(_) => OpKind::Pull,
            Operation::Share { .. } => OpKind::Share,
        }
    }

    fn to_command(&self) -> Command {
        match self {
            Operation::Pull(var) => Command::Pull(var.clone()),
            Operation::Share { var, payload } => Command::Share {
                var: var.clone(),
                payload: payload.clone(),
            },
        }
    }

    fn resolve(&self, reply: Reply) -> Result<Response> {
        match self {
            Operation::Pull(var) => decode_pull_reply(var, reply).map(Response::Value),
            Operation::Share { var, .. } => decode_share_reply(var, reply).map(|_| Response::Ack),
        }
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Value returned by a pull
    Value(PulledValue),
    /// Acknowledgement of a share
    Ack,
}

impl Response {
    /// The pulled value, or a decode error for a share acknowledgement
    pub fn into_value(self) -> Result<PulledValue> {
        match self {
            Response::Value(value) => Ok(value),
            Response::Ack => Err(SmaxError::Decode(
                "share acknowledgement delivered to a pull".to_string(),
            )),
        }
    }
}

/// Consumer of a request's result, called exactly once on the sender thread
pub type Responder = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// What an enqueue does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Wait for capacity up to the pipelined read timeout
    Blocking,
    /// Fail with `QueueFull` immediately
    NonBlocking,
}

/// A request that reached a failed terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    pub id: RequestId,
    pub var: VarRef,
    pub kind: OpKind,
    pub error: SmaxError,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}: {}", self.id, self.kind, self.var, self.error)
    }
}

/// Hook receiving every successfully pulled value before it is delivered
pub trait PullObserver: Send + Sync {
    fn observe_pull(&self, value: &PulledValue);
}

// ==================== Handles ====================

struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, result: Result<T>) {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if value.is_none() {
            *value = Some(result);
        }
        self.ready.notify_all();
    }
}

/// Blocking handle on the result of one request
///
/// A timed out [`wait`](Handle::wait) does not cancel the request; the handle
/// can be waited on again.
pub struct Handle<T> {
    id: Option<RequestId>,
    slot: Arc<Slot<T>>,
}

/// Handle on a pipelined pull
pub type PullHandle = Handle<PulledValue>;

/// Handle on a pipelined share
pub type ShareHandle = Handle<()>;

impl<T: Clone> Handle<T> {
    /// A handle that already carries its result (used for unpipelined calls)
    pub fn resolved(result: Result<T>) -> Self {
        let slot = Arc::new(Slot::new());
        slot.fill(result);
        Self { id: None, slot }
    }

    /// Pipeline request id, `None` for results produced without the queue
    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    /// Whether the result is available
    pub fn is_done(&self) -> bool {
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The result, if available, without blocking
    pub fn try_result(&self) -> Option<Result<T>> {
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the result is available or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut value = self
            .slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = value.as_ref() {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SmaxError::Timeout(match self.id {
                    Some(id) => format!("request #{} still pending after {:?}", id, timeout),
                    None => format!("request still pending after {:?}", timeout),
                }));
            }
            value = self
                .slot
                .ready
                .wait_timeout(value, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

// ==================== Stats ====================

/// Statistics for pipeline operation
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Requests accepted into the queue
    pub submitted: u64,
    /// Requests that resolved successfully
    pub completed: u64,
    /// Requests that resolved with an error
    pub failed: u64,
    /// Round trips attempted
    pub batches_sent: u64,
    /// Largest batch sent in one round trip
    pub max_batch: usize,
    /// Failures no responder consumed
    pub unconsumed_failures: u64,
    /// Message of the most recent failure
    pub last_error: Option<String>,

    /// Total round trip time in microseconds
    pub total_round_trip_us: u64,
    /// Minimum round trip time observed (microseconds)
    pub min_round_trip_us: u64,
    /// Maximum round trip time observed (microseconds)
    pub max_round_trip_us: u64,
    /// Rolling window of recent round trip times
    pub recent_round_trips: VecDeque<u64>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            submitted: 0,
            completed: 0,
            failed: 0,
            batches_sent: 0,
            max_batch: 0,
            unconsumed_failures: 0,
            last_error: None,
            total_round_trip_us: 0,
            min_round_trip_us: u64::MAX,
            max_round_trip_us: 0,
            recent_round_trips: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl PipelineStats {
    /// Record one round trip
    pub fn record_batch(&mut self, size: usize, time_us: u64) {
        self.batches_sent += 1;
        self.max_batch = self.max_batch.max(size);
        self.total_round_trip_us += time_us;
        self.min_round_trip_us = self.min_round_trip_us.min(time_us);
        self.max_round_trip_us = self.max_round_trip_us.max(time_us);

        self.recent_round_trips.push_back(time_us);
        if self.recent_round_trips.len() > RECENT_WINDOW_SIZE {
            self.recent_round_trips.pop_front();
        }
    }

    /// Average round trip time in microseconds
    pub fn avg_round_trip_us(&self) -> f64 {
        if self.batches_sent == 0 {
            0.0
        } else {
            self.total_round_trip_us as f64 / self.batches_sent as f64
        }
    }

    /// Average number of requests per round trip
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_sent == 0 {
            0.0
        } else {
            (self.completed + self.failed) as f64 / self.batches_sent as f64
        }
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }

    /// Max minus min over the recent window (microseconds)
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_round_trips.iter().min().copied().unwrap_or(0);
        let max = self.recent_round_trips.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ==================== Engine ====================

struct PendingRequest {
    id: RequestId,
    op: Operation,
    responder: Option<Responder>,
}

struct SyncRecord {
    watermark: RequestId,
    failures: Vec<RequestFailure>,
}

type Barrier = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    last_issued: RequestId,
    /// Every request with an id at or below this is terminal
    completed_through: RequestId,
    /// Terminal ids above the watermark (out of order completions)
    terminal_above: BTreeSet<RequestId>,
    queue: VecDeque<PendingRequest>,
    in_flight: usize,
    /// Failures since the queue was last idle, at most `max_queued` of them
    batch_failures: VecDeque<RequestFailure>,
    sync_points: HashMap<u64, SyncRecord>,
    next_sync_key: u64,
    barriers: BTreeMap<RequestId, Vec<Barrier>>,
    connected: bool,
    epoch: u64,
    running: bool,
    stats: PipelineStats,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.queue.len() + self.in_flight
    }

    fn is_idle(&self) -> bool {
        self.completed_through >= self.last_issued
    }

    fn mark_terminal(&mut self, id: RequestId) {
        if id <= self.completed_through {
            return;
        }
        self.terminal_above.insert(id);
        while self.terminal_above.remove(&(self.completed_through + 1)) {
            self.completed_through += 1;
        }
    }
}

/// The pipelined request engine
pub struct PipelineEngine {
    transport: Arc<dyn Transport>,
    max_queued: usize,
    max_batch_len: usize,
    restore_queue: bool,
    read_timeout: Duration,
    state: Mutex<QueueState>,
    /// Sender waits here for work or a connection
    work: Condvar,
    /// Blocked enqueues wait here for capacity
    capacity: Condvar,
    /// Flushes and sync points wait here for the watermark to advance
    progress: Condvar,
    /// Blocking round trips wait here for a reconnect
    link: Condvar,
    observer: Mutex<Option<Weak<dyn PullObserver>>>,
}

impl PipelineEngine {
    /// Create an engine; call [`start`](Self::start) to spawn the sender
    pub fn new(transport: Arc<dyn Transport>, config: &SmaxConfig) -> Arc<Self> {
        let connected = transport.is_connected();
        Arc::new(Self {
            transport,
            max_queued: config.max_queued,
            max_batch_len: config.max_batch_len,
            restore_queue: config.restore_queue_on_reconnect,
            read_timeout: config.pipe_read_timeout(),
            state: Mutex::new(QueueState {
                last_issued: 0,
                completed_through: 0,
                terminal_above: BTreeSet::new(),
                queue: VecDeque::new(),
                in_flight: 0,
                batch_failures: VecDeque::new(),
                sync_points: HashMap::new(),
                next_sync_key: 0,
                barriers: BTreeMap::new(),
                connected,
                epoch: 0,
                running: true,
                stats: PipelineStats::default(),
            }),
            work: Condvar::new(),
            capacity: Condvar::new(),
            progress: Condvar::new(),
            link: Condvar::new(),
            observer: Mutex::new(None),
        })
    }

    /// Spawn the background sender thread
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("smax-pipeline".to_string())
            .spawn(move || engine.run_sender())?;
        Ok(handle)
    }

    /// Register the hook that sees every pulled value before delivery
    pub fn set_observer(&self, observer: Weak<dyn PullObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Submission ====================

    /// Queue a request. The responder, if any, receives the result exactly
    /// once; it is dropped uncalled when the enqueue itself fails.
    pub fn enqueue(
        &self,
        op: Operation,
        responder: Option<Responder>,
        mode: EnqueueMode,
    ) -> Result<RequestId> {
        let mut state = self.lock();

        if !state.running {
            return Err(SmaxError::ConnectionLost("pipeline is shut down".to_string()));
        }
        if !state.connected && !self.restore_queue {
            return Err(SmaxError::ConnectionLost(format!(
                "cannot queue {} {} while disconnected",
                op.kind(),
                op.var()
            )));
        }

        if state.outstanding() >= self.max_queued {
            if mode == EnqueueMode::NonBlocking {
                return Err(SmaxError::QueueFull {
                    limit: self.max_queued,
                });
            }

            let deadline = Instant::now() + self.read_timeout;
            while state.outstanding() >= self.max_queued {
                if !state.running {
                    return Err(SmaxError::ConnectionLost(
                        "pipeline is shut down".to_string(),
                    ));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(SmaxError::Timeout(format!(
                        "no queue capacity for {} {} after {:?}",
                        op.kind(),
                        op.var(),
                        self.read_timeout
                    )));
                }
                state = self
                    .capacity
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        if state.is_idle() {
            state.batch_failures.clear();
        }

        state.last_issued += 1;
        let id = state.last_issued;
        tracing::trace!("Queued #{} {} {}", id, op.kind(), op.var());
        state.queue.push_back(PendingRequest { id, op, responder });
        state.stats.submitted += 1;
        drop(state);

        self.work.notify_one();
        Ok(id)
    }

    /// Queue a pull and return a blocking handle on it
    pub fn submit_pull(&self, var: VarRef, mode: EnqueueMode) -> Result<PullHandle> {
        let slot: Arc<Slot<PulledValue>> = Arc::new(Slot::new());
        let target = Arc::clone(&slot);
        let responder: Responder = Box::new(move |result| {
            target.fill(result.and_then(Response::into_value))
        });
        let id = self.enqueue(Operation::Pull(var), Some(responder), mode)?;
        Ok(Handle {
            id: Some(id),
            slot,
        })
    }

    /// Queue a share and return a blocking handle on it
    pub fn submit_share(
        &self,
        var: VarRef,
        payload: Payload,
        mode: EnqueueMode,
    ) -> Result<ShareHandle> {
        let slot: Arc<Slot<()>> = Arc::new(Slot::new());
        let target = Arc::clone(&slot);
        let responder: Responder = Box::new(move |result| target.fill(result.map(|_| ())));
        let id = self.enqueue(Operation::Share { var, payload }, Some(responder), mode)?;
        Ok(Handle {
            id: Some(id),
            slot,
        })
    }

    /// Run one operation in its own round trip, bypassing the queue.
    ///
    /// While disconnected this waits for a reconnect (up to the pipe read
    /// timeout) when the queue is restored on reconnect, and fails with
    /// `ConnectionLost` at once otherwise.
    pub fn execute_now(&self, op: Operation) -> Result<Response> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let epoch = self.wait_connected(deadline, &op)?;
            match self.transport.execute(&[op.to_command()]) {
                Err(err) if err.is_connection_lost() && self.restore_queue => {
                    tracing::debug!("{} {} hit a dropped connection", op.kind(), op.var());
                    self.connection_dropped(epoch);
                }
                Err(err) => return Err(err),
                Ok(replies) => return self.resolve_single(&op, replies),
            }
        }
    }

    fn resolve_single(&self, op: &Operation, replies: Vec<Reply>) -> Result<Response> {
        if replies.len() != 1 {
            return Err(SmaxError::Decode(format!(
                "expected 1 reply for {} {}, got {}",
                op.kind(),
                op.var(),
                replies.len()
            )));
        }
        let reply = replies.into_iter().next().unwrap_or(Reply::Nil);
        let result = op.resolve(reply);
        if let Ok(Response::Value(value)) = &result {
            self.observe(value);
        }
        result
    }

    /// Wait until the engine is connected, returning the connection epoch
    fn wait_connected(&self, deadline: Instant, op: &Operation) -> Result<u64> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return Err(SmaxError::ConnectionLost("pipeline is shut down".to_string()));
            }
            if state.connected {
                return Ok(state.epoch);
            }
            if !self.restore_queue {
                return Err(SmaxError::ConnectionLost(format!(
                    "cannot {} {} while disconnected",
                    op.kind(),
                    op.var()
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SmaxError::Timeout(format!(
                    "still disconnected after {:?}, {} {} not sent",
                    self.read_timeout,
                    op.kind(),
                    op.var()
                )));
            }
            state = self
                .link
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // ==================== Completion ====================

    /// Block until every request issued so far is terminal
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let target = self.lock().last_issued;
        self.wait_for(target, timeout)
    }

    /// Block until every request up to `watermark` is terminal
    pub(crate) fn wait_for(&self, watermark: RequestId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.completed_through < watermark {
            let now = Instant::now();
            if now >= deadline {
                let pending = state.outstanding();
                return Err(SmaxError::Timeout(format!(
                    "requests up to #{} not complete after {:?} ({} outstanding)",
                    watermark, timeout, pending
                )));
            }
            state = self
                .progress
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }

    /// Run `callback` once every request submitted before this call is
    /// terminal. Runs immediately on the calling thread when nothing is
    /// pending, otherwise on the sender thread.
    pub fn queue_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.is_idle() {
            drop(state);
            callback();
            return;
        }
        let watermark = state.last_issued;
        state
            .barriers
            .entry(watermark)
            .or_default()
            .push(Box::new(callback));
    }

    fn observe(&self, value: &PulledValue) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.observe_pull(value);
        }
    }

    fn complete(&self, request: PendingRequest, result: Result<Response>, in_flight: bool) {
        if let Ok(Response::Value(value)) = &result {
            self.observe(value);
        }

        let failure = result.as_ref().err().map(|error| RequestFailure {
            id: request.id,
            var: request.op.var().clone(),
            kind: request.op.kind(),
            error: error.clone(),
        });

        let consumed = match request.responder {
            Some(responder) => {
                if catch_unwind(AssertUnwindSafe(|| responder(result))).is_err() {
                    tracing::error!("Responder for request #{} panicked", request.id);
                }
                true
            }
            None => false,
        };

        let ready = {
            let mut state = self.lock();
            if in_flight {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            state.mark_terminal(request.id);

            match failure {
                Some(failure) => {
                    state.stats.failed += 1;
                    state.stats.last_error = Some(failure.to_string());
                    if !consumed {
                        state.stats.unconsumed_failures += 1;
                        tracing::warn!("Unconsumed request failure: {}", failure);
                    }
                    for record in state.sync_points.values_mut() {
                        if record.watermark >= failure.id {
                            record.failures.push(failure.clone());
                        }
                    }
                    state.batch_failures.push_back(failure);
                    if state.batch_failures.len() > self.max_queued {
                        state.batch_failures.pop_front();
                    }
                }
                None => state.stats.completed += 1,
            }

            let first_pending = state.completed_through + 1;
            let later = state.barriers.split_off(&first_pending);
            std::mem::replace(&mut state.barriers, later)
        };

        self.capacity.notify_all();
        self.progress.notify_all();

        for callback in ready.into_values().flatten() {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::error!("Queued callback panicked");
            }
        }
    }

    fn fail_all(&self, requests: Vec<PendingRequest>, error: &SmaxError, in_flight: bool) {
        for request in requests {
            self.complete(request, Err(error.clone()), in_flight);
        }
    }

    // ==================== Sender ====================

    fn next_batch(&self) -> Option<(Vec<PendingRequest>, u64)> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return None;
            }
            if state.connected && !state.queue.is_empty() {
                break;
            }
            state = self
                .work
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let n = self.max_batch_len.min(state.queue.len());
        let batch: Vec<PendingRequest> = state.queue.drain(..n).collect();
        state.in_flight += n;
        Some((batch, state.epoch))
    }

    fn run_sender(&self) {
        tracing::info!(
            "Pipeline sender started (max_queued={}, max_batch={})",
            self.max_queued,
            self.max_batch_len
        );
        while let Some((batch, epoch)) = self.next_batch() {
            self.send_batch(batch, epoch);
        }
        tracing::info!("Pipeline sender stopped");
    }

    fn send_batch(&self, batch: Vec<PendingRequest>, epoch: u64) {
        let n = batch.len();
        let commands: Vec<Command> = batch.iter().map(|r| r.op.to_command()).collect();

        let started = Instant::now();
        let result = self.transport.execute(&commands);
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.lock().stats.record_batch(n, elapsed_us);

        match result {
            Ok(replies) if replies.len() == n => {
                tracing::debug!("Batch of {} resolved in {} us", n, elapsed_us);
                for (request, reply) in batch.into_iter().zip(replies) {
                    let result = request.op.resolve(reply);
                    self.complete(request, result, true);
                }
            }
            Ok(replies) => {
                let err = SmaxError::Decode(format!(
                    "batch of {} commands returned {} replies",
                    n,
                    replies.len()
                ));
                tracing::error!("{}", err);
                self.fail_all(batch, &err, true);
            }
            Err(err) if err.is_connection_lost() => {
                tracing::warn!("Connection lost with {} requests in flight", n);
                self.fail_all(batch, &err, true);
                self.connection_dropped(epoch);
            }
            Err(err) => {
                let err = match err.root() {
                    SmaxError::Transport(_) => err,
                    _ => SmaxError::Transport(err.to_string()),
                };
                tracing::warn!("Batch of {} failed: {}", n, err);
                self.fail_all(batch, &err, true);
            }
        }
    }

    /// The sender saw the connection drop during a round trip started in
    /// `epoch`. Ignored if a reconnect happened meanwhile.
    fn connection_dropped(&self, epoch: u64) {
        let dropped = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }
            state.connected = false;
            if self.restore_queue {
                Vec::new()
            } else {
                state.queue.drain(..).collect()
            }
        };
        self.fail_queued(dropped);
    }

    fn fail_queued(&self, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }
        tracing::warn!(
            "Discarding {} queued requests after disconnect",
            requests.len()
        );
        let err = SmaxError::ConnectionLost("disconnected before the request was sent".to_string());
        self.fail_all(requests, &err, false);
    }

    // ==================== Connection state ====================

    /// The transport reported a disconnect
    pub fn on_disconnect(&self) {
        let dropped = {
            let mut state = self.lock();
            state.connected = false;
            if self.restore_queue {
                if !state.queue.is_empty() {
                    tracing::info!(
                        "Holding {} queued requests until reconnect",
                        state.queue.len()
                    );
                }
                Vec::new()
            } else {
                state.queue.drain(..).collect()
            }
        };
        self.fail_queued(dropped);
    }

    /// The transport reported a (re)connect
    pub fn on_connect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.epoch += 1;
        if !state.queue.is_empty() {
            tracing::info!("Resending {} queued requests", state.queue.len());
        }
        drop(state);
        self.work.notify_all();
        self.link.notify_all();
    }

    /// Stop the sender and fail everything still queued. In-flight requests
    /// finish with their round trip.
    pub fn shutdown(&self) {
        let dropped: Vec<PendingRequest> = {
            let mut state = self.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.queue.drain(..).collect()
        };
        self.work.notify_all();
        self.capacity.notify_all();
        self.link.notify_all();

        let err = SmaxError::ConnectionLost("pipeline shut down".to_string());
        self.fail_all(dropped, &err, false);
    }

    // ==================== Introspection ====================

    /// Snapshot of the statistics
    pub fn stats(&self) -> PipelineStats {
        self.lock().stats.clone()
    }

    /// Reset the statistics
    pub fn reset_stats(&self) {
        self.lock().stats.reset();
    }

    /// Requests queued or in flight
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding()
    }

    /// Requests queued but not yet sent
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Highest id issued so far
    pub fn last_issued(&self) -> RequestId {
        self.lock().last_issued
    }

    /// Every request at or below this id is terminal
    pub fn completed_through(&self) -> RequestId {
        self.lock().completed_through
    }

    /// Whether the engine believes the connection is up
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
