//! Sync points
//!
//! A [`SyncPoint`] captures the highest request id issued at the moment it is
//! created. Waiting on it returns once every request up to that id reached a
//! terminal state, together with the failures among them. Requests issued
//! afterwards do not delay it.
//!
//! Failures are collected from the start of the current batch, i.e. since
//! the queue was last idle, so a sync point created right after a burst of
//! queued calls sees the failures of that whole burst even if some of them
//! resolved before it was created. Only the most recent `max_queued`
//! failures of a batch are kept for this.

use super::{PipelineEngine, RequestFailure, RequestId, SyncRecord};
use crate::error::{Result, SmaxError};
use std::sync::Arc;
use std::time::Duration;

/// Barrier over every request issued before its creation
pub struct SyncPoint {
    engine: Arc<PipelineEngine>,
    key: u64,
    watermark: RequestId,
}

impl SyncPoint {
    /// Capture the current request watermark
    pub fn new(engine: &Arc<PipelineEngine>) -> Self {
        let mut state = engine.lock();
        let watermark = state.last_issued;
        let failures: Vec<RequestFailure> = state
            .batch_failures
            .iter()
            .filter(|f| f.id <= watermark)
            .cloned()
            .collect();

        state.next_sync_key += 1;
        let key = state.next_sync_key;
        state.sync_points.insert(
            key,
            SyncRecord {
                watermark,
                failures,
            },
        );
        drop(state);

        tracing::trace!("Sync point {} at #{}", key, watermark);
        Self {
            engine: Arc::clone(engine),
            key,
            watermark,
        }
    }

    /// Highest request id this sync point covers
    pub fn watermark(&self) -> RequestId {
        self.watermark
    }

    /// Whether every covered request is terminal
    pub fn is_complete(&self) -> bool {
        self.engine.completed_through() >= self.watermark
    }

    /// Failures recorded so far among the covered requests
    pub fn failures(&self) -> Vec<RequestFailure> {
        self.engine
            .lock()
            .sync_points
            .get(&self.key)
            .map(|record| record.failures.clone())
            .unwrap_or_default()
    }

    /// Block until every covered request is terminal.
    ///
    /// Completion means "all terminal", not "all succeeded": the returned
    /// list holds the covered requests that failed.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<RequestFailure>> {
        self.engine
            .wait_for(self.watermark, timeout)
            .map_err(|e| match e {
                SmaxError::Timeout(msg) => {
                    SmaxError::Timeout(format!("sync point #{}: {}", self.watermark, msg))
                }
                other => other,
            })?;
        Ok(self.failures())
    }

    /// Release the bookkeeping. Dropping the sync point has the same effect.
    pub fn destroy(self) {}
}

impl Drop for SyncPoint {
    fn drop(&mut self) {
        self.engine.lock().sync_points.remove(&self.key);
    }
}

impl std::fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPoint")
            .field("watermark", &self.watermark)
            .finish()
    }
}
