//! Test data builders for creating test objects

use smax_client::config::{QueueFullPolicy, RefreshMode, SmaxConfig};
use smax_client::{Payload, TypeTag, VarRef};
use std::time::Duration;

/// Parse a variable id, panicking on malformed input
pub fn var(id: &str) -> VarRef {
    VarRef::parse(id).expect("valid variable id")
}

/// Scalar float payload
pub fn float(value: f64) -> Payload {
    Payload::scalar(value.to_string(), TypeTag::Float64)
}

/// Builder for creating test configs
pub struct ConfigBuilder {
    config: SmaxConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SmaxConfig::default(),
        }
    }

    pub fn max_queued(mut self, max_queued: usize) -> Self {
        self.config.max_queued = max_queued;
        self
    }

    pub fn max_batch_len(mut self, max_batch_len: usize) -> Self {
        self.config.max_batch_len = max_batch_len;
        self
    }

    pub fn queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.config.queue_full_policy = policy;
        self
    }

    pub fn restore_queue(mut self, restore: bool) -> Self {
        self.config.restore_queue_on_reconnect = restore;
        self
    }

    pub fn refresh_mode(mut self, mode: RefreshMode) -> Self {
        self.config.refresh_mode = mode;
        self
    }

    pub fn resilient_shares(mut self, resilient: bool) -> Self {
        self.config.resilient_shares = resilient;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.pipe_read_timeout_millis = timeout.as_millis() as u64;
        self
    }

    pub fn pipeline_enabled(mut self, enabled: bool) -> Self {
        self.config.pipeline_enabled = enabled;
        self
    }

    pub fn build(self) -> SmaxConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_queued(50)
            .restore_queue(false)
            .refresh_mode(RefreshMode::Lazy)
            .build();

        assert_eq!(config.max_queued, 50);
        assert!(!config.restore_queue_on_reconnect);
        assert_eq!(config.refresh_mode, RefreshMode::Lazy);
        assert!(config.validate().is_ok());
    }
}
