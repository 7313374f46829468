//! Behaviour switches selected in [`SmaxConfig`](super::SmaxConfig)
//!
//! # Main Types
//!
//! - [`RefreshMode`] - How the lazy cache reacts to update notifications
//! - [`QueueFullPolicy`] - What an enqueue does when the pipeline is at capacity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How cached variables are refreshed after an update notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Queue a background pull through the pipeline as soon as the
    /// notification arrives; readers wait for it to land
    #[default]
    Eager,
    /// Only mark the entry stale; the next reader pulls synchronously
    Lazy,
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshMode::Eager => write!(f, "eager"),
            RefreshMode::Lazy => write!(f, "lazy"),
        }
    }
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(RefreshMode::Eager),
            "lazy" => Ok(RefreshMode::Lazy),
            other => Err(format!("unknown refresh mode '{}'", other)),
        }
    }
}

/// Behaviour of a default enqueue when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Suspend the caller until capacity frees or the read timeout elapses
    #[default]
    Block,
    /// Return `QueueFull` immediately
    Fail,
}

impl fmt::Display for QueueFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueFullPolicy::Block => write!(f, "block"),
            QueueFullPolicy::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for QueueFullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(QueueFullPolicy::Block),
            "fail" => Ok(QueueFullPolicy::Fail),
            other => Err(format!("unknown queue-full policy '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(RefreshMode::default(), RefreshMode::Eager);
        assert_eq!(QueueFullPolicy::default(), QueueFullPolicy::Block);
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("LAZY".parse::<RefreshMode>().unwrap(), RefreshMode::Lazy);
        assert_eq!("fail".parse::<QueueFullPolicy>().unwrap(), QueueFullPolicy::Fail);
        assert!("sometimes".parse::<RefreshMode>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&RefreshMode::Lazy).unwrap();
        assert_eq!(json, "\"lazy\"");
        let policy: QueueFullPolicy = serde_json::from_str("\"fail\"").unwrap();
        assert_eq!(policy, QueueFullPolicy::Fail);
    }
}
