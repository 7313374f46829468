//! Transport interface for the keyed store
//!
//! This module provides the seam between the client layer and whatever
//! actually talks to the store. The client needs very little from it:
//! ordered batch execution of commands in one round trip, channel
//! (un)subscription, and a stream of inbound messages and connection
//! state changes.
//!
//! Connection management, authentication and reconnect policy belong to the
//! implementation; the client only reacts to the [`TransportEvent`]s it
//! emits. A closed event stream is treated as a disconnect.
//!
//! # Channels
//!
//! Update notifications are published on `smax:<table>:<key>`. Group, key
//! and catch-all subscriptions use the glob patterns `smax:<group>:*`,
//! `smax:*:<key>` and `smax:*`; see [`variable_channel`], [`group_channel`],
//! [`key_channel`] and [`any_channel`].
//!
//! # Pull replies
//!
//! A pull returns six components: value, type, dimensions, timestamp,
//! origin and serial. [`decode_pull_reply`] turns them into a
//! [`PulledValue`].

pub mod memory;

pub use memory::MemoryTransport;

use crate::error::{Result, SmaxError};
use crate::types::{Metadata, Payload, PulledValue, TypeTag, VarRef, SEPARATOR};
use crossbeam_channel::Receiver;

/// Prefix of every update notification channel
pub const NOTIFY_PREFIX: &str = "smax";

/// Number of components in a pull reply
pub const PULL_REPLY_COMPONENTS: usize = 6;

/// A single command sent to the store
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Read a value together with its metadata
    Pull(VarRef),
    /// Write a value and publish an update notification
    Share { var: VarRef, payload: Payload },
}

impl Command {
    /// The variable the command addresses
    pub fn var(&self) -> &VarRef {
        match self {
            Command::Pull(var) => var,
            Command::Share { var, .. } => var,
        }
    }
}

/// A single reply from the store
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// No value
    Nil,
    /// Integer reply
    Int(i64),
    /// Byte string reply
    Bulk(Vec<u8>),
    /// Multi-component reply
    Array(Vec<Reply>),
    /// Error reported by the store for this command
    Error(String),
}

impl Reply {
    /// Convenience constructor for text replies
    pub fn text(s: impl AsRef<str>) -> Self {
        Reply::Bulk(s.as_ref().as_bytes().to_vec())
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Bulk(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// Inbound event from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message published on a subscribed channel
    Message { channel: String, payload: String },
    /// The connection (re)established
    Connected,
    /// The connection dropped
    Disconnected,
}

/// Connection to the keyed store
///
/// Implementations must be `Send + Sync`; the pipeline sender, the event
/// listener and caller threads use the same transport concurrently.
///
/// # Example
///
/// ```ignore
/// fn pull_two(t: &dyn Transport, a: VarRef, b: VarRef) -> Result<Vec<Reply>> {
///     t.execute(&[Command::Pull(a), Command::Pull(b)])
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Execute a batch of commands in one round trip.
    ///
    /// Returns one reply per command, in command order. A dropped connection
    /// must be reported as [`SmaxError::ConnectionLost`].
    fn execute(&self, commands: &[Command]) -> Result<Vec<Reply>>;

    /// Subscribe to a channel or glob pattern
    fn subscribe_channel(&self, channel: &str) -> Result<()>;

    /// Unsubscribe from a channel or glob pattern
    fn unsubscribe_channel(&self, channel: &str) -> Result<()>;

    /// Stream of inbound messages and connection changes
    fn events(&self) -> Receiver<TransportEvent>;

    /// Check if the transport is currently connected
    fn is_connected(&self) -> bool;
}

// ==================== Channel naming ====================

/// Notification channel of a single variable
pub fn variable_channel(var: &VarRef) -> String {
    format!("{}{}{}", NOTIFY_PREFIX, SEPARATOR, var.id())
}

/// Notification pattern covering a group and its nested groups
pub fn group_channel(group: &str) -> String {
    format!("{}{}{}{}*", NOTIFY_PREFIX, SEPARATOR, group, SEPARATOR)
}

/// Notification pattern covering every variable
pub fn any_channel() -> String {
    format!("{}{}*", NOTIFY_PREFIX, SEPARATOR)
}

/// Recover the variable from a notification channel name
pub fn parse_channel(channel: &str) -> Result<VarRef> {
    let id = channel
        .strip_prefix(NOTIFY_PREFIX)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .ok_or_else(|| {
            SmaxError::InvalidName(format!("'{}' is not a notification channel", channel))
        })?;
    VarRef::parse(id)
}

/// Notification pattern covering a key in any table
pub fn key_channel(key: &str) -> String {
    format!("{}{}*{}{}", NOTIFY_PREFIX, SEPARATOR, SEPARATOR, key)
}

/// Check a published channel against a subscribed channel or glob pattern.
///
/// `*` matches any run of characters, separators included.
pub fn channel_matches(subscribed: &str, channel: &str) -> bool {
    let mut parts = subscribed.split('*');
    let Some(first) = parts.next() else {
        return subscribed == channel;
    };
    let Some(mut rest) = channel.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

// ==================== Reply decoding ====================

/// Decode the reply to a [`Command::Pull`]
pub fn decode_pull_reply(var: &VarRef, reply: Reply) -> Result<PulledValue> {
    let items = match reply {
        Reply::Nil => return Err(SmaxError::NotFound(var.id())),
        Reply::Error(msg) => return Err(SmaxError::Transport(format!("{}: {}", var, msg))),
        Reply::Array(items) => items,
        other => {
            return Err(SmaxError::Decode(format!(
                "{}: expected {} components, got {:?}",
                var, PULL_REPLY_COMPONENTS, other
            )))
        }
    };

    if items.len() != PULL_REPLY_COMPONENTS {
        return Err(SmaxError::Decode(format!(
            "{}: expected {} components, got {}",
            var,
            PULL_REPLY_COMPONENTS,
            items.len()
        )));
    }

    let mut items = items.into_iter();
    let mut next = || items.next().unwrap_or(Reply::Nil);

    let bytes = match next() {
        Reply::Nil => return Err(SmaxError::NotFound(var.id())),
        Reply::Bulk(bytes) => bytes,
        Reply::Error(msg) => return Err(SmaxError::Transport(format!("{}: {}", var, msg))),
        other => {
            return Err(SmaxError::Decode(format!(
                "{}: unexpected value component {:?}",
                var, other
            )))
        }
    };

    let component = |reply: Reply, what: &str| -> Result<String> {
        match reply {
            Reply::Bulk(_) => reply
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| SmaxError::Decode(format!("{}: {} is not UTF-8", var, what))),
            Reply::Int(i) => Ok(i.to_string()),
            Reply::Nil => Ok(String::new()),
            other => Err(SmaxError::Decode(format!(
                "{}: unexpected {} component {:?}",
                var, what, other
            ))),
        }
    };

    let type_text = component(next(), "type")?;
    let type_tag = if type_text.is_empty() {
        TypeTag::Raw
    } else {
        type_text.parse::<TypeTag>()?
    };
    let dims = Metadata::parse_dims(&component(next(), "dims")?)?;
    let timestamp_text = component(next(), "timestamp")?;
    let timestamp = if timestamp_text.is_empty() {
        chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
    } else {
        Metadata::parse_timestamp(&timestamp_text)?
    };
    let origin = component(next(), "origin")?;
    let serial_text = component(next(), "serial")?;
    let serial = if serial_text.is_empty() {
        0
    } else {
        serial_text
            .trim()
            .parse::<u64>()
            .map_err(|_| SmaxError::Decode(format!("{}: invalid serial '{}'", var, serial_text)))?
    };

    let mut meta = Metadata {
        type_tag,
        dims,
        timestamp,
        origin: String::new(),
        serial,
    };
    meta.set_origin(&origin);

    Ok(PulledValue {
        var: var.clone(),
        bytes,
        meta,
    })
}

/// Decode the reply to a [`Command::Share`]
pub fn decode_share_reply(var: &VarRef, reply: Reply) -> Result<()> {
    match reply {
        Reply::Error(msg) => Err(SmaxError::Transport(format!("{}: {}", var, msg))),
        _ => Ok(()),
    }
}

/// Build the reply a store sends for a pull (used by transports and tests)
pub fn encode_pull_reply(value: &PulledValue) -> Reply {
    Reply::Array(vec![
        Reply::Bulk(value.bytes.clone()),
        Reply::text(value.meta.type_tag.as_str()),
        Reply::text(Metadata::format_dims(&value.meta.dims)),
        Reply::text(Metadata::format_timestamp(&value.meta.timestamp)),
        Reply::text(&value.meta.origin),
        Reply::Int(value.meta.serial as i64),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn var(id: &str) -> VarRef {
        VarRef::parse(id).unwrap()
    }

    fn sample_reply(serial: i64) -> Reply {
        Reply::Array(vec![
            Reply::text("21.5"),
            Reply::text("float64"),
            Reply::text("1"),
            Reply::text("1700000000.5"),
            Reply::text("host:proc"),
            Reply::Int(serial),
        ])
    }

    #[test]
    fn test_decode_pull_reply() {
        let v = decode_pull_reply(&var("weather:temp"), sample_reply(7)).unwrap();
        assert_eq!(v.bytes, b"21.5".to_vec());
        assert_eq!(v.meta.type_tag, TypeTag::Float64);
        assert_eq!(v.meta.dims, vec![1]);
        assert_eq!(v.meta.serial, 7);
        assert_eq!(v.meta.origin, "host:proc");
        assert_eq!(v.meta.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_decode_pull_reply_errors() {
        let v = var("weather:temp");
        assert!(matches!(
            decode_pull_reply(&v, Reply::Nil),
            Err(SmaxError::NotFound(_))
        ));
        assert!(matches!(
            decode_pull_reply(&v, Reply::Error("ERR".into())),
            Err(SmaxError::Transport(_))
        ));
        assert!(matches!(
            decode_pull_reply(&v, Reply::Int(3)),
            Err(SmaxError::Decode(_))
        ));
        assert!(matches!(
            decode_pull_reply(&v, Reply::Array(vec![Reply::text("1")])),
            Err(SmaxError::Decode(_))
        ));

        let mut bad_type = match sample_reply(1) {
            Reply::Array(items) => items,
            _ => unreachable!(),
        };
        bad_type[1] = Reply::text("complex128");
        assert!(matches!(
            decode_pull_reply(&v, Reply::Array(bad_type)),
            Err(SmaxError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_share_reply() {
        let v = var("a:b");
        assert!(decode_share_reply(&v, Reply::Int(1)).is_ok());
        assert!(decode_share_reply(&v, Reply::Error("READONLY".into())).is_err());
    }

    #[test]
    fn test_encode_decode_pull_reply() {
        let original = decode_pull_reply(&var("a:b"), sample_reply(3)).unwrap();
        let decoded = decode_pull_reply(&var("a:b"), encode_pull_reply(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_channel_names() {
        let v = var("weather:station1:temp");
        assert_eq!(variable_channel(&v), "smax:weather:station1:temp");
        assert_eq!(group_channel("weather"), "smax:weather:*");
        assert_eq!(any_channel(), "smax:*");
        assert_eq!(key_channel("temp"), "smax:*:temp");
        assert_eq!(parse_channel("smax:weather:station1:temp").unwrap(), v);
        assert!(parse_channel("other:weather:temp").is_err());
    }

    #[test]
    fn test_channel_matches() {
        assert!(channel_matches("smax:*", "smax:a:b"));
        assert!(channel_matches("smax:a:*", "smax:a:b:c"));
        assert!(!channel_matches("smax:a:*", "smax:ab:c"));
        assert!(channel_matches("smax:a:b", "smax:a:b"));
        assert!(!channel_matches("smax:a:b", "smax:a:bc"));
        assert!(channel_matches("smax:*:temp", "smax:a:b:temp"));
        assert!(!channel_matches("smax:*:temp", "smax:a:xtemp"));
        assert!(!channel_matches("smax:*:temp", "smax:temp"));
        assert!(channel_matches("smax:*:b:*", "smax:a:b:c"));
    }

    #[test]
    fn test_mock_transport_error_passthrough() {
        let mut mock = MockTransport::new();
        mock.expect_execute()
            .returning(|_| Err(SmaxError::ConnectionLost("reset by peer".into())));
        mock.expect_is_connected().return_const(false);

        let err = mock.execute(&[Command::Pull(var("a:b"))]).unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!mock.is_connected());
    }

    proptest! {
        #[test]
        fn prop_channel_roundtrip(
            groups in proptest::collection::vec("[a-z][a-z0-9_]{0,8}", 1..4),
            key in "[a-z][a-z0-9_]{0,8}",
        ) {
            let table = groups.join(":");
            let v = VarRef::new(table.clone(), key).unwrap();
            let channel = variable_channel(&v);
            prop_assert_eq!(parse_channel(&channel).unwrap(), v.clone());
            prop_assert!(channel_matches(&any_channel(), &channel));
            prop_assert!(channel_matches(&group_channel(&groups[0]), &channel));
            prop_assert!(channel_matches(&key_channel(v.key()), &channel));
        }
    }
}
