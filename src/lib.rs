//! # smax-client: shared variables through a central store
//!
//! A client layer that lets many processes share typed, named variables
//! through a central keyed store, hiding network round trips behind
//! batching, caching and event notification.
//!
//! ## Architecture
//!
//! - **Pipeline**: queues pulls and shares, sends them in ordered batches on a
//!   background thread and resolves each request from its reply
//! - **Sync points**: barriers over everything submitted so far
//! - **Lazy cache**: serves repeat reads from memory, refreshing only when the
//!   store reports a change
//! - **Notifications**: callbacks and blocking waits on variables, groups or
//!   anything
//! - **Session**: owns the components above plus the listener thread that
//!   feeds them transport events
//! - **Communication**: Crossbeam channels between the worker threads
//!
//! The network side is the [`Transport`] trait; [`transport::MemoryTransport`]
//! is an in-process store implementing it.
//!
//! ## Configuration
//!
//! [`SmaxConfig`] is read from `config.toml` in the platform config directory
//! under `smax-client`:
//!
//! - **Linux**: `~/.config/smax-client/`
//! - **macOS**: `~/Library/Application Support/smax-client/`
//! - **Windows**: `%APPDATA%\smax-client\`
//!
//! ## Example
//!
//! ```ignore
//! use smax_client::{logging, Pattern, Session, SmaxConfig, VarRef};
//! use smax_client::transport::MemoryTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> smax_client::Result<()> {
//!     logging::init(logging::DEFAULT_FILTER)?;
//!
//!     let config = SmaxConfig::load_or_default();
//!     let session = Session::open(Arc::new(MemoryTransport::new()), config)?;
//!
//!     let temp = VarRef::parse("weather:temp")?;
//!     session.subscribe(Pattern::Group("weather".into()), |event| {
//!         println!("{} updated by {}", event.var, event.origin);
//!     })?;
//!
//!     session.queue_share_value(&temp, &21.5f64)?;
//!     let pending = session.queue_pull(&temp)?;
//!     session.create_sync_point().wait(Duration::from_secs(1))?;
//!
//!     let value: f64 = session.lazy_pull_value(&temp)?;
//!     println!("{} = {} ({:?})", temp, value, pending.try_result());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use cache::LazyCache;
pub use codec::{Decode, Encode};
pub use config::{QueueFullPolicy, RefreshMode, SmaxConfig};
pub use error::{Result, ResultExt, SmaxError};
pub use notify::{NotifyRegistry, Pattern, PendingWait, SubscriptionId};
pub use pipeline::{
    EnqueueMode, Operation, PipelineEngine, PipelineStats, PullHandle, RequestFailure,
    RequestId, ShareHandle, SyncPoint,
};
pub use session::Session;
pub use transport::{Transport, TransportEvent};
pub use types::{Metadata, Payload, PulledValue, TypeTag, UpdateEvent, VarRef};
