//! Session and transport construction helpers

use smax_client::transport::MemoryTransport;
use smax_client::{Session, SmaxConfig};
use std::sync::Arc;

/// Open a session on a fresh in-memory store
pub fn open_session(config: SmaxConfig) -> (Arc<MemoryTransport>, Session) {
    open_session_on(MemoryTransport::new(), config)
}

/// Open a session on a prepared in-memory store
pub fn open_session_on(
    transport: MemoryTransport,
    config: SmaxConfig,
) -> (Arc<MemoryTransport>, Session) {
    let transport = Arc::new(transport);
    let session = Session::open(transport.clone(), config).expect("session opens");
    (transport, session)
}
