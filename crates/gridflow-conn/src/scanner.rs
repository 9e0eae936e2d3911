//! Liveness scan across a set of connections.
//!
//! The scheduler periodically sweeps its registered worker connections to
//! find peers that went away without a graceful shutdown message. The sweep
//! must not block and must not consume bytes that the connections' own read
//! loops will want, so it is a peek-only inspection.

use std::sync::Arc;

use crate::connection::Connection;

/// Report which connections have been closed by their peer.
///
/// Returns one boolean per connection, in input order: `true` where the peer
/// has closed its end, `false` otherwise. Non-blocking and peek-only; safe
/// to call while each connection's read loop is outstanding. On platforms
/// without a non-blocking peek every connection reports `false`.
#[must_use]
pub fn scan_for_disconnects(connections: &[Arc<Connection>]) -> Vec<bool> {
    connections
        .iter()
        .map(|conn| conn.is_disconnected())
        .collect()
}
