use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use trp_common::Session;

/// Shared registry of live control sessions
/// Maps client address -> session
pub type SessionRegistry = Arc<DashMap<SocketAddr, Arc<Session>>>;

/// Create a new session registry
pub fn new_session_registry() -> SessionRegistry {
    Arc::new(DashMap::new())
}

/// Close every registered session, returning how many were closed
pub fn close_all_sessions(registry: &SessionRegistry) -> usize {
    // Collect first so no shard lock is held while sessions tear down
    let sessions: Vec<Arc<Session>> = registry.iter().map(|entry| entry.value().clone()).collect();
    for session in &sessions {
        session.close();
    }
    registry.clear();
    sessions.len()
}
