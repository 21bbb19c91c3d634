//! Idle connections kept for reuse by later jobs to the same host.
//!
//! A checkout moves the connection out of the pool, so a connection is never
//! reachable from two jobs at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::endpoint::{Endpoint, EndpointId};

struct IdleConnection {
    endpoint: Box<dyn Endpoint>,
    since: Instant,
}

/// Thread-safe pool of idle, connected endpoints keyed by identity.
#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<EndpointId, Vec<IdleConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle connection to `id`, if there is one.
    pub fn checkout(&self, id: &EndpointId) -> Option<Box<dyn Endpoint>> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let slot = idle.get_mut(id)?;
        let connection = slot.pop();
        if slot.is_empty() {
            idle.remove(id);
        }
        let connection = connection?;
        debug!(endpoint = %id, "Reusing idle connection");
        Some(connection.endpoint)
    }

    /// Return a connection. Disconnected endpoints are dropped instead.
    pub fn checkin(&self, mut endpoint: Box<dyn Endpoint>) {
        if !endpoint.is_connected() {
            endpoint.disconnect();
            return;
        }
        let id = endpoint.id().clone();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.entry(id).or_default().push(IdleConnection {
            endpoint,
            since: Instant::now(),
        });
    }

    pub fn idle_count(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.values().map(Vec::len).sum()
    }

    /// Disconnect connections idle for longer than `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) {
        let expired: Vec<Box<dyn Endpoint>> = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            let mut expired = Vec::new();
            for slot in idle.values_mut() {
                let (old, fresh): (Vec<_>, Vec<_>) = slot
                    .drain(..)
                    .partition(|c| c.since.elapsed() >= max_idle);
                *slot = fresh;
                expired.extend(old.into_iter().map(|c| c.endpoint));
            }
            idle.retain(|_, slot| !slot.is_empty());
            expired
        };

        // Disconnecting may block on the network, so it happens unlocked.
        if !expired.is_empty() {
            info!(count = expired.len(), "Reaped idle connections");
        }
        for mut endpoint in expired {
            endpoint.disconnect();
        }
    }

    pub fn disconnect_all(&self) {
        self.reap_idle(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryServer;

    #[test]
    fn test_checkout_moves_connection_out() {
        let server = MemoryServer::new();
        let mut endpoint = server.endpoint("host");
        endpoint.connect().unwrap();
        let id = endpoint.id().clone();

        let pool = ConnectionPool::new();
        pool.checkin(Box::new(endpoint));
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.checkout(&id).expect("idle connection");
        assert!(reused.is_connected());
        assert!(pool.checkout(&id).is_none());
    }

    #[test]
    fn test_disconnected_endpoints_are_not_pooled() {
        let server = MemoryServer::new();
        let pool = ConnectionPool::new();
        pool.checkin(Box::new(server.endpoint("host")));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_other_identity_not_reused() {
        let server = MemoryServer::new();
        let mut endpoint = server.endpoint("host-a");
        endpoint.connect().unwrap();
        let pool = ConnectionPool::new();
        pool.checkin(Box::new(endpoint));

        let other = server.endpoint("host-b");
        assert!(pool.checkout(other.id()).is_none());
    }

    #[test]
    fn test_reap_disconnects() {
        let server = MemoryServer::new();
        let mut endpoint = server.endpoint("host");
        endpoint.connect().unwrap();
        let pool = ConnectionPool::new();
        pool.checkin(Box::new(endpoint));

        pool.disconnect_all();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(server.disconnects(), 1);
    }
}
