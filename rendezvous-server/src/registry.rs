//! Live peer registry
//!
//! The registry maps peer ids to the socket address each peer was last
//! seen registering from. Registration is a keep-alive: every
//! REGISTRATION datagram upserts the entry, so a peer whose NAT rebinds
//! or that restarts on a new port silently overwrites its old endpoint
//! (last write wins).
//!
//! Entries are not removed explicitly. A peer that stops re-registering
//! is swept once its entry outlives `REGISTRATION_TTL`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// How long a registration stays valid without a refresh.
///
/// Peers re-register once per retry interval (1s by default), so a live
/// peer never comes close to expiry.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(30);

// ============================================================================
// Registry
// ============================================================================

/// A single registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRegistration {
    /// Peer id, unique in the registry
    pub id: String,
    /// Socket address the last REGISTRATION arrived from
    pub endpoint: SocketAddr,
    /// When the registration was last refreshed
    pub refreshed_at: Instant,
}

/// Registry of live peers, keyed by peer id
pub struct Registry {
    peers: HashMap<String, PeerRegistration>,
    ttl: Duration,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_ttl(REGISTRATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Registry {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Upsert a registration from the given sender address.
    ///
    /// Returns true if this created a new entry rather than refreshing
    /// an existing one.
    pub fn register(&mut self, id: &str, endpoint: SocketAddr, now: Instant) -> bool {
        let registration = PeerRegistration {
            id: id.to_string(),
            endpoint,
            refreshed_at: now,
        };

        match self.peers.insert(id.to_string(), registration) {
            Some(previous) => {
                if previous.endpoint != endpoint {
                    log::info!(
                        "Peer '{}' re-registered from new endpoint {} (was {})",
                        id,
                        endpoint,
                        previous.endpoint
                    );
                } else {
                    log::debug!("Peer '{}' refreshed registration from {}", id, endpoint);
                }
                false
            }
            None => {
                log::info!("Peer '{}' registered from {}", id, endpoint);
                true
            }
        }
    }

    /// Look up a registered peer by id
    pub fn lookup(&self, id: &str) -> Option<&PeerRegistration> {
        self.peers.get(id)
    }

    /// Drop every registration older than the TTL, returning the ids swept
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.refreshed_at) > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.peers.remove(id);
            log::info!("Registration for '{}' expired", id);
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_registration_idempotence() {
        let mut registry = Registry::new();
        let now = Instant::now();
        let endpoint = addr("198.51.100.7:40000");

        assert!(registry.register("alice", endpoint, now));
        assert!(!registry.register("alice", endpoint, now));
        assert!(!registry.register("alice", endpoint, now));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("alice").unwrap().endpoint, endpoint);
    }

    #[test]
    fn test_registration_overwrite() {
        let mut registry = Registry::new();
        let now = Instant::now();

        registry.register("alice", addr("198.51.100.7:40000"), now);
        registry.register("alice", addr("203.0.113.9:41234"), now);

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("alice").unwrap().endpoint,
            addr("203.0.113.9:41234")
        );
    }

    #[test]
    fn test_lookup_absent() {
        let registry = Registry::new();
        assert!(registry.lookup("nobody").is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let mut registry = Registry::with_ttl(Duration::from_secs(30));
        let start = Instant::now();

        registry.register("stale", addr("10.0.0.1:1000"), start);
        registry.register("fresh", addr("10.0.0.2:2000"), start);

        // "fresh" keeps re-registering, "stale" goes quiet.
        let later = start + Duration::from_secs(29);
        registry.register("fresh", addr("10.0.0.2:2000"), later);

        let swept = registry.sweep_expired(start + Duration::from_secs(31));
        assert_eq!(swept, vec!["stale".to_string()]);
        assert!(registry.lookup("stale").is_none());
        assert!(registry.lookup("fresh").is_some());
    }

    #[test]
    fn test_refresh_resets_ttl() {
        let mut registry = Registry::with_ttl(Duration::from_secs(30));
        let start = Instant::now();

        registry.register("alice", addr("10.0.0.1:1000"), start);
        registry.register("alice", addr("10.0.0.1:1000"), start + Duration::from_secs(20));

        assert!(registry
            .sweep_expired(start + Duration::from_secs(40))
            .is_empty());
        assert_eq!(registry.len(), 1);
    }
}
