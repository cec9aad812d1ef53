//! Request dispatch
//!
//! One inbound UDP datagram goes in, zero or more outbound datagrams
//! come out. The dispatcher owns the registry and is deliberately free
//! of socket I/O: the event loop in `main.rs` feeds it raw payloads and
//! sends whatever it returns, which keeps every dispatch decision unit
//! testable without a socket.
//!
//! ```text
//! Peer A                   Rendezvous                    Peer B
//!   │                          │                            │
//!   │── REGISTRATION(A) ──────►│  upsert registry, no reply │
//!   │                          │◄────── REGISTRATION(B) ────│
//!   │                          │                            │
//!   │── HOLEPUNCH(A→B) ───────►│                            │
//!   │◄─ HANDSHAKE{B, ep(B)} ───│── HANDSHAKE{A, ep(A)} ────►│   (raw punch only)
//!   │                          │                            │
//!   │── SIGNALING(A→B, blob) ─►│────── SIGNAL{blob} ───────►│
//! ```
//!
//! A malformed datagram, an unknown request tag or a holepunch naming an
//! unregistered peer are all logged and dropped; none of them may stop
//! the dispatch loop.

use std::net::SocketAddr;
use std::time::Instant;

use punch_proto::{decode_request, encode_message, Endpoint, Message, Request, Strategy};

use crate::registry::Registry;

// ============================================================================
// Dispatcher
// ============================================================================

/// Stateful request dispatcher: registry plus the deployment strategy
pub struct Dispatcher {
    registry: Registry,
    strategy: Strategy,
}

impl Dispatcher {
    pub fn new(registry: Registry, strategy: Strategy) -> Self {
        Dispatcher { registry, strategy }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Handle one inbound datagram, returning the datagrams to send.
    pub fn handle_datagram(
        &mut self,
        payload: &[u8],
        sender: SocketAddr,
        now: Instant,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Dropping undecodable datagram from {}: {}", sender, e);
                return Vec::new();
            }
        };

        match request {
            Request::Registration { peer_id } => {
                self.registry.register(&peer_id, sender, now);
                Vec::new()
            }
            Request::Holepunch { peer_id, remote_id } => {
                self.handle_holepunch(&peer_id, &remote_id, sender)
            }
            Request::Signaling {
                remote_id, signal, ..
            } => self.handle_signaling(&remote_id, signal, sender),
        }
    }

    /// Broker a handshake between the requester and a registered remote.
    ///
    /// The requester always learns the remote's endpoint. Only in the
    /// raw-punch strategy does the remote also get a handshake naming
    /// the requester: both sides must start punching at the same time,
    /// whereas the relay strategy lets the callee's own signaling
    /// trigger its side.
    fn handle_holepunch(
        &mut self,
        peer_id: &str,
        remote_id: &str,
        sender: SocketAddr,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let remote = match self.registry.lookup(remote_id) {
            Some(remote) => remote,
            None => {
                // Not queued or retried here; the requester's handshake
                // timer is the only recovery mechanism.
                log::info!(
                    "Holepunch from '{}' names unregistered peer '{}', dropping",
                    peer_id,
                    remote_id
                );
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        let to_requester = Message::Handshake {
            id: remote.id.clone(),
            endpoint: Endpoint::from(remote.endpoint),
        };
        let remote_addr = remote.endpoint;

        match encode_message(&to_requester) {
            Ok(payload) => out.push((payload, sender)),
            Err(e) => {
                log::error!("Failed to encode handshake response: {}", e);
                return Vec::new();
            }
        }

        if self.strategy == Strategy::RawPunch {
            let to_remote = Message::Handshake {
                id: peer_id.to_string(),
                endpoint: Endpoint::from(sender),
            };
            match encode_message(&to_remote) {
                Ok(payload) => out.push((payload, remote_addr)),
                Err(e) => log::error!("Failed to encode handshake fan-out: {}", e),
            }
        }

        log::debug!(
            "Brokered handshake '{}' <-> '{}' ({} datagram(s) out)",
            peer_id,
            remote_id,
            out.len()
        );

        out
    }

    /// Relay an opaque signaling payload verbatim to a registered remote.
    fn handle_signaling(
        &mut self,
        remote_id: &str,
        signal: serde_json::Value,
        sender: SocketAddr,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let remote = match self.registry.lookup(remote_id) {
            Some(remote) => remote,
            None => {
                log::debug!(
                    "Signal from {} for unregistered peer '{}', dropping",
                    sender,
                    remote_id
                );
                return Vec::new();
            }
        };

        let message = Message::Signal { body: signal };
        match encode_message(&message) {
            Ok(payload) => vec![(payload, remote.endpoint)],
            Err(e) => {
                log::error!("Failed to encode signal relay: {}", e);
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
