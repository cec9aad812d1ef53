//! Collaborator seams for the peer driver
//!
//! The negotiation engine decides *when* a stream connect or a
//! signaling session is needed; these traits define *what* it talks
//! to. The driver owns one `StreamTransport` implementation (raw-punch
//! strategy) or one `SessionFactory` (signaling-relay strategy) and
//! forwards commands and events between them and the engine.
//!
//! Implementations are expected to be non-blocking: every call returns
//! immediately and outcomes surface later through `poll_event`.

use std::io;
use std::net::SocketAddr;

use serde_json::Value;

// ============================================================================
// Stream transport (raw-punch strategy)
// ============================================================================

/// Outcome of a stream transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An outbound connect attempt completed
    Connected,
    /// An outbound connect attempt failed; a later retry starts fresh
    ConnectFailed(String),
    /// Payload received on the established (or newly accepted) stream
    Data(Vec<u8>),
}

/// A connection-oriented transport multiplexed over the punched UDP
/// socket.
///
/// The transport reuses the engine's local port, so the acceptor and
/// outbound connects share the NAT mapping the punch warmed up. It is
/// reliable and ordered once established; datagram-level loss is its
/// problem, not the engine's.
pub trait StreamTransport {
    /// Start accepting inbound streams on the punched socket
    fn accept(&mut self) -> io::Result<()>;

    /// Start one outbound connect attempt to the remote endpoint
    fn connect(&mut self, to: SocketAddr) -> io::Result<()>;

    /// Write on the current stream
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drain the next pending transport event
    fn poll_event(&mut self) -> Option<StreamEvent>;
}

// ============================================================================
// Negotiation session (signaling-relay strategy)
// ============================================================================

/// Outcome surfaced by an external negotiation session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session produced a local candidate payload to relay
    Signal(Value),
    /// The session established a usable connection
    Connected,
    /// The session faulted; the payload is its own error text
    Error(String),
}

/// One external connectivity-negotiation session (WebRTC-style).
///
/// The engine treats the session's payloads as opaque JSON: whatever
/// `Signal` events it emits are relayed verbatim, and whatever the
/// counterpart relays back is handed to `signal` untouched.
pub trait PeerSession {
    /// Deliver a relayed candidate payload from the counterpart
    fn signal(&mut self, payload: Value);

    /// Drain the next pending session event
    fn poll_event(&mut self) -> Option<SessionEvent>;
}

/// Constructs negotiation sessions on the engine's request
pub trait SessionFactory {
    type Session: PeerSession;

    /// Create a session; the initiator side produces the opening offer
    fn create(&mut self, initiator: bool) -> Self::Session;
}
