//! Sans-io peer negotiation state machine
//!
//! # State Machine (raw-punch strategy)
//!
//! ```text
//! Idle ──listen()──► Registering ──get_connection_with()──► Requesting
//!                        │                                      │
//!                        │◄── registration timer keeps firing ──┤
//!                        │                                      │
//!                        └───────► receive HANDSHAKE ◄──────────┘
//!                                       │  cancel registration + handshake
//!                                       ▼
//!                                   Punching ── punch timer sends probes
//!                                       │
//!                          receive ACK  │  (any HOLEPUNCH in: reply ACK)
//!                                       ▼
//!                                  Connecting ── initiator retries stream
//!                                       │        connect + "punch"/"ack"
//!                                       ▼        literal handshake
//!                                   Connected
//! ```
//!
//! In the signaling-relay strategy the engine instead hands the
//! negotiation to an external session (WebRTC-style): one handshake
//! request, then candidates flow out as SIGNALING requests and in as
//! SIGNAL messages until the session reports `connect`.
//!
//! The engine performs no I/O. Inputs are method calls (datagrams,
//! timer firings, collaborator events); outputs are `Command`s drained
//! with `poll_command` and `Event`s drained with `poll_event`. All
//! inputs for one socket are handled sequentially, so transitions are
//! race-free; correctness under loss, duplication and reordering
//! between the peers comes from the retry timers and from every
//! duplicate-prone input being idempotent once its stage has passed.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;

use punch_proto::{
    decode_message, encode_message, encode_request, Endpoint, Message, Request, Strategy,
};

use crate::timer::{RetryTimer, StageTimers, DEFAULT_RETRY_INTERVAL};

// ============================================================================
// Literal stream handshake payloads
// ============================================================================

/// Probe written by the initiator once its stream connect completes
pub const STREAM_PROBE: &[u8] = b"punch";

/// Reply confirming the accept side saw the probe
pub const STREAM_PROBE_ACK: &[u8] = b"ack";

// ============================================================================
// Configuration
// ============================================================================

/// Construction inputs for a peer engine
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// This peer's id, as registered at the rendezvous server
    pub id: String,
    /// Rendezvous server endpoint
    pub rendezvous: Endpoint,
    /// Whether this peer initiates the stream connect after punching
    pub initiator: bool,
    /// Connection-establishment strategy
    pub strategy: Strategy,
    /// Interval for all retry timers
    pub retry_interval: Duration,
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, rendezvous: Endpoint) -> Self {
        PeerConfig {
            id: id.into(),
            rendezvous,
            initiator: false,
            strategy: Strategy::RawPunch,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

// ============================================================================
// States, Commands, Events
// ============================================================================

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not listening yet
    Idle,
    /// Registered (and re-registering) with the rendezvous server
    Registering,
    /// Handshake requested for a named remote
    Requesting,
    /// Punch probes in flight to the remote's observed endpoint
    Punching,
    /// Path warmed up; stream-level connect in progress
    Connecting,
    /// Direct connection established (terminal)
    Connected,
    /// Negotiation failed (terminal)
    Failed,
}

/// An I/O action requested by the engine, executed by its driver
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Send a datagram
    Send { payload: Vec<u8>, to: SocketAddr },
    /// Arm the stream transport's acceptor
    AcceptStreams,
    /// Start a fresh stream connect attempt
    ConnectStream { to: SocketAddr },
    /// Write on the established stream
    StreamWrite { data: Vec<u8> },
    /// Construct a negotiation session with the external engine
    CreateSession { initiator: bool },
    /// Hand a relayed candidate payload to the session
    DeliverSignal { payload: Value },
}

/// An observable outcome surfaced to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The direct connection is usable (emitted exactly once)
    Connected,
    /// Terminal failure; the engine must be reconstructed to retry
    Error(EngineError),
}

/// Terminal engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A stage timer hit its attempt cap without progress
    RetriesExhausted { stage: &'static str },
    /// The external negotiation session reported a fault
    Session(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::RetriesExhausted { stage } => {
                write!(f, "{} retries exhausted", stage)
            }
            EngineError::Session(e) => write!(f, "negotiation session error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

// ============================================================================
// Engine
// ============================================================================

/// The remote peer once a handshake has resolved it
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemotePeer {
    id: String,
    endpoint: SocketAddr,
}

/// Sans-io peer negotiation engine
pub struct PeerEngine {
    id: String,
    rendezvous: SocketAddr,
    local: Option<SocketAddr>,
    initiator: bool,
    strategy: Strategy,
    retry_interval: Duration,

    state: EngineState,
    /// At most one remote negotiation at a time
    remote: Option<RemotePeer>,
    /// Remote id named in get_connection_with, before resolution
    requested_remote: Option<String>,
    /// Whether a negotiation session has been created (relay strategy)
    session_active: bool,
    /// Candidates produced before the remote id was known
    pending_signals: Vec<Value>,

    timers: StageTimers,
    commands: VecDeque<Command>,
    events: VecDeque<Event>,
}

impl PeerEngine {
    /// Create an engine from its configuration.
    ///
    /// Fails if the rendezvous endpoint does not resolve to a socket
    /// address.
    pub fn new(config: PeerConfig) -> Result<Self, punch_proto::EndpointError> {
        let rendezvous = config.rendezvous.to_socket_addr()?;
        Ok(PeerEngine {
            id: config.id,
            rendezvous,
            local: None,
            initiator: config.initiator,
            strategy: config.strategy,
            retry_interval: config.retry_interval,
            state: EngineState::Idle,
            remote: None,
            requested_remote: None,
            session_active: false,
            pending_signals: Vec::new(),
            timers: StageTimers::new(),
            commands: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Id of the resolved remote, if a handshake has arrived
    pub fn remote_id(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.id.as_str())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Next command for the driver to execute
    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Next event for the caller
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Earliest pending timer deadline, for the driver's poll timeout
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Record the bound local endpoint, send the first registration and
    /// start the registration keep-alive timer.
    pub fn listen(&mut self, local: SocketAddr, now: Instant) {
        if self.state != EngineState::Idle {
            log::warn!("listen() called twice, ignoring");
            return;
        }

        log::debug!("Socket bound on {}", local);
        self.local = Some(local);
        self.state = EngineState::Registering;
        self.send_registration();
        self.timers.registration = Some(RetryTimer::new(self.retry_interval, now));
    }

    /// Initiate a handshake for the named remote peer.
    pub fn get_connection_with(&mut self, remote_id: &str, now: Instant) {
        if self.state != EngineState::Registering {
            log::warn!(
                "get_connection_with('{}') in state {:?}, ignoring",
                remote_id,
                self.state
            );
            return;
        }

        self.requested_remote = Some(remote_id.to_string());
        self.state = EngineState::Requesting;

        match self.strategy {
            Strategy::RawPunch => {
                // The server drops requests naming an unregistered
                // remote, so this timer is the sole recovery mechanism
                // until the target shows up.
                self.send_handshake_request();
                self.timers.handshake = Some(RetryTimer::new(self.retry_interval, now));
            }
            Strategy::SignalingRelay => {
                // One shot; the relay model does not re-request.
                self.send_handshake_request();
                if !self.session_active {
                    self.session_active = true;
                    self.commands.push_back(Command::CreateSession { initiator: true });
                }
                self.flush_pending_signals();
            }
        }
    }

    // ------------------------------------------------------------------
    // Datagram intake
    // ------------------------------------------------------------------

    /// Handle one inbound datagram. Unparseable payloads are logged and
    /// dropped without touching engine state.
    pub fn handle_datagram(&mut self, payload: &[u8], from: SocketAddr, now: Instant) {
        let message = match decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping undecodable datagram from {}: {}", from, e);
                return;
            }
        };

        match message {
            Message::Handshake { id, endpoint } => self.handle_handshake(id, endpoint, now),
            Message::Holepunch => self.handle_punch_probe(from),
            Message::Ack => self.handle_probe_ack(now),
            Message::Signal { body } => self.handle_signal(body),
            Message::Registration | Message::Payload { .. } => {
                log::debug!("Ignoring unexpected message from {}", from);
            }
        }
    }

    /// Handshake resolution from the rendezvous server.
    ///
    /// An unsolicited handshake (the raw-punch fan-out to the resolved
    /// peer) takes exactly the same path as a solicited one.
    fn handle_handshake(&mut self, id: String, endpoint: Endpoint, now: Instant) {
        match self.state {
            EngineState::Registering | EngineState::Requesting => {}
            _ => {
                log::debug!("Duplicate handshake for '{}' in {:?}, ignoring", id, self.state);
                return;
            }
        }

        let endpoint = match endpoint.to_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Handshake for '{}' carries unusable endpoint: {}", id, e);
                return;
            }
        };

        log::debug!("Handshake resolved '{}' at {}", id, endpoint);

        // A handshake supersedes the earlier stages outright.
        self.timers.registration = None;
        self.timers.handshake = None;
        self.remote = Some(RemotePeer {
            id: id.clone(),
            endpoint,
        });

        match self.strategy {
            Strategy::RawPunch => {
                self.state = EngineState::Punching;
                self.send_punch_probe();
                self.timers.punch = Some(RetryTimer::new(self.retry_interval, now));
            }
            Strategy::SignalingRelay => {
                self.state = EngineState::Requesting;
                if !self.session_active {
                    self.session_active = true;
                    self.commands
                        .push_back(Command::CreateSession { initiator: false });
                }
                self.flush_pending_signals();
            }
        }
    }

    /// A punch probe landed: the path from the sender works, so confirm
    /// it. A passive peer that never probed must still answer, which is
    /// how the listening side vouches for the return path.
    fn handle_punch_probe(&mut self, from: SocketAddr) {
        log::debug!("Punch probe from {}, acknowledging", from);
        self.send_to(&Message::Ack, from);
    }

    /// Both directions are warmed up; move to the stream connect race.
    /// Duplicate ACKs after that are ignored.
    fn handle_probe_ack(&mut self, now: Instant) {
        if self.state != EngineState::Punching {
            log::debug!("ACK in state {:?}, ignoring", self.state);
            return;
        }

        let remote = match self.remote.as_ref() {
            Some(remote) => remote.endpoint,
            None => return,
        };

        log::debug!("Probe acknowledged, starting stream connect");
        self.timers.punch = None;
        self.state = EngineState::Connecting;
        self.commands.push_back(Command::AcceptStreams);

        if self.initiator {
            self.commands.push_back(Command::ConnectStream { to: remote });
            self.timers.connect = Some(RetryTimer::new(self.retry_interval, now));
        }
    }

    /// Relayed candidate payload for the negotiation session.
    fn handle_signal(&mut self, body: Value) {
        if self.strategy != Strategy::SignalingRelay {
            log::debug!("Signal received under raw-punch strategy, ignoring");
            return;
        }

        // A signal can arrive before any handshake: the counterpart
        // started negotiating first. That out-of-band signal triggers
        // this side's session.
        if !self.session_active {
            self.session_active = true;
            self.commands
                .push_back(Command::CreateSession { initiator: false });
        }

        self.commands.push_back(Command::DeliverSignal { payload: body });
    }

    // ------------------------------------------------------------------
    // Timer intake
    // ------------------------------------------------------------------

    /// Fire whichever stage timers are due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut resend_registration = false;
        let mut resend_handshake = false;
        let mut resend_punch = false;
        let mut retry_connect = false;
        let mut exhausted: Option<&'static str> = None;

        let stages: [(&mut Option<RetryTimer>, &'static str, &mut bool); 4] = [
            (
                &mut self.timers.registration,
                "registration",
                &mut resend_registration,
            ),
            (&mut self.timers.handshake, "handshake", &mut resend_handshake),
            (&mut self.timers.punch, "punch", &mut resend_punch),
            (&mut self.timers.connect, "connect", &mut retry_connect),
        ];

        for (slot, stage, resend) in stages {
            if let Some(timer) = slot.as_mut() {
                if timer.is_due(now) {
                    if timer.is_exhausted() {
                        exhausted = Some(stage);
                        break;
                    }
                    timer.record_fire(now);
                    *resend = true;
                }
            }
        }

        if let Some(stage) = exhausted {
            log::warn!("{} retries exhausted, failing negotiation", stage);
            self.fail(EngineError::RetriesExhausted { stage });
            return;
        }

        if resend_registration {
            self.send_registration();
        }
        if resend_handshake {
            self.send_handshake_request();
        }
        if resend_punch {
            self.send_punch_probe();
        }
        if retry_connect {
            // A fresh attempt, not a resume.
            if let Some(remote) = self.remote.as_ref() {
                let to = remote.endpoint;
                self.commands.push_back(Command::ConnectStream { to });
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream transport intake (raw-punch strategy)
    // ------------------------------------------------------------------

    /// A stream connect attempt completed (initiator side).
    pub fn handle_stream_connected(&mut self) {
        if self.state != EngineState::Connecting || !self.initiator {
            return;
        }
        log::debug!("Stream connected, writing probe");
        self.commands.push_back(Command::StreamWrite {
            data: STREAM_PROBE.to_vec(),
        });
    }

    /// A stream connect attempt failed; the connect timer will retry it
    /// wholesale.
    pub fn handle_stream_connect_failed(&mut self, reason: &str) {
        if self.state == EngineState::Connecting {
            log::debug!("Stream connect attempt failed: {}", reason);
        }
    }

    /// Data arrived on the stream.
    ///
    /// Initiator: a literal `"ack"` completes the probe handshake.
    /// Acceptor: the first payload is answered with `"ack"` and the
    /// connection is surfaced.
    pub fn handle_stream_data(&mut self, data: &[u8]) {
        if self.state != EngineState::Connecting {
            return;
        }

        if self.initiator {
            if data == STREAM_PROBE_ACK {
                log::debug!("Probe acknowledged on stream, connection up");
                self.timers.connect = None;
                self.connected();
            }
        } else {
            self.commands.push_back(Command::StreamWrite {
                data: STREAM_PROBE_ACK.to_vec(),
            });
            self.connected();
        }
    }

    // ------------------------------------------------------------------
    // Negotiation session intake (signaling-relay strategy)
    // ------------------------------------------------------------------

    /// The session produced a local candidate; forward it through the
    /// rendezvous server.
    pub fn handle_session_signal(&mut self, payload: Value) {
        let remote_id = self
            .remote
            .as_ref()
            .map(|r| r.id.clone())
            .or_else(|| self.requested_remote.clone());

        match remote_id {
            Some(remote_id) => {
                let request = Request::Signaling {
                    peer_id: self.id.clone(),
                    remote_id,
                    signal: payload,
                };
                self.send_request(&request);
            }
            None => {
                // No addressable counterpart yet; hold the candidate
                // until a handshake names one.
                self.pending_signals.push(payload);
            }
        }
    }

    /// The session reported a usable connection.
    pub fn handle_session_connected(&mut self) {
        if self.state == EngineState::Connected {
            return;
        }
        self.timers.clear();
        self.connected();
    }

    /// The session faulted; forwarded verbatim, negotiation over.
    pub fn handle_session_error(&mut self, error: String) {
        self.fail(EngineError::Session(error));
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn connected(&mut self) {
        if self.state == EngineState::Connected {
            return;
        }
        self.state = EngineState::Connected;
        self.timers.clear();
        self.events.push_back(Event::Connected);
    }

    fn fail(&mut self, error: EngineError) {
        if self.state == EngineState::Failed {
            return;
        }
        self.state = EngineState::Failed;
        self.timers.clear();
        self.events.push_back(Event::Error(error));
    }

    fn flush_pending_signals(&mut self) {
        let held = std::mem::take(&mut self.pending_signals);
        for payload in held {
            self.handle_session_signal(payload);
        }
    }

    fn send_registration(&mut self) {
        let request = Request::Registration {
            peer_id: self.id.clone(),
        };
        self.send_request(&request);
    }

    fn send_handshake_request(&mut self) {
        let remote_id = match self.requested_remote.clone() {
            Some(remote_id) => remote_id,
            None => return,
        };
        let request = Request::Holepunch {
            peer_id: self.id.clone(),
            remote_id,
        };
        self.send_request(&request);
    }

    fn send_punch_probe(&mut self) {
        if let Some(remote) = self.remote.as_ref() {
            let to = remote.endpoint;
            log::debug!("Punching toward {}", to);
            self.send_to(&Message::Holepunch, to);
        }
    }

    fn send_request(&mut self, request: &Request) {
        match encode_request(request) {
            Ok(payload) => self.commands.push_back(Command::Send {
                payload,
                to: self.rendezvous,
            }),
            Err(e) => log::error!("Failed to encode request: {}", e),
        }
    }

    fn send_to(&mut self, message: &Message, to: SocketAddr) {
        match encode_message(message) {
            Ok(payload) => self.commands.push_back(Command::Send { payload, to }),
            Err(e) => log::error!("Failed to encode message: {}", e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
