//! mio-based UDP driver for the peer engine
//!
//! Owns the socket, the poll loop slice, and the collaborators, and
//! shuttles between them and the sans-io state machine:
//!
//! ```text
//!   socket readable ──► engine.handle_datagram
//!   poll timeout    ──► engine.handle_timeout
//!   transport event ──► engine.handle_stream_*
//!   session event   ──► engine.handle_session_*
//!
//!   engine command  ──► send_to / transport / session factory
//!   engine event    ──► DriverEvent for the caller
//! ```
//!
//! The driver is cooperative rather than a captive loop: each
//! `poll_once` call runs one poll cycle and returns the events it
//! produced, so callers embed it in their own loop.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use punch_proto::{Strategy, MAX_DATAGRAM_SIZE};

use crate::engine::{Command, EngineError, Event, PeerConfig, PeerEngine};
use crate::transport::{PeerSession, SessionEvent, SessionFactory, StreamEvent, StreamTransport};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the punched UDP socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Driver Events
// ============================================================================

/// Which path produced the established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnection {
    /// Raw punch: the stream transport holds the connection
    Direct,
    /// Signaling relay: the negotiation session holds the connection
    Negotiated,
}

/// Outcome surfaced by one `poll_once` cycle
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The connection to the remote peer is usable
    Connected(PeerConnection),
    /// Negotiation failed terminally
    Failed(EngineError),
}

// ============================================================================
// Driver
// ============================================================================

/// Runs a `PeerEngine` over a real UDP socket.
pub struct PeerDriver<T, F>
where
    T: StreamTransport,
    F: SessionFactory,
{
    engine: PeerEngine,
    poll: Poll,
    socket: Option<UdpSocket>,
    transport: T,
    factory: F,
    session: Option<F::Session>,
    recv_buf: Vec<u8>,
}

impl<T, F> PeerDriver<T, F>
where
    T: StreamTransport,
    F: SessionFactory,
{
    pub fn new(config: PeerConfig, transport: T, factory: F) -> Result<Self, DriverError> {
        let engine = PeerEngine::new(config)?;
        let poll = Poll::new()?;

        Ok(PeerDriver {
            engine,
            poll,
            socket: None,
            transport,
            factory,
            session: None,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// The engine, for state inspection
    pub fn engine(&self) -> &PeerEngine {
        &self.engine
    }

    /// Locally bound address once `listen` has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.local_addr()
    }

    /// Bind the UDP socket and start registering with the rendezvous
    /// server. The stream transport (if any) shares this socket's port.
    pub fn listen(&mut self, bind: SocketAddr) -> Result<SocketAddr, DriverError> {
        let mut socket = UdpSocket::bind(bind)?;
        let local = socket.local_addr()?;

        self.poll
            .registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        self.socket = Some(socket);

        self.engine.listen(local, Instant::now());
        self.pump()?;
        Ok(local)
    }

    /// Request a connection to the named remote peer.
    pub fn get_connection_with(&mut self, remote_id: &str) -> Result<(), DriverError> {
        self.engine.get_connection_with(remote_id, Instant::now());
        self.pump()
    }

    /// Run one poll cycle: wait for socket readiness or the next engine
    /// deadline (bounded by `max_wait`), feed everything into the
    /// engine, execute its commands, and return the events produced.
    pub fn poll_once(&mut self, max_wait: Option<Duration>) -> Result<Vec<DriverEvent>, DriverError> {
        let now = Instant::now();
        let engine_wait = self
            .engine
            .poll_timeout()
            .map(|deadline| deadline.saturating_duration_since(now));
        let timeout = match (engine_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let mut events = Events::with_capacity(16);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            if event.token() == SOCKET_TOKEN {
                self.read_socket()?;
            }
        }

        self.engine.handle_timeout(Instant::now());
        self.pump()?;

        let strategy = self.engine.strategy();
        let mut out = Vec::new();
        while let Some(event) = self.engine.poll_event() {
            out.push(match event {
                Event::Connected => DriverEvent::Connected(match strategy {
                    Strategy::RawPunch => PeerConnection::Direct,
                    Strategy::SignalingRelay => PeerConnection::Negotiated,
                }),
                Event::Error(e) => DriverEvent::Failed(e),
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_socket(&mut self) -> Result<(), DriverError> {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return Ok(()),
        };

        loop {
            let (len, from) = match socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Socket-fatal: close and surface; the caller decides
                // whether to rebuild the driver.
                Err(e) => {
                    log::error!("Socket receive failed: {}", e);
                    self.socket = None;
                    return Err(e.into());
                }
            };

            let payload = self.recv_buf[..len].to_vec();
            self.engine.handle_datagram(&payload, from, Instant::now());
        }

        Ok(())
    }

    /// Feed collaborator events into the engine and execute its
    /// commands, until a full pass moves nothing. Executing a command
    /// may synchronously produce a collaborator event, hence the loop.
    fn pump(&mut self) -> Result<(), DriverError> {
        loop {
            let mut moved = false;

            while let Some(event) = self.transport.poll_event() {
                moved = true;
                match event {
                    StreamEvent::Connected => self.engine.handle_stream_connected(),
                    StreamEvent::ConnectFailed(reason) => {
                        self.engine.handle_stream_connect_failed(&reason)
                    }
                    StreamEvent::Data(data) => self.engine.handle_stream_data(&data),
                }
            }

            if let Some(session) = self.session.as_mut() {
                while let Some(event) = session.poll_event() {
                    moved = true;
                    match event {
                        SessionEvent::Signal(payload) => self.engine.handle_session_signal(payload),
                        SessionEvent::Connected => self.engine.handle_session_connected(),
                        SessionEvent::Error(e) => self.engine.handle_session_error(e),
                    }
                }
            }

            while let Some(command) = self.engine.poll_command() {
                moved = true;
                self.execute(command)?;
            }

            if !moved {
                return Ok(());
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<(), DriverError> {
        match command {
            Command::Send { payload, to } => {
                if let Some(socket) = self.socket.as_ref() {
                    match socket.send_to(&payload, to) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            // Dropped like any lost datagram; the retry
                            // timers resend.
                            log::debug!("Send to {} would block, dropping", to);
                        }
                        Err(e) => log::warn!("Failed to send to {}: {}", to, e),
                    }
                }
            }
            Command::AcceptStreams => {
                if let Err(e) = self.transport.accept() {
                    log::error!("Stream accept failed: {}", e);
                }
            }
            Command::ConnectStream { to } => {
                if let Err(e) = self.transport.connect(to) {
                    self.engine.handle_stream_connect_failed(&e.to_string());
                }
            }
            Command::StreamWrite { data } => {
                if let Err(e) = self.transport.write(&data) {
                    log::error!("Stream write failed: {}", e);
                }
            }
            Command::CreateSession { initiator } => {
                self.session = Some(self.factory.create(initiator));
            }
            Command::DeliverSignal { payload } => match self.session.as_mut() {
                Some(session) => session.signal(payload),
                None => log::error!("Signal delivery with no active session"),
            },
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Driver construction or I/O failure
#[derive(Debug)]
pub enum DriverError {
    Io(io::Error),
    Endpoint(punch_proto::EndpointError),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Io(e) => write!(f, "I/O error: {}", e),
            DriverError::Endpoint(e) => write!(f, "Endpoint error: {}", e),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Io(e)
    }
}

impl From<punch_proto::EndpointError> for DriverError {
    fn from(e: punch_proto::EndpointError) -> Self {
        DriverError::Endpoint(e)
    }
}

// ============================================================================
// Null collaborators
// ============================================================================

/// Stream transport for drivers that only use the relay strategy
pub struct NoStreams;

impl StreamTransport for NoStreams {
    fn accept(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no stream transport"))
    }

    fn connect(&mut self, _to: SocketAddr) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no stream transport"))
    }

    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no stream transport"))
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        None
    }
}

/// Session factory for drivers that only use the raw-punch strategy
pub struct NoSessions;

/// Placeholder session; `NoSessions` never constructs one at runtime
pub struct NoSession;

impl PeerSession for NoSession {
    fn signal(&mut self, _payload: serde_json::Value) {}

    fn poll_event(&mut self) -> Option<SessionEvent> {
        None
    }
}

impl SessionFactory for NoSessions {
    type Session = NoSession;

    fn create(&mut self, _initiator: bool) -> NoSession {
        log::error!("Session requested but no session factory configured");
        NoSession
    }
}

// ============================================================================
// Tests
// ============================================================================
