//! Peer-side connection-establishment engine
//!
//! Establishes exactly one direct transport connection to a named
//! remote peer through a rendezvous server, using one of two
//! strategies: raw UDP hole punching followed by a stream-level
//! connect, or opaque signaling relay driven by an external
//! negotiation engine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      peer_engine Structure                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  timer.rs     - Retry timers owned per protocol stage         │
//! │  engine.rs    - Sans-io protocol state machine                │
//! │  transport.rs - Collaborator seams (stream / negotiation)     │
//! │  driver.rs    - mio UDP driver wiring it all together         │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The state machine in `engine.rs` performs no I/O: inbound datagrams,
//! timer firings and collaborator events go in as method calls, and
//! commands (datagram sends, stream connects, session operations) come
//! out of a queue. The driver in `driver.rs` runs that machine over a
//! real socket; tests run it over a simulated lossy network.

pub mod driver;
pub mod engine;
pub mod timer;
pub mod transport;

pub use driver::{DriverError, DriverEvent, NoSessions, NoStreams, PeerConnection, PeerDriver};
pub use engine::{Command, EngineError, EngineState, Event, PeerConfig, PeerEngine};
pub use timer::{RetryTimer, DEFAULT_RETRY_INTERVAL, MAX_RETRY_ATTEMPTS};
pub use transport::{PeerSession, SessionEvent, SessionFactory, StreamEvent, StreamTransport};
