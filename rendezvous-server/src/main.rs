//! Rendezvous server
//!
//! A UDP server that:
//! - Maintains the live peer registry (REGISTRATION keep-alives)
//! - Brokers handshakes between two registered peers (HOLEPUNCH)
//! - Relays opaque signaling payloads between a peer pair (SIGNALING)
//!
//! It never relays application data; peers use it only to learn each
//! other's observed endpoints and to coordinate a synchronized punch.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

mod dispatch;
mod registry;

use dispatch::Dispatcher;
use punch_proto::Strategy;
use registry::Registry;

// ============================================================================
// Constants
// ============================================================================

/// Default listen port (matches the peers' default rendezvous endpoint)
const DEFAULT_PORT: u16 = 4321;

/// How often expired registrations are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Usage: rendezvous-server [port] [--strategy punch|relay]
    let args: Vec<String> = std::env::args().collect();

    let mut port = DEFAULT_PORT;
    let mut strategy = Strategy::RawPunch;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--strategy" => {
                let value = args
                    .get(i + 1)
                    .ok_or("--strategy requires a value ('punch' or 'relay')")?;
                strategy = value.parse()?;
                i += 2;
            }
            other => {
                port = other.parse().unwrap_or(DEFAULT_PORT);
                i += 1;
            }
        }
    }

    log::info!("Rendezvous server starting...");
    log::info!("  Port:     {}", port);
    log::info!("  Strategy: {:?}", strategy);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let mut server = Server::new(port, strategy)?;
    server.run(&shutdown)
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    /// mio poll instance
    poll: Poll,
    /// UDP socket
    socket: UdpSocket,
    /// Request dispatcher (registry + strategy)
    dispatcher: Dispatcher,
    /// When the registry was last swept
    last_sweep: Instant,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl Server {
    fn new(port: u16, strategy: Strategy) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let mut socket = UdpSocket::bind(addr)?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        log::info!("Server listening on {}", addr);

        Ok(Server {
            poll,
            socket,
            dispatcher: Dispatcher::new(Registry::new(), strategy),
            last_sweep: Instant::now(),
            recv_buf: vec![0u8; punch_proto::MAX_DATAGRAM_SIZE],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("Shutdown signal received, exiting");
                return Ok(());
            }

            let timeout = SWEEP_INTERVAL
                .checked_sub(self.last_sweep.elapsed())
                .unwrap_or(Duration::ZERO);

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.dispatcher.registry_mut().sweep_expired(Instant::now());
                self.last_sweep = Instant::now();
            }
        }
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Socket-fatal: drop the socket and surface the error.
                Err(e) => {
                    log::error!("Socket receive failed: {}", e);
                    return Err(e.into());
                }
            };

            log::trace!("Received {} bytes from {}", len, from);

            let payload = self.recv_buf[..len].to_vec();
            let out = self
                .dispatcher
                .handle_datagram(&payload, from, Instant::now());

            for (datagram, dest) in out {
                match self.socket.send_to(&datagram, dest) {
                    Ok(sent) => log::trace!("Sent {} bytes to {}", sent, dest),
                    // Send failures are per-destination; the peer's own
                    // retries recover, so the loop keeps serving.
                    Err(e) => log::warn!("Failed to send to {}: {}", dest, e),
                }
            }
        }

        Ok(())
    }
}
