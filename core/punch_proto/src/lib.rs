//! Wire vocabulary for the rendezvous hole-punching protocol
//!
//! This crate defines everything that crosses a socket between peers and
//! the rendezvous server:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     punch_proto Structure                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  endpoint.rs  - Endpoint value type (host, port, family)      │
//! │  message.rs   - Request/Message enums and the JSON codec      │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every datagram payload is a single self-describing JSON document whose
//! `type` field is a small integer tag, always present and always the
//! first thing a receiver inspects.

pub mod endpoint;
pub mod message;

pub use endpoint::{AddressFamily, Endpoint, EndpointError};
pub use message::{
    decode_message,
    decode_request,
    encode_message,
    encode_request,
    DecodeError,
    EncodeError,
    Message,
    Request,
    MAX_DATAGRAM_SIZE,
};

/// Connection-establishment strategy, fixed per deployment.
///
/// `RawPunch` drives UDP probe exchange followed by a stream-level
/// connect on the warmed-up path; `SignalingRelay` lets the rendezvous
/// server forward opaque candidate payloads between the two peers while
/// an external negotiation engine does the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RawPunch,
    SignalingRelay,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "punch" => Ok(Strategy::RawPunch),
            "relay" => Ok(Strategy::SignalingRelay),
            other => Err(format!("unknown strategy '{}', expected 'punch' or 'relay'", other)),
        }
    }
}
