//! Endpoint value type
//!
//! An `Endpoint` is the unit of addressing everywhere in the protocol: a
//! host, a port and an address family. It is immutable after
//! construction and reconstructable from its serialized record, so a
//! `Handshake` message can carry a peer's observed public endpoint
//! across the wire and the receiver gets back an equal value.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Address Family
// ============================================================================

/// IP address family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl Default for AddressFamily {
    fn default() -> Self {
        AddressFamily::Ipv4
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// An immutable (host, port, family) address value.
///
/// Serializes as `{"host": ..., "port": ..., "family": ...}`.
/// Deserialization fails if `host` or `port` is absent and defaults the
/// family to IPv4 if absent, mirroring how registrations written by
/// older peers are read back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    #[serde(default)]
    family: AddressFamily,
}

impl Endpoint {
    /// Create an IPv4 endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::new_with_family(host, port, AddressFamily::Ipv4)
    }

    /// Create an endpoint with an explicit address family
    pub fn new_with_family(host: impl Into<String>, port: u16, family: AddressFamily) -> Self {
        Self {
            host: host.into(),
            port,
            family,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Resolve to a `SocketAddr` for the socket boundary.
    ///
    /// Fails if the host is not a literal IP address; the protocol only
    /// ever carries observed socket addresses, never DNS names.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| EndpointError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let family = if addr.is_ipv4() {
            AddressFamily::Ipv4
        } else {
            AddressFamily::Ipv6
        };
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            family,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors produced when resolving an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Host is not a literal IP address
    InvalidHost(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::InvalidHost(host) => write!(f, "invalid endpoint host '{}'", host),
        }
    }
}

impl std::error::Error for EndpointError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip() {
        let endpoints = [
            Endpoint::new("192.168.1.10", 4321),
            Endpoint::new_with_family("2001:db8::1", 9999, AddressFamily::Ipv6),
            Endpoint::new("127.0.0.1", 1),
        ];

        for endpoint in endpoints {
            let serialized = serde_json::to_string(&endpoint).unwrap();
            let deserialized: Endpoint = serde_json::from_str(&serialized).unwrap();
            assert_eq!(deserialized, endpoint);
        }
    }

    #[test]
    fn test_family_defaults_to_ipv4() {
        let endpoint: Endpoint =
            serde_json::from_str(r#"{"host": "10.0.0.1", "port": 5000}"#).unwrap();

        assert_eq!(endpoint.family(), AddressFamily::Ipv4);
        assert_eq!(endpoint.host(), "10.0.0.1");
        assert_eq!(endpoint.port(), 5000);
    }

    #[test]
    fn test_missing_host_or_port_fails() {
        assert!(serde_json::from_str::<Endpoint>(r#"{"port": 5000}"#).is_err());
        assert!(serde_json::from_str::<Endpoint>(r#"{"host": "10.0.0.1"}"#).is_err());
        assert!(serde_json::from_str::<Endpoint>(r#"{}"#).is_err());
    }

    #[test]
    fn test_socket_addr_conversion() {
        let addr: SocketAddr = "203.0.113.50:4433".parse().unwrap();
        let endpoint = Endpoint::from(addr);

        assert_eq!(endpoint.host(), "203.0.113.50");
        assert_eq!(endpoint.port(), 4433);
        assert_eq!(endpoint.family(), AddressFamily::Ipv4);
        assert_eq!(endpoint.to_socket_addr().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_socket_addr_conversion() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let endpoint = Endpoint::from(addr);

        assert_eq!(endpoint.family(), AddressFamily::Ipv6);
        assert_eq!(endpoint.to_socket_addr().unwrap(), addr);
    }

    #[test]
    fn test_invalid_host_resolution() {
        let endpoint = Endpoint::new("not-an-ip", 80);
        assert_eq!(
            endpoint.to_socket_addr(),
            Err(EndpointError::InvalidHost("not-an-ip".to_string()))
        );
    }
}
