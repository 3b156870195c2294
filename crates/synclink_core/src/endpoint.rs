//! Endpoint and identifier types.
//!
//! An [`Endpoint`] is the multiplexer's partition key: two sessions share a
//! connection only when every field (host, port, TLS, pinned certificate,
//! headers and authorization header name) is equal.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a logical sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a session identifier from a raw 128-bit value.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one connection instance (one lifecycle, `Idle` to `Closed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Handle of one channel open attempt.
///
/// A new handle is allocated for every call to the transport's `open`, so
/// late events from an aborted attempt never reach its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// A resolved sync server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Whether the channel uses TLS.
    pub tls: bool,
    /// Pinned certificate file for this host, if any.
    pub pinned_certificate: Option<PathBuf>,
    /// Extra HTTP headers sent with the handshake request.
    pub headers: BTreeMap<String, String>,
    /// Name of the header carrying authorization data.
    pub authorization_header_name: Option<String>,
}

impl Endpoint {
    /// Creates an endpoint with no pinning and no extra headers.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            pinned_certificate: None,
            headers: BTreeMap::new(),
            authorization_header_name: None,
        }
    }

    /// Sets the pinned certificate path.
    pub fn with_pinned_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.pinned_certificate = Some(path.into());
        self
    }

    /// Adds an extra header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the authorization header name.
    pub fn with_authorization_header_name(mut self, name: impl Into<String>) -> Self {
        self.authorization_header_name = Some(name.into());
        self
    }

    /// Returns the URL scheme for the sync channel.
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "wss"
        } else {
            "ws"
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn endpoint_identity_includes_configuration() {
        let plain = Endpoint::new("sync.example.com", 443, true);
        let same = Endpoint::new("sync.example.com", 443, true);
        let pinned = plain.clone().with_pinned_certificate("/etc/pins/sync.cer");
        let with_header = plain.clone().with_header("X-Tenant", "acme");

        let mut set = HashSet::new();
        set.insert(plain.clone());
        set.insert(same);
        set.insert(pinned);
        set.insert(with_header);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(
            Endpoint::new("localhost", 9080, false).to_string(),
            "ws://localhost:9080"
        );
        assert_eq!(
            Endpoint::new("sync.example.com", 443, true).to_string(),
            "wss://sync.example.com:443"
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::from_u128(1), SessionId::from_u128(1));
    }
}
