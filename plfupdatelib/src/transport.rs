use std::{
    fmt,
    future::Future,
    io,
    path::Path,
    str::FromStr,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transfer was cancelled")]
    Cancelled,
    #[error("Could not connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("Expected HTTP success, but got HTTP {0}")]
    Status(u16),
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the failure was caused by [`Connection::cancel`] rather than by
    /// the network.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Body of a small request/response exchange.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Payload {
    pub data: Vec<u8>,
    /// Size announced by the server, if any
    pub declared_len: Option<u64>,
}

/// Callback receiving `(transferred bytes, total bytes)` during a transfer.
/// The total is unknown if the peer did not announce it.
pub type ByteProgress<'a> = &'a mut (dyn FnMut(u64, Option<u64>) + Send);

/// A live session with a single host. All methods may be called concurrently
/// from different threads; in particular [`Self::cancel`] must make any
/// in-flight call return [`TransportError::Cancelled`] promptly.
pub trait Connection: Send + Sync + 'static {
    /// Fetch a small resource into memory.
    fn get(&self, path: &str) -> impl Future<Output = Result<Payload, TransportError>> + Send;

    /// Fetch a resource into `dest`, creating or truncating it. Returns the
    /// number of bytes written.
    fn download(
        &self,
        path: &str,
        dest: &Path,
        progress: ByteProgress<'_>,
    ) -> impl Future<Output = Result<u64, TransportError>> + Send;

    /// Send the file at `local` to the peer under `remote_name`. Returns the
    /// number of bytes sent.
    fn upload(
        &self,
        local: &Path,
        remote_name: &str,
        progress: ByteProgress<'_>,
    ) -> impl Future<Output = Result<u64, TransportError>> + Send;

    /// Abort in-flight and future calls on this connection. Calling this more
    /// than once is harmless.
    fn cancel(&self) -> Result<(), TransportError>;
}

pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a session with `host`. Only bookkeeping happens here; no call in
    /// this method may block on the network for long, since it runs with a
    /// phase lock held.
    fn connect(&self, host: &str, port: u16, secure: bool) -> Result<Self::Connection, TransportError>;
}

/// Host, port, and scheme of a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
            secure: false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `<host>[:<port>]`. The port defaults to 80.
impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.rsplit_once(':') {
            Some((h, p)) => (h, p.parse().map_err(|_| ParseEndpointError::InvalidPort(p.to_owned()))?),
            None => (s, 80),
        };

        if host.is_empty() || host.contains('/') {
            return Err(ParseEndpointError::InvalidHost(host.to_owned()));
        }

        Ok(Self::new(host, port))
    }
}

#[derive(Debug, Error)]
pub enum ParseEndpointError {
    #[error("Invalid host: {0:?}")]
    InvalidHost(String),
    #[error("Invalid port: {0:?}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_matches!("192.168.42.1:8080".parse::<Endpoint>(),
                        Ok(e) if e == Endpoint::new("192.168.42.1", 8080));
        assert_matches!("device.local".parse::<Endpoint>(),
                        Ok(e) if e == Endpoint::new("device.local", 80));
        assert_matches!("host:port".parse::<Endpoint>(),
                        Err(ParseEndpointError::InvalidPort(_)));
        assert_matches!(":21".parse::<Endpoint>(),
                        Err(ParseEndpointError::InvalidHost(_)));
    }

    #[test]
    fn test_cancel_flavour() {
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(!TransportError::Status(404).is_cancelled());
    }
}
