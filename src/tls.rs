//! The seam to an external TLS implementation.
//!
//! courier does not ship a TLS stack. Deployments plug one in through
//! [`TlsConnector`]; it must support ALPN so HTTP/2 can be negotiated.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crate::protocol::Protocol;

/// A record of the TLS handshake on a connection.
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    /// E.g. `TLSv1.3`.
    pub tls_version: String,
    /// E.g. `TLS_AES_128_GCM_SHA256`.
    pub cipher_suite: String,
    /// The peer's certificate chain, leaf first, DER-encoded.
    pub peer_certificates: Vec<Vec<u8>>,
    /// Our certificate chain, DER-encoded. Usually empty.
    pub local_certificates: Vec<Vec<u8>>,
}

/// An established TLS session, split into independently usable halves so
/// an HTTP/2 reader thread can run beside writers.
pub struct TlsStream {
    pub read: Box<dyn Read + Send>,
    pub write: Box<dyn Write + Send>,
    pub handshake: Handshake,
    /// The protocol agreed via ALPN, if any.
    pub alpn_protocol: Option<Protocol>,
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("handshake", &self.handshake)
            .field("alpn_protocol", &self.alpn_protocol)
            .finish()
    }
}

/// Performs TLS handshakes over established TCP sockets.
pub trait TlsConnector: Send + Sync {
    /// Handshakes with `host`, offering `alpn` protocols in order and
    /// honoring one of `specs`.
    fn connect(
        &self,
        tcp: TcpStream,
        host: &str,
        alpn: &[Protocol],
        specs: &[ConnectionSpec],
    ) -> io::Result<TlsStream>;

    /// True if the certificate presented in `handshake` also covers
    /// `host`. Gates connection coalescing.
    fn certificate_supports_host(&self, handshake: &Handshake, host: &str) -> bool {
        let _ = (handshake, host);
        false
    }
}

impl fmt::Debug for dyn TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TlsConnector")
    }
}

pub type TlsConnectorRef = Arc<dyn TlsConnector>;

/// A TLS version + cipher suite policy offered during a handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub is_tls: bool,
    /// Accepted TLS versions, newest first. Empty means implementation
    /// defaults.
    pub tls_versions: Vec<String>,
    /// Accepted cipher suites. `None` means implementation defaults.
    pub cipher_suites: Option<Vec<String>>,
}

impl ConnectionSpec {
    /// A modern policy: TLS 1.2+ with implementation-default suites.
    pub fn modern_tls() -> ConnectionSpec {
        ConnectionSpec {
            is_tls: true,
            tls_versions: vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()],
            cipher_suites: None,
        }
    }

    /// A fallback policy for dated servers.
    pub fn compatible_tls() -> ConnectionSpec {
        ConnectionSpec {
            is_tls: true,
            tls_versions: vec![
                "TLSv1.3".to_string(),
                "TLSv1.2".to_string(),
                "TLSv1.1".to_string(),
                "TLSv1".to_string(),
            ],
            cipher_suites: None,
        }
    }

    /// Unencrypted, unauthenticated connections.
    pub fn cleartext() -> ConnectionSpec {
        ConnectionSpec {
            is_tls: false,
            tls_versions: Vec::new(),
            cipher_suites: None,
        }
    }
}
