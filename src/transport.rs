//! The transport underneath a connection: a socket, split into buffered
//! read and write halves, plus a control handle used for timeouts and
//! cancellation from other threads.

use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::protocol::Protocol;
use crate::tls::{Handshake, TlsStream};

/// A cloneable control handle on the underlying TCP socket. Safe to use
/// concurrently with reads and writes; this is how `cancel()` unblocks
/// suspended I/O.
#[derive(Debug)]
pub(crate) struct SocketHandle {
    tcp: TcpStream,
}

impl SocketHandle {
    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.peer_addr()
    }

    pub(crate) fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.tcp.set_read_timeout(dur)
    }

    pub(crate) fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.tcp.set_write_timeout(dur)
    }

    /// Closes both directions, failing any in-flight blocking operation.
    pub(crate) fn shutdown(&self) {
        let _ = self.tcp.shutdown(Shutdown::Both);
    }

    pub(crate) fn try_clone(&self) -> io::Result<SocketHandle> {
        Ok(SocketHandle {
            tcp: self.tcp.try_clone()?,
        })
    }
}

/// An established transport: buffered halves over TCP or TLS.
pub(crate) struct Transport {
    pub(crate) source: BufReader<Box<dyn Read + Send>>,
    pub(crate) sink: BufWriter<Box<dyn Write + Send>>,
    pub(crate) socket: SocketHandle,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) protocol: Protocol,
}

impl Transport {
    /// Wraps a plaintext TCP stream.
    pub(crate) fn plaintext(tcp: TcpStream, protocol: Protocol) -> io::Result<Transport> {
        tcp.set_nodelay(true)?;
        let read_half = tcp.try_clone()?;
        let control = tcp.try_clone()?;
        Ok(Transport {
            source: BufReader::new(Box::new(read_half)),
            sink: BufWriter::new(Box::new(tcp)),
            socket: SocketHandle { tcp: control },
            handshake: None,
            protocol,
        })
    }

    /// Wraps a completed TLS session. `tcp` remains the control handle.
    pub(crate) fn tls(tcp: TcpStream, tls: TlsStream, fallback: Protocol) -> io::Result<Transport> {
        tcp.set_nodelay(true)?;
        let protocol = tls.alpn_protocol.unwrap_or(fallback);
        Ok(Transport {
            source: BufReader::new(tls.read),
            sink: BufWriter::new(tls.write),
            socket: SocketHandle { tcp },
            handshake: Some(tls.handshake),
            protocol,
        })
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("protocol", &self.protocol)
            .field("tls", &self.handshake.is_some())
            .finish()
    }
}
