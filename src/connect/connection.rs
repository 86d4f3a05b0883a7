//! A connection to a remote server, shared by the pool and its calls.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Error;
use crate::protocol::Protocol;
use crate::proto::h1::Http1Codec;
use crate::proto::h2::conn::Http2Connection;
use crate::proto::h2::ErrorCode;
use crate::tls::Handshake;
use crate::transport::SocketHandle;

use super::address::Address;
use super::route::Route;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A marker owned by each call while it uses a connection. The
/// connection tracks calls through weak references only, so an
/// abandoned call never keeps a connection alive, and a connection with
/// dead weak entries exposes the leak.
#[derive(Debug, Default)]
pub(crate) struct CallMarker {
    pub(crate) label: String,
}

/// The protocol engine bound to the connection's socket.
pub(crate) enum Carrier {
    Http1(Arc<Http1Codec>),
    Http2(Arc<Http2Connection>),
}

pub(crate) struct Connection {
    id: u64,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    carrier: Carrier,
    state: Mutex<State>,
}

struct State {
    /// Sticky: once set, this connection never hosts a new exchange.
    no_new_exchanges: bool,
    /// Set by 421 responses: stop serving coalesced hosts.
    no_coalesced_connections: bool,
    route_failure_count: u32,
    success_count: u64,
    refused_stream_count: u32,
    idle_at_nanos: u64,
    calls: Vec<Weak<CallMarker>>,
}

impl Connection {
    pub(crate) fn new(
        route: Route,
        protocol: Protocol,
        handshake: Option<Handshake>,
        carrier: Carrier,
        now_nanos: u64,
    ) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol,
            handshake,
            carrier,
            state: Mutex::new(State {
                no_new_exchanges: false,
                no_coalesced_connections: false,
                route_failure_count: 0,
                success_count: 0,
                refused_stream_count: 0,
                idle_at_nanos: now_nanos,
                calls: Vec::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn carrier(&self) -> &Carrier {
        &self.carrier
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        matches!(self.carrier, Carrier::Http2(_))
    }

    fn socket(&self) -> &SocketHandle {
        match &self.carrier {
            Carrier::Http1(codec) => codec.socket(),
            Carrier::Http2(conn) => conn.socket(),
        }
    }

    /// How many concurrent exchanges this connection accepts.
    pub(crate) fn allocation_limit(&self) -> usize {
        match &self.carrier {
            Carrier::Http1(_) => 1,
            Carrier::Http2(conn) => conn.allocation_limit() as usize,
        }
    }

    /// Marks this connection closed to future exchanges.
    pub(crate) fn no_new_exchanges(&self) {
        self.state.lock().unwrap().no_new_exchanges = true;
    }

    pub(crate) fn is_no_new_exchanges(&self) -> bool {
        self.state.lock().unwrap().no_new_exchanges
    }

    pub(crate) fn no_coalesced_connections(&self) {
        self.state.lock().unwrap().no_coalesced_connections = true;
    }

    pub(crate) fn note_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_count += 1;
        state.route_failure_count = 0;
    }

    /// Records a failure observed while this connection carried a call,
    /// deciding whether it may host future exchanges.
    pub(crate) fn track_failure(&self, error: &Error) {
        let mut state = self.state.lock().unwrap();
        if error.is_stream_reset() {
            if error.h2_error_code() == ErrorCode::RefusedStream {
                // One refusal is routine; repeated refusals poison.
                state.refused_stream_count += 1;
                if state.refused_stream_count > 1 {
                    state.no_new_exchanges = true;
                }
            }
            // Other stream resets leave sibling streams intact.
            return;
        }
        state.no_new_exchanges = true;
        if error.is_connect() {
            state.route_failure_count += 1;
        }
    }

    /// Registers a call as using this connection. Returns false if the
    /// connection is unwilling or full.
    pub(crate) fn reserve(&self, call: &Arc<CallMarker>) -> bool {
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|weak| weak.strong_count() > 0);
        if state.no_new_exchanges || state.calls.len() >= self.allocation_limit() {
            return false;
        }
        state.calls.push(Arc::downgrade(call));
        trace!("connection {} reserved ({} calls)", self.id, state.calls.len());
        true
    }

    /// Releases a call's reservation; the connection idles when empty.
    pub(crate) fn release(&self, call: &Arc<CallMarker>, now_nanos: u64) {
        let mut state = self.state.lock().unwrap();
        let before = state.calls.len();
        state
            .calls
            .retain(|weak| weak.upgrade().map(|c| !Arc::ptr_eq(&c, call)).unwrap_or(false));
        if state.calls.len() == before {
            debug!("connection {} released a call it did not carry", self.id);
        }
        if state.calls.is_empty() {
            state.idle_at_nanos = now_nanos;
        }
    }

    pub(crate) fn calls_in_flight(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|weak| weak.strong_count() > 0);
        state.calls.len()
    }

    pub(crate) fn idle_at_nanos(&self) -> u64 {
        self.state.lock().unwrap().idle_at_nanos
    }

    /// Whether this connection can carry a request for `address`, either
    /// by identity or by coalescing.
    pub(crate) fn is_eligible(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let state = self.state.lock().unwrap();
        if state.no_new_exchanges || state.calls.len() >= self.allocation_limit() {
            return false;
        }
        drop(state);

        if !self.route.address().equals_non_host(address) {
            return false;
        }
        if self.route.address().host() == address.host() {
            return true;
        }

        // Coalescing: an HTTP/2 connection over TLS may serve other hosts
        // that resolve to this socket and are covered by the certificate.
        if !self.is_multiplexed() {
            return false;
        }
        if self.state.lock().unwrap().no_coalesced_connections {
            return false;
        }
        let routes = match routes {
            Some(routes) => routes,
            None => return false,
        };
        let route_matches = routes.iter().any(|candidate| {
            candidate.proxy.is_direct()
                && self.route.proxy.is_direct()
                && candidate.target == self.route.target
        });
        if !route_matches {
            return false;
        }
        let handshake = match &self.handshake {
            Some(h) => h,
            None => return false,
        };
        match address.tls() {
            Some(tls) => tls.certificate_supports_host(handshake, address.host()),
            None => false,
        }
    }

    /// A quick liveness check; `extensive` also probes the transport.
    pub(crate) fn is_healthy(&self, extensive: bool) -> bool {
        if self.is_no_new_exchanges() {
            return false;
        }
        if self.socket().peer_addr().is_err() {
            return false;
        }
        match &self.carrier {
            Carrier::Http2(conn) => conn.is_healthy(),
            Carrier::Http1(codec) => {
                if !codec.is_reusable() {
                    return false;
                }
                if extensive {
                    codec.probe_alive()
                } else {
                    true
                }
            }
        }
    }

    /// Closes the transport. Idempotent.
    pub(crate) fn close(&self) {
        self.no_new_exchanges();
        match &self.carrier {
            Carrier::Http2(conn) => {
                conn.shutdown(ErrorCode::NoError);
                conn.socket().shutdown();
            }
            Carrier::Http1(codec) => codec.cancel(),
        }
        debug!("connection {} closed", self.id);
    }

    pub(crate) fn cancel(&self) {
        self.socket().shutdown();
    }

    pub(crate) fn set_socket_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> io::Result<()> {
        // HTTP/2 streams use their own deadline waits; socket timeouts
        // would starve the shared reader thread.
        if let Carrier::Http1(_) = self.carrier {
            self.socket().set_read_timeout(read)?;
            self.socket().set_write_timeout(write)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}
