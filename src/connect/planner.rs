//! Route planning: choosing how the next connection attempt happens.
//!
//! A plan is either a connection that is ready to use or a connect
//! attempt to carry out. Plans are produced in precedence order: the
//! call's own connection, the pool, deferred plans left over from an
//! earlier race, and finally a fresh route.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Error;
use crate::event::EventListenerRef;
use crate::protocol::Protocol;
use crate::proto::h1::Http1Codec;
use crate::proto::h2::conn::Http2Connection;
use crate::proto::h2::settings::Settings;
use crate::proxy::Proxy;
use crate::task::TaskRunner;
use crate::transport::Transport;

use super::address::Address;
use super::connection::{CallMarker, Carrier, Connection};
use super::pool::ConnectionPool;
use super::route::{Route, RouteDatabase, RouteSelector, RouteTarget, Selection};

/// What the planner decided to do next.
pub(crate) enum Plan {
    /// A connection already fit for use.
    Ready(Arc<Connection>),
    /// A connect attempt to perform.
    Connect(Arc<ConnectPlan>),
}

/// Everything a planner needs besides the route iterator itself.
#[derive(Clone)]
pub(crate) struct PlannerContext {
    pub(crate) pool: ConnectionPool,
    pub(crate) task_runner: TaskRunner,
    pub(crate) listener: EventListenerRef,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) fast_fallback: bool,
    pub(crate) h2_settings: Settings,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) extensive_health_checks: bool,
}

pub(crate) struct RoutePlanner {
    address: Address,
    context: PlannerContext,
    route_database: Arc<RouteDatabase>,
    call: Arc<CallMarker>,
    /// The connection already attached to this call, if any.
    call_connection: Mutex<Option<Arc<Connection>>>,
    selector: Mutex<Option<RouteSelector>>,
    current_selection: Mutex<Option<Selection>>,
    /// Live connections left over from a prior coalesced race.
    deferred_plans: Arc<Mutex<VecDeque<Arc<Connection>>>>,
}

impl RoutePlanner {
    pub(crate) fn new(
        address: Address,
        context: PlannerContext,
        route_database: Arc<RouteDatabase>,
        call: Arc<CallMarker>,
    ) -> RoutePlanner {
        RoutePlanner {
            address,
            context,
            route_database,
            call,
            call_connection: Mutex::new(None),
            selector: Mutex::new(None),
            current_selection: Mutex::new(None),
            deferred_plans: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn set_call_connection(&self, connection: Option<Arc<Connection>>) {
        *self.call_connection.lock().unwrap() = connection;
    }

    /// True when another plan can still be produced.
    pub(crate) fn has_next(&self) -> bool {
        if self.call_connection.lock().unwrap().is_some() {
            return true;
        }
        if !self.deferred_plans.lock().unwrap().is_empty() {
            return true;
        }
        if let Some(ref selection) = *self.current_selection.lock().unwrap() {
            if selection.has_next() {
                return true;
            }
        }
        match *self.selector.lock().unwrap() {
            Some(ref selector) => selector.has_next(),
            None => true,
        }
    }

    /// Produces the next plan by precedence.
    pub(crate) fn plan(&self, require_multiplexed: bool) -> crate::Result<Plan> {
        // 1. The connection this call already holds.
        if let Some(connection) = self.call_connection.lock().unwrap().take() {
            if connection.is_healthy(false) && connection.reserve(&self.call) {
                trace!("reusing the call's connection {}", connection.id());
                return Ok(Plan::Ready(connection));
            }
        }

        // 2. A pooled connection for this address.
        if let Some(connection) = self.context.pool.acquire_pooled(
            &self.address,
            &self.call,
            None,
            require_multiplexed,
            self.context.extensive_health_checks,
        ) {
            return Ok(Plan::Ready(connection));
        }

        // 3. A deferred plan from an earlier race.
        loop {
            let deferred = self.deferred_plans.lock().unwrap().pop_front();
            match deferred {
                Some(connection) => {
                    if connection.is_healthy(false) && connection.reserve(&self.call) {
                        trace!("using deferred connection {}", connection.id());
                        return Ok(Plan::Ready(connection));
                    }
                    connection.close();
                }
                None => break,
            }
        }

        // 4. A fresh route.
        let route = self.next_route()?;

        // With the route resolved, a coalescable pooled connection may
        // exist for these exact socket addresses.
        let routes = [route.clone()];
        if let Some(connection) = self.context.pool.acquire_pooled(
            &self.address,
            &self.call,
            Some(&routes),
            require_multiplexed,
            self.context.extensive_health_checks,
        ) {
            return Ok(Plan::Ready(connection));
        }

        Ok(Plan::Connect(Arc::new(ConnectPlan::new(
            route,
            self.context.clone(),
            self.route_database.clone(),
        ))))
    }

    fn next_route(&self) -> crate::Result<Route> {
        let mut current = self.current_selection.lock().unwrap();
        loop {
            if let Some(ref mut selection) = *current {
                if let Some(route) = selection.next() {
                    return Ok(route);
                }
            }
            let mut selector_slot = self.selector.lock().unwrap();
            let selector = selector_slot.get_or_insert_with(|| {
                RouteSelector::new(
                    self.address.clone(),
                    self.route_database.clone(),
                    self.context.listener.clone(),
                    self.context.fast_fallback,
                )
            });
            if !selector.has_next() {
                return Err(Error::new_connect("exhausted all routes"));
            }
            *current = Some(selector.next()?);
        }
    }

    /// Parks a connection that finished connecting after its race was
    /// already decided; a follow-up request may still use it.
    pub(crate) fn defer(&self, connection: Arc<Connection>) {
        self.deferred_plans.lock().unwrap().push_front(connection);
    }

    /// A fresh serial queue for one racing connect attempt.
    pub(crate) fn new_connect_queue(&self) -> crate::task::TaskQueue {
        self.context.task_runner.new_queue()
    }

    pub(crate) fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.route_database
    }

    pub(crate) fn call(&self) -> &Arc<CallMarker> {
        &self.call
    }
}

/// A single connect attempt: TCP, optional proxy handshakes, optional
/// TLS, and the protocol preamble.
pub(crate) struct ConnectPlan {
    pub(crate) route: Route,
    context: PlannerContext,
    route_database: Arc<RouteDatabase>,
    canceled: AtomicBool,
    /// The in-progress socket, exposed so cancel can sever it.
    socket: Mutex<Option<TcpStream>>,
}

impl ConnectPlan {
    /// A standalone plan for the pool's policy opener, outside any call.
    pub(crate) fn for_policy(
        route: Route,
        context: PlannerContext,
        route_database: Arc<RouteDatabase>,
    ) -> Arc<ConnectPlan> {
        Arc::new(ConnectPlan::new(route, context, route_database))
    }

    fn new(
        route: Route,
        context: PlannerContext,
        route_database: Arc<RouteDatabase>,
    ) -> ConnectPlan {
        ConnectPlan {
            route,
            context,
            route_database,
            canceled: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(socket) = self.socket.lock().unwrap().as_ref() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Performs the whole connect. On success the connection is
    /// registered in the pool.
    pub(crate) fn connect(&self) -> crate::Result<Arc<Connection>> {
        let result = self.connect_inner();
        match &result {
            Ok(connection) => {
                self.route_database.connected(&self.route);
                debug!(
                    "connected {} via {} ({})",
                    self.route.address().host(),
                    self.route.target(),
                    connection.protocol()
                );
            }
            Err(e) => {
                self.route_database.failed(&self.route);
                self.route
                    .address()
                    .proxy_selector()
                    .connect_failed(self.route.address().url(), &self.route.proxy);
                debug!("connect failed for {}: {}", self.route.target(), e);
            }
        }
        result
    }

    fn connect_inner(&self) -> crate::Result<Arc<Connection>> {
        let address = self.route.address();
        let listener = &self.context.listener;

        // TCP to the route's target: the origin, or the proxy.
        let connect_to = match (&self.route.proxy, &self.route.target) {
            (Proxy::Direct, RouteTarget::Resolved(sa)) => *sa,
            (Proxy::Http { .. }, RouteTarget::Resolved(sa)) => *sa,
            (Proxy::Socks { host, port }, _) => resolve_proxy(address, host, *port)?,
            (_, RouteTarget::Unresolved(host, port)) => resolve_proxy(address, host, *port)?,
        };

        listener.connect_start(connect_to, &self.route.proxy);
        let tcp = match self.context.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&connect_to, timeout),
            None => TcpStream::connect(connect_to),
        }
        .map_err(|e| Error::new_connect(format!("connect to {} failed", connect_to)).with(e))?;
        if self.is_canceled() {
            return Err(Error::new_canceled());
        }
        *self.socket.lock().unwrap() = Some(tcp.try_clone().map_err(Error::new_io)?);

        // SOCKS5 greeting and CONNECT.
        if let Proxy::Socks { .. } = self.route.proxy {
            socks5_connect(&tcp, address.host(), address.port())
                .map_err(|e| Error::new_connect("socks connect failed").with(e))?;
        }

        let mut transport = if address.is_https() {
            let mut tcp = tcp;
            // An HTTP proxy carries HTTPS through a CONNECT tunnel.
            if self.route.requires_tunnel() {
                self.create_tunnel(&mut tcp)?;
            }
            let tls = address
                .tls()
                .ok_or_else(|| Error::new_config("https request but no TLS connector"))?;
            let alpn: Vec<Protocol> = address.protocols().to_vec();
            let control = tcp.try_clone().map_err(Error::new_io)?;
            let session = tls
                .connect(tcp, address.host(), &alpn, address.connection_specs())
                .map_err(|e| Error::new_tls(e))?;
            Transport::tls(control, session, Protocol::Http11).map_err(Error::new_io)?
        } else if address.protocols() == [Protocol::H2PriorKnowledge] {
            Transport::plaintext(tcp, Protocol::H2PriorKnowledge).map_err(Error::new_io)?
        } else {
            Transport::plaintext(tcp, Protocol::Http11).map_err(Error::new_io)?
        };

        if self.is_canceled() {
            return Err(Error::new_canceled());
        }
        listener.connect_end(connect_to);

        let protocol = transport.protocol;
        let handshake = transport.handshake.take();
        let now = self.context.task_runner.nano_time();

        let carrier = if protocol.is_multiplexed() {
            let conn = Http2Connection::start(
                transport,
                format!("{}", self.route.target()),
                self.context.h2_settings.clone(),
            )?;
            if let Some(interval) = self.context.ping_interval {
                schedule_pings(&self.context.task_runner, &conn, interval);
            }
            Carrier::Http2(conn)
        } else {
            Carrier::Http1(Arc::new(Http1Codec::new(transport)))
        };

        let connection = Arc::new(Connection::new(
            self.route.clone(),
            protocol,
            handshake,
            carrier,
            now,
        ));
        self.context.pool.put(connection.clone());
        Ok(connection)
    }

    /// Establishes a CONNECT tunnel through an HTTP proxy, answering 407
    /// challenges with `Proxy-Authorization` when credentials exist in
    /// the proxy URL.
    fn create_tunnel(&self, tcp: &mut TcpStream) -> crate::Result<()> {
        let address = self.route.address();
        let host = if address.url().is_ipv6_host() {
            format!("[{}]", address.host())
        } else {
            address.host().to_string()
        };
        let target = format!("{}:{}", host, address.port());
        let mut authorization: Option<String> = None;
        let mut reader = io::BufReader::new(tcp.try_clone().map_err(Error::new_io)?);

        for attempt in 0..2 {
            let mut request = format!(
                "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n"
            );
            if let Some(ref auth) = authorization {
                request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
            }
            request.push_str("\r\n");
            tcp.write_all(request.as_bytes()).map_err(Error::new_io)?;
            tcp.flush().map_err(Error::new_io)?;

            let head = crate::proto::h1::parse::read_response_head(&mut reader)?;
            match head.code {
                200 => return Ok(()),
                407 if attempt == 0 => {
                    // A refusal body must be drained before reusing the
                    // socket for the next attempt.
                    if let Some(len) = head
                        .headers
                        .get("Content-Length")
                        .and_then(|v| v.trim().parse::<u64>().ok())
                    {
                        io::copy(&mut Read::take(&mut reader, len), &mut io::sink())
                            .map_err(Error::new_io)?;
                    }
                    let url = address.url();
                    if url.username().is_empty() {
                        return Err(Error::new_connect("proxy authentication required"));
                    }
                    authorization = Some(crate::auth::basic_credential(
                        url.username(),
                        url.password(),
                    ));
                }
                code => {
                    return Err(Error::new_connect(format!(
                        "unexpected tunnel response: {}",
                        code
                    )))
                }
            }
        }
        Err(Error::new_connect("proxy authentication failed"))
    }
}

fn resolve_proxy(address: &Address, host: &str, port: u16) -> crate::Result<std::net::SocketAddr> {
    let ips = address.dns().lookup(host).map_err(Error::new_io)?;
    ips.first()
        .map(|ip| std::net::SocketAddr::new(*ip, port))
        .ok_or_else(|| Error::new_connect(format!("no addresses for proxy {}", host)))
}

/// SOCKS5 with no authentication: greeting, then CONNECT to a host name
/// the proxy resolves (RFC 1928).
fn socks5_connect(stream: &TcpStream, host: &str, port: u16) -> io::Result<()> {
    let mut tx = stream;
    tx.write_all(&[0x05, 0x01, 0x00])?;
    let mut reply = [0u8; 2];
    let mut rx = stream;
    rx.read_exact(&mut reply)?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "socks proxy requires authentication",
        ));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "host too long"));
    }
    let mut connect = Vec::with_capacity(7 + host_bytes.len());
    connect.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8]);
    connect.extend_from_slice(host_bytes);
    connect.extend_from_slice(&port.to_be_bytes());
    tx.write_all(&connect)?;

    let mut response = [0u8; 4];
    rx.read_exact(&mut response)?;
    if response[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("socks connect rejected: {:#x}", response[1]),
        ));
    }
    // Drain the bound address.
    match response[3] {
        0x01 => io::copy(&mut rx.take(6), &mut io::sink())?,
        0x04 => io::copy(&mut rx.take(18), &mut io::sink())?,
        0x03 => {
            let mut len = [0u8; 1];
            rx.read_exact(&mut len)?;
            io::copy(&mut rx.take(len[0] as u64 + 2), &mut io::sink())?
        }
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad socks reply")),
    };
    Ok(())
}

/// Schedules keep-alive pings for an HTTP/2 connection.
fn schedule_pings(task_runner: &TaskRunner, conn: &Arc<Http2Connection>, interval: Duration) {
    let queue = task_runner.new_queue();
    let weak = Arc::downgrade(conn);
    let nanos = interval.as_nanos() as u64;
    queue.schedule(
        crate::task::Task::new("http2 ping", true, move || match weak.upgrade() {
            Some(conn) if conn.send_interval_ping() => nanos as i64,
            _ => crate::task::DONE,
        }),
        nanos,
    );
}
