//! The connection pool: idle/active bookkeeping, keep-alive eviction,
//! and per-address minimum-connection policies.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::task::{Task, TaskQueue, TaskRunner, DONE};

use super::address::{Address, AddressKey};
use super::connection::{CallMarker, Connection};

/// Replenishment backoff when a policy's opener fails to connect.
const DEFAULT_BACKOFF_NANOS: u64 = 5_000_000_000;

/// A per-address service level maintained by the pool.
#[derive(Clone, Debug)]
pub struct AddressPolicy {
    /// Keep at least this many connections open to the address.
    pub minimum_concurrent_calls: usize,
    /// Delay before retrying a failed policy connect, in milliseconds.
    pub backoff_delay_millis: u64,
}

impl Default for AddressPolicy {
    fn default() -> AddressPolicy {
        AddressPolicy {
            minimum_concurrent_calls: 0,
            backoff_delay_millis: DEFAULT_BACKOFF_NANOS / 1_000_000,
        }
    }
}

type PolicyConnect = Arc<dyn Fn(&Address) -> crate::Result<Arc<Connection>> + Send + Sync>;

struct PolicyState {
    policy: AddressPolicy,
    address: Address,
    connect: PolicyConnect,
    opener_queue: TaskQueue,
}

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    max_idle_connections: usize,
    keep_alive_nanos: u64,
    task_runner: TaskRunner,
    cleanup_queue: TaskQueue,
    connections: Mutex<Vec<Arc<Connection>>>,
    policies: Mutex<HashMap<AddressKey, PolicyState>>,
}

impl ConnectionPool {
    pub(crate) fn new(
        task_runner: TaskRunner,
        max_idle_connections: usize,
        keep_alive_nanos: u64,
    ) -> ConnectionPool {
        let cleanup_queue = task_runner.new_queue();
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max_idle_connections,
                keep_alive_nanos,
                task_runner,
                cleanup_queue,
                connections: Mutex::new(Vec::new()),
                policies: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub(crate) fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.calls_in_flight() == 0)
            .count()
    }

    /// Adds a freshly connected connection and schedules maintenance.
    pub(crate) fn put(&self, connection: Arc<Connection>) {
        self.inner.connections.lock().unwrap().push(connection);
        self.schedule_cleanup(0);
    }

    /// Finds a pooled connection for `address` and reserves it for
    /// `call`. Connections failing their health check are retired.
    pub(crate) fn acquire_pooled(
        &self,
        address: &Address,
        call: &Arc<CallMarker>,
        routes: Option<&[super::route::Route]>,
        require_multiplexed: bool,
        extensive_health_checks: bool,
    ) -> Option<Arc<Connection>> {
        let candidates: Vec<Arc<Connection>> =
            self.inner.connections.lock().unwrap().clone();
        for connection in candidates {
            if require_multiplexed && !connection.is_multiplexed() {
                continue;
            }
            if !connection.is_eligible(address, routes) {
                continue;
            }
            if !connection.is_healthy(extensive_health_checks) {
                // Unfit for new exchanges; cleanup will collect it.
                connection.no_new_exchanges();
                self.schedule_cleanup(0);
                continue;
            }
            if connection.reserve(call) {
                trace!("pool hit: connection {} for {}", connection.id(), address.host());
                return Some(connection);
            }
        }
        None
    }

    /// A call finished with `connection`; the pool may now evict it.
    pub(crate) fn connection_became_idle(&self, _connection: &Arc<Connection>) {
        self.schedule_cleanup(0);
    }

    /// Installs a minimum-connections policy. `connect` builds one new
    /// connection to the address; the pool schedules it until the floor
    /// holds.
    pub(crate) fn set_policy(
        &self,
        address: Address,
        policy: AddressPolicy,
        connect: PolicyConnect,
    ) {
        let key = address.key();
        let opener_queue = self.inner.task_runner.new_queue();
        self.inner.policies.lock().unwrap().insert(
            key.clone(),
            PolicyState {
                policy,
                address,
                connect,
                opener_queue,
            },
        );
        self.schedule_opener(&key);
    }

    fn schedule_cleanup(&self, delay_nanos: u64) {
        let inner = Arc::downgrade(&self.inner);
        self.inner.cleanup_queue.schedule(
            Task::new("pool cleanup", true, move || match inner.upgrade() {
                Some(inner) => {
                    let now = inner.task_runner.nano_time();
                    PoolInner::close_connections(&inner, now)
                }
                None => DONE,
            }),
            delay_nanos,
        );
    }

    fn schedule_opener(&self, key: &AddressKey) {
        let policies = self.inner.policies.lock().unwrap();
        let state = match policies.get(key) {
            Some(state) => state,
            None => return,
        };
        let inner = Arc::downgrade(&self.inner);
        let key = key.clone();
        state.opener_queue.schedule(
            Task::new(format!("pool opener {}:{}", key.host, key.port), true, move || {
                match inner.upgrade() {
                    Some(inner) => PoolInner::run_opener(&inner, &key),
                    None => DONE,
                }
            }),
            0,
        );
    }

    /// Closes every idle connection, for orderly shutdown.
    pub(crate) fn evict_all(&self) {
        let mut connections = self.inner.connections.lock().unwrap();
        let (idle, rest): (Vec<_>, Vec<_>) = connections
            .drain(..)
            .partition(|c| c.calls_in_flight() == 0);
        *connections = rest;
        drop(connections);
        for connection in idle {
            connection.close();
        }
    }
}

impl PoolInner {
    /// One maintenance pass. Returns the delay until the next pass in
    /// nanoseconds, 0 to run again immediately, or -1 when idle.
    fn close_connections(inner: &Arc<PoolInner>, now: u64) -> i64 {
        struct Candidate {
            connection: Arc<Connection>,
            idle_duration: u64,
            required: bool,
        }

        let mut in_use_count = 0usize;
        let mut idle: Vec<Candidate> = Vec::new();
        {
            let connections = inner.connections.lock().unwrap();
            for connection in connections.iter() {
                if connection.calls_in_flight() > 0 {
                    in_use_count += 1;
                } else {
                    idle.push(Candidate {
                        connection: connection.clone(),
                        idle_duration: now.saturating_sub(connection.idle_at_nanos()),
                        required: false,
                    });
                }
            }
        }

        // Mark the freshest idle connections that a policy floor needs.
        {
            let policies = inner.policies.lock().unwrap();
            for state in policies.values() {
                let mut keep = state.policy.minimum_concurrent_calls;
                let mut indices: Vec<usize> = (0..idle.len())
                    .filter(|&i| {
                        idle[i]
                            .connection
                            .route()
                            .address()
                            .same_address(&state.address)
                    })
                    .collect();
                indices.sort_by_key(|&i| idle[i].idle_duration);
                for i in indices {
                    if keep == 0 {
                        break;
                    }
                    idle[i].required = true;
                    keep -= 1;
                }
            }
        }

        // First close the oldest connection past its keep-alive.
        let oldest_old = idle
            .iter()
            .filter(|c| c.idle_duration >= inner.keep_alive_nanos)
            .max_by_key(|c| c.idle_duration)
            .map(|c| c.connection.clone());
        if let Some(victim) = oldest_old {
            Self::remove_and_close(inner, &victim);
            Self::replenish_policies(inner);
            return 0;
        }

        // Then trim the idle set to the configured maximum.
        let evictable: Vec<&Candidate> = idle.iter().filter(|c| !c.required).collect();
        if evictable.len() > inner.max_idle_connections {
            if let Some(victim) = evictable
                .iter()
                .max_by_key(|c| c.idle_duration)
                .map(|c| c.connection.clone())
            {
                Self::remove_and_close(inner, &victim);
                return 0;
            }
        }

        if let Some(longest) = idle.iter().map(|c| c.idle_duration).max() {
            // Wake up when the oldest idle connection goes stale.
            return (inner.keep_alive_nanos.saturating_sub(longest)) as i64;
        }
        if in_use_count > 0 {
            return inner.keep_alive_nanos as i64;
        }
        -1
    }

    fn remove_and_close(inner: &Arc<PoolInner>, victim: &Arc<Connection>) {
        {
            let mut connections = inner.connections.lock().unwrap();
            connections.retain(|c| !Arc::ptr_eq(c, victim));
        }
        debug!("pool evicting connection {}", victim.id());
        victim.close();
    }

    /// Counts live connections per policy and schedules openers for any
    /// address below its floor.
    fn replenish_policies(inner: &Arc<PoolInner>) {
        let keys: Vec<AddressKey> = inner.policies.lock().unwrap().keys().cloned().collect();
        let pool = ConnectionPool {
            inner: inner.clone(),
        };
        for key in keys {
            pool.schedule_opener(&key);
        }
    }

    /// The opener task body: connect until the floor is met.
    fn run_opener(inner: &Arc<PoolInner>, key: &AddressKey) -> i64 {
        let (address, minimum, connect, backoff_nanos) = {
            let policies = inner.policies.lock().unwrap();
            match policies.get(key) {
                Some(state) => (
                    state.address.clone(),
                    state.policy.minimum_concurrent_calls,
                    state.connect.clone(),
                    state.policy.backoff_delay_millis * 1_000_000,
                ),
                None => return DONE,
            }
        };

        let open = {
            let connections = inner.connections.lock().unwrap();
            connections
                .iter()
                .filter(|c| {
                    !c.is_no_new_exchanges() && c.route().address().same_address(&address)
                })
                .count()
        };
        if open >= minimum {
            return DONE;
        }

        match connect(&address) {
            Ok(connection) => {
                debug!(
                    "policy opener added connection {} for {}",
                    connection.id(),
                    address.host()
                );
                inner.connections.lock().unwrap().push(connection);
                // Run again immediately in case more are needed.
                0
            }
            Err(e) => {
                debug!("policy opener failed for {}: {}", address.host(), e);
                backoff_nanos as i64
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::address::Address;
    use crate::connect::connection::Carrier;
    use crate::connect::route::{Route, RouteTarget};
    use crate::dns::SystemDns;
    use crate::protocol::Protocol;
    use crate::proto::h1::Http1Codec;
    use crate::proxy::{NoProxy, Proxy};
    use crate::task::TaskRunner;
    use crate::tls::ConnectionSpec;
    use crate::transport::Transport;
    use crate::url::HttpUrl;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    fn test_address(url: &str) -> Address {
        Address::new(
            &HttpUrl::parse(url).unwrap(),
            Arc::new(SystemDns),
            None,
            Arc::new(vec![Protocol::Http11]),
            Arc::new(vec![ConnectionSpec::cleartext()]),
            Arc::new(NoProxy),
            None,
        )
    }

    /// A live loopback connection; the returned peer keeps it open.
    fn test_connection(address: &Address, now: u64) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let transport = Transport::plaintext(client, Protocol::Http11).unwrap();
        let route = Route {
            address: address.clone(),
            proxy: Proxy::Direct,
            target: RouteTarget::Resolved(addr),
        };
        let connection = Arc::new(Connection::new(
            route,
            Protocol::Http11,
            None,
            Carrier::Http1(Arc::new(Http1Codec::new(transport))),
            now,
        ));
        (connection, peer)
    }

    fn marker() -> Arc<CallMarker> {
        Arc::new(CallMarker {
            label: "test call".to_string(),
        })
    }

    #[test]
    fn acquire_reserves_and_respects_limit() {
        let pool = ConnectionPool::new(TaskRunner::global().clone(), 5, 60_000_000_000);
        let address = test_address("http://pool.test/");
        let (connection, _peer) = test_connection(&address, 0);
        pool.put(connection.clone());

        let first = marker();
        let acquired = pool
            .acquire_pooled(&address, &first, None, false, false)
            .expect("pool hit");
        assert_eq!(acquired.id(), connection.id());

        // An HTTP/1 connection carries one call at a time.
        let second = marker();
        assert!(pool
            .acquire_pooled(&address, &second, None, false, false)
            .is_none());

        // Dropping the call's marker releases the slot.
        drop(first);
        assert!(pool
            .acquire_pooled(&address, &second, None, false, false)
            .is_some());
    }

    #[test]
    fn cleanup_never_closes_in_use_connections() {
        let pool = ConnectionPool::new(TaskRunner::global().clone(), 0, 1_000);
        let address = test_address("http://busy.test/");
        let (connection, _peer) = test_connection(&address, 0);
        pool.put(connection.clone());
        let call = marker();
        assert!(connection.reserve(&call));

        // Far beyond keep-alive, but the connection is busy.
        let next = PoolInner::close_connections(&pool.inner, 10_000_000_000);
        assert_eq!(pool.connection_count(), 1);
        assert!(!connection.is_no_new_exchanges());
        assert!(next > 0);
    }

    #[test]
    fn cleanup_closes_stale_idle_connection() {
        let keep_alive = 1_000u64;
        let pool = ConnectionPool::new(TaskRunner::global().clone(), 5, keep_alive);
        let address = test_address("http://stale.test/");
        let (connection, _peer) = test_connection(&address, 0);
        pool.put(connection.clone());

        // Within keep-alive: retained, next run scheduled at staleness.
        let next = PoolInner::close_connections(&pool.inner, 400);
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(next, (keep_alive - 400) as i64);

        // Past keep-alive: evicted, run again immediately.
        let next = PoolInner::close_connections(&pool.inner, keep_alive + 1);
        assert_eq!(next, 0);
        assert_eq!(pool.connection_count(), 0);

        // Nothing left to do.
        assert_eq!(PoolInner::close_connections(&pool.inner, keep_alive + 2), -1);
    }

    #[test]
    fn max_idle_trims_excess() {
        let pool = ConnectionPool::new(TaskRunner::global().clone(), 1, 60_000_000_000);
        let address = test_address("http://trim.test/");
        let (a, _peer_a) = test_connection(&address, 0);
        let (b, _peer_b) = test_connection(&address, 5);
        pool.put(a.clone());
        pool.put(b.clone());

        // Two idle, cap one: the older connection goes.
        assert_eq!(PoolInner::close_connections(&pool.inner, 10), 0);
        assert_eq!(pool.connection_count(), 1);
        let survivors: Vec<u64> = pool
            .inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(survivors, vec![b.id()]);
    }
}
