//! Routes and route selection.
//!
//! A route is one concrete way to reach an origin: a proxy choice plus a
//! socket address. The selector enumerates them lazily: proxies in
//! order, then each proxy's addresses, with previously failed routes
//! postponed to the end.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::Error;
use crate::event::EventListenerRef;
use crate::proxy::Proxy;

use super::address::Address;

/// Where a route's TCP connect goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    /// A resolved IP and port.
    Resolved(SocketAddr),
    /// Left unresolved for the proxy (SOCKS) to resolve.
    Unresolved(String, u16),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Resolved(sa) => write!(f, "{}", sa),
            RouteTarget::Unresolved(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// A concrete connection plan target: `(address, proxy, socket address)`.
#[derive(Clone)]
pub struct Route {
    pub(crate) address: Address,
    pub(crate) proxy: Proxy,
    pub(crate) target: RouteTarget,
}

impl Route {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn target(&self) -> &RouteTarget {
        &self.target
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// HTTPS through an HTTP proxy needs a CONNECT tunnel.
    pub(crate) fn requires_tunnel(&self) -> bool {
        self.address.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }

    /// The identity used by the failure database.
    fn key(&self) -> (String, Proxy, RouteTarget) {
        (
            self.address.host().to_string(),
            self.proxy.clone(),
            self.target.clone(),
        )
    }

    pub(crate) fn socket_addr(&self) -> Option<SocketAddr> {
        match self.target {
            RouteTarget::Resolved(sa) => Some(sa),
            RouteTarget::Unresolved(..) => None,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({} via {} -> {})", self.address.host(), self.proxy, self.target)
    }
}

/// Remembers routes that recently failed so fresh routes are preferred.
#[derive(Debug, Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<(String, Proxy, RouteTarget)>>,
}

impl RouteDatabase {
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().unwrap().insert(route.key());
    }

    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().unwrap().remove(&route.key());
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().unwrap().contains(&route.key())
    }
}

/// One proxy's worth of routes.
pub(crate) struct Selection {
    routes: Vec<Route>,
    index: usize,
}

impl Selection {
    pub(crate) fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    pub(crate) fn next(&mut self) -> Option<Route> {
        let route = self.routes.get(self.index).cloned();
        self.index += 1;
        route
    }
}

/// Enumerates routes for an address.
pub(crate) struct RouteSelector {
    address: Address,
    route_database: Arc<RouteDatabase>,
    listener: EventListenerRef,
    fast_fallback: bool,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    /// Failed routes, reattempted only after everything fresh. The last
    /// postponed is tried first.
    postponed_routes: Vec<Route>,
    postponed_exhausted: bool,
}

impl RouteSelector {
    pub(crate) fn new(
        address: Address,
        route_database: Arc<RouteDatabase>,
        listener: EventListenerRef,
        fast_fallback: bool,
    ) -> RouteSelector {
        let proxies = match address.explicit_proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let mut proxies = address.proxy_selector().select(address.url());
                if proxies.is_empty() {
                    proxies.push(Proxy::Direct);
                }
                proxies
            }
        };
        RouteSelector {
            address,
            route_database,
            listener,
            fast_fallback,
            proxies,
            next_proxy_index: 0,
            postponed_routes: Vec::new(),
            postponed_exhausted: false,
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxies.len()
            || (!self.postponed_routes.is_empty() && !self.postponed_exhausted)
    }

    /// Returns the next proxy's routes, fresh routes first.
    pub(crate) fn next(&mut self) -> crate::Result<Selection> {
        if self.next_proxy_index >= self.proxies.len() {
            if self.postponed_routes.is_empty() || self.postponed_exhausted {
                return Err(Error::new_connect("exhausted all routes"));
            }
            // Last-failed first.
            self.postponed_exhausted = true;
            let mut routes = std::mem::take(&mut self.postponed_routes);
            routes.reverse();
            return Ok(Selection { routes, index: 0 });
        }

        let proxy = self.proxies[self.next_proxy_index].clone();
        self.next_proxy_index += 1;

        let targets = self.resolve_targets(&proxy)?;
        let mut routes = Vec::with_capacity(targets.len());
        for target in targets {
            let route = Route {
                address: self.address.clone(),
                proxy: proxy.clone(),
                target,
            };
            if self.route_database.should_postpone(&route) {
                self.postponed_routes.push(route);
            } else {
                routes.push(route);
            }
        }
        if routes.is_empty() && self.has_next() {
            return self.next();
        }
        if routes.is_empty() {
            // Everything known-bad: try the postponed ones now.
            self.postponed_exhausted = true;
            let mut routes = std::mem::take(&mut self.postponed_routes);
            routes.reverse();
            if routes.is_empty() {
                return Err(Error::new_connect("no routes resolved"));
            }
            return Ok(Selection { routes, index: 0 });
        }
        Ok(Selection { routes, index: 0 })
    }

    fn resolve_targets(&self, proxy: &Proxy) -> crate::Result<Vec<RouteTarget>> {
        match proxy {
            // The SOCKS proxy resolves the origin host itself.
            Proxy::Socks { .. } => Ok(vec![RouteTarget::Unresolved(
                self.address.host().to_string(),
                self.address.port(),
            )]),
            Proxy::Direct => self.lookup(self.address.host(), self.address.port()),
            Proxy::Http { host, port } => self.lookup(host, *port),
        }
    }

    fn lookup(&self, host: &str, port: u16) -> crate::Result<Vec<RouteTarget>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![RouteTarget::Resolved(SocketAddr::new(ip, port))]);
        }
        self.listener.dns_start(host);
        let addresses = self
            .address
            .dns()
            .lookup(host)
            .map_err(Error::new_io)
            .map_err(|e| Error::new_connect(format!("failed to resolve {}", host)).with_suppressed(e))?;
        self.listener.dns_end(host, addresses.len());
        debug!("resolved {} to {} addresses", host, addresses.len());
        let ordered = if self.fast_fallback {
            reorder_for_happy_eyeballs(addresses)
        } else {
            addresses
        };
        Ok(ordered
            .into_iter()
            .map(|ip| RouteTarget::Resolved(SocketAddr::new(ip, port)))
            .collect())
    }
}

/// Interleaves address families so the first two attempts cover both
/// (RFC 8305). The first address keeps its position.
pub(crate) fn reorder_for_happy_eyeballs(addresses: Vec<IpAddr>) -> Vec<IpAddr> {
    let (first_family, second_family): (Vec<IpAddr>, Vec<IpAddr>) = match addresses.first() {
        Some(IpAddr::V6(_)) => addresses.iter().partition(|ip| ip.is_ipv6()),
        _ => return addresses_interleaved_v4_first(addresses),
    };
    interleave(first_family, second_family)
}

fn addresses_interleaved_v4_first(addresses: Vec<IpAddr>) -> Vec<IpAddr> {
    let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = addresses.iter().partition(|ip| ip.is_ipv4());
    interleave(v4, v6)
}

fn interleave(a: Vec<IpAddr>, b: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        match (a.next(), b.next()) {
            (None, None) => return out,
            (x, y) => {
                out.extend(x);
                out.extend(y);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::FakeDns;
    use crate::dns::SystemDns;
    use crate::event::NoEvents;
    use crate::protocol::Protocol;
    use crate::proxy::NoProxy;
    use crate::tls::ConnectionSpec;
    use crate::url::HttpUrl;

    fn v6(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn happy_eyeballs_interleaves_families() {
        let input = vec![
            v6("2001:db8::1"),
            v6("2001:db8::2"),
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
        ];
        let out = reorder_for_happy_eyeballs(input);
        assert_eq!(
            out,
            vec![
                v6("2001:db8::1"),
                "192.0.2.1".parse::<IpAddr>().unwrap(),
                v6("2001:db8::2"),
                "192.0.2.2".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn happy_eyeballs_single_family_unchanged() {
        let input: Vec<IpAddr> = vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()];
        assert_eq!(reorder_for_happy_eyeballs(input.clone()), input);
    }

    fn test_address(url: &str, dns: crate::dns::DnsRef) -> Address {
        Address::new(
            &HttpUrl::parse(url).unwrap(),
            dns,
            None,
            Arc::new(vec![Protocol::Http11]),
            Arc::new(vec![ConnectionSpec::cleartext()]),
            Arc::new(NoProxy),
            None,
        )
    }

    #[test]
    fn selector_resolves_via_dns() {
        let dns = Arc::new(FakeDns::default());
        dns.set("x.test", vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()]);
        let address = test_address("http://x.test/", dns);
        let mut selector = RouteSelector::new(
            address,
            Arc::new(RouteDatabase::default()),
            Arc::new(NoEvents),
            false,
        );
        assert!(selector.has_next());
        let mut selection = selector.next().unwrap();
        let first = selection.next().unwrap();
        assert_eq!(first.target.to_string(), "192.0.2.1:80");
        assert!(selection.has_next());
        assert!(!selector.has_next());
    }

    #[test]
    fn failed_routes_postponed_lifo() {
        let dns = Arc::new(FakeDns::default());
        dns.set(
            "x.test",
            vec![
                "192.0.2.1".parse().unwrap(),
                "192.0.2.2".parse().unwrap(),
                "192.0.2.3".parse().unwrap(),
            ],
        );
        let db = Arc::new(RouteDatabase::default());
        let address = test_address("http://x.test/", dns.clone());

        // First pass: fail the first two routes.
        {
            let mut selector = RouteSelector::new(
                address.clone(),
                db.clone(),
                Arc::new(NoEvents),
                false,
            );
            let mut selection = selector.next().unwrap();
            db.failed(&selection.next().unwrap());
            db.failed(&selection.next().unwrap());
        }

        // Second pass: the fresh route leads; failed ones follow, last
        // failed first.
        let mut selector = RouteSelector::new(address, db, Arc::new(NoEvents), false);
        let mut selection = selector.next().unwrap();
        assert_eq!(selection.next().unwrap().target.to_string(), "192.0.2.3:80");
        assert!(!selection.has_next());
        assert!(selector.has_next());
        let mut postponed = selector.next().unwrap();
        assert_eq!(postponed.next().unwrap().target.to_string(), "192.0.2.2:80");
        assert_eq!(postponed.next().unwrap().target.to_string(), "192.0.2.1:80");
        assert!(!selector.has_next());
    }

    #[test]
    fn socks_leaves_host_unresolved() {
        let address = Address::new(
            &HttpUrl::parse("http://x.test/").unwrap(),
            Arc::new(SystemDns),
            None,
            Arc::new(vec![Protocol::Http11]),
            Arc::new(vec![ConnectionSpec::cleartext()]),
            Arc::new(NoProxy),
            Some(Proxy::Socks {
                host: "proxy.test".to_string(),
                port: 1080,
            }),
        );
        let mut selector = RouteSelector::new(
            address,
            Arc::new(RouteDatabase::default()),
            Arc::new(NoEvents),
            false,
        );
        let mut selection = selector.next().unwrap();
        let route = selection.next().unwrap();
        assert_eq!(route.target, RouteTarget::Unresolved("x.test".to_string(), 80));
        assert!(matches!(route.proxy, Proxy::Socks { .. }));
    }
}
