//! The origin identity a connection serves.

use std::fmt;
use std::sync::Arc;

use crate::dns::DnsRef;
use crate::protocol::Protocol;
use crate::proxy::{Proxy, ProxySelectorRef};
use crate::tls::{ConnectionSpec, TlsConnectorRef};
use crate::url::HttpUrl;

/// A specification for connections to an origin server: everything that
/// must match for two requests to share a transport.
#[derive(Clone)]
pub struct Address {
    url: HttpUrl,
    dns: DnsRef,
    tls: Option<TlsConnectorRef>,
    protocols: Arc<Vec<Protocol>>,
    connection_specs: Arc<Vec<ConnectionSpec>>,
    proxy_selector: ProxySelectorRef,
    explicit_proxy: Option<Proxy>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: &HttpUrl,
        dns: DnsRef,
        tls: Option<TlsConnectorRef>,
        protocols: Arc<Vec<Protocol>>,
        connection_specs: Arc<Vec<ConnectionSpec>>,
        proxy_selector: ProxySelectorRef,
        explicit_proxy: Option<Proxy>,
    ) -> Address {
        // Only the origin triple of the URL identifies the address.
        let origin = HttpUrl::parse(&format!(
            "{}://{}/",
            url.scheme(),
            url.host_header()
        ))
        .expect("origin of a valid url is valid");
        Address {
            url: origin,
            dns,
            tls,
            protocols,
            connection_specs,
            proxy_selector,
            explicit_proxy,
        }
    }

    /// The origin URL: scheme, host, and port only.
    pub fn url(&self) -> &HttpUrl {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host()
    }

    pub fn port(&self) -> u16 {
        self.url.port()
    }

    pub fn is_https(&self) -> bool {
        self.url.is_https()
    }

    pub(crate) fn dns(&self) -> &DnsRef {
        &self.dns
    }

    pub(crate) fn tls(&self) -> Option<&TlsConnectorRef> {
        self.tls.as_ref()
    }

    pub(crate) fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub(crate) fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    pub(crate) fn proxy_selector(&self) -> &ProxySelectorRef {
        &self.proxy_selector
    }

    pub(crate) fn explicit_proxy(&self) -> Option<&Proxy> {
        self.explicit_proxy.as_ref()
    }

    /// True when every dimension except the host matches. Together with
    /// DNS and certificate checks this gates connection coalescing.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        Arc::ptr_eq(&self.dns, &other.dns)
            && match (&self.tls, &other.tls) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && self.explicit_proxy == other.explicit_proxy
            && self.url.is_https() == other.url.is_https()
            && self.url.port() == other.url.port()
    }

    /// Full identity, including the host.
    pub(crate) fn same_address(&self, other: &Address) -> bool {
        self.equals_non_host(other) && self.url.host() == other.url.host()
    }

    /// The key used for per-address pool policies and dispatcher caps.
    pub(crate) fn key(&self) -> AddressKey {
        AddressKey {
            host: self.url.host().to_string(),
            port: self.url.port(),
            is_https: self.url.is_https(),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("url", &self.url)
            .field("proxy", &self.explicit_proxy)
            .finish()
    }
}

/// A hashable digest of an address's origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) is_https: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::SystemDns;
    use crate::proxy::NoProxy;

    fn address(url: &str) -> Address {
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

    #[test]
    fn origin_only() {
        let a = address("http://x.test/deep/path?q=1");
        assert_eq!(a.url().to_string(), "http://x.test/");
    }

    #[test]
    fn non_host_equality_needs_shared_services() {
        let a = address("http://x.test/");
        let b = address("http://y.test/");
        // Distinct service instances: never equal.
        assert!(!a.equals_non_host(&b));

        let mut c = a.clone();
        c.url = HttpUrl::parse("http://y.test/").unwrap();
        assert!(a.equals_non_host(&c));
        assert!(!a.same_address(&c));
    }

    #[test]
    fn port_distinguishes() {
        let a = address("http://x.test/");
        let mut b = a.clone();
        b.url = HttpUrl::parse("http://x.test:8080/").unwrap();
        assert!(!b.equals_non_host(&a));
    }
}
