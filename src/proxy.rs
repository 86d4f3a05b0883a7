//! Proxy servers and proxy selection.

use std::fmt;
use std::sync::Arc;

use crate::url::HttpUrl;

/// A proxy through which connections may be made.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect directly to the origin server.
    Direct,
    /// An HTTP proxy. Plaintext requests are sent in absolute form;
    /// HTTPS requests tunnel through `CONNECT`.
    Http { host: String, port: u16 },
    /// A SOCKS5 proxy. The origin host name is resolved by the proxy.
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub(crate) fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    pub(crate) fn host_and_port(&self) -> Option<(&str, u16)> {
        match self {
            Proxy::Direct => None,
            Proxy::Http { host, port } | Proxy::Socks { host, port } => {
                Some((host.as_str(), *port))
            }
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("DIRECT"),
            Proxy::Http { host, port } => write!(f, "HTTP @ {}:{}", host, port),
            Proxy::Socks { host, port } => write!(f, "SOCKS @ {}:{}", host, port),
        }
    }
}

/// Chooses the proxies to attempt for a URL, in order.
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &HttpUrl) -> Vec<Proxy>;

    /// Reports that `proxy` failed to establish a connection so the
    /// selector can deprioritize it.
    fn connect_failed(&self, url: &HttpUrl, proxy: &Proxy) {
        let _ = (url, proxy);
    }
}

impl fmt::Debug for dyn ProxySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ProxySelector")
    }
}

/// Never proxies.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _url: &HttpUrl) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

pub type ProxySelectorRef = Arc<dyn ProxySelector>;
