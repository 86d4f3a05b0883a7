//! Domain name resolution.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

/// Resolves host names to IP addresses.
///
/// The system resolver is the default. Tests substitute fixed answers.
pub trait Dns: Send + Sync {
    /// Returns the addresses of `hostname`, in resolver preference order.
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

impl fmt::Debug for dyn Dns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Dns")
    }
}

/// The operating system's resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        // Address literals short-circuit the resolver.
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs: Vec<IpAddr> = (hostname, 0u16)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", hostname),
            ));
        }
        Ok(addrs)
    }
}

/// A shared resolver handle.
pub type DnsRef = Arc<dyn Dns>;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Maps host names to canned answers.
    #[derive(Default)]
    pub(crate) struct FakeDns {
        answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl FakeDns {
        pub(crate) fn set(&self, hostname: &str, addrs: Vec<IpAddr>) {
            self.answers
                .lock()
                .unwrap()
                .insert(hostname.to_string(), addrs);
        }
    }

    impl Dns for FakeDns {
        fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
            self.answers
                .lock()
                .unwrap()
                .get(hostname)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown host"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_skips_resolver() {
        let addrs = SystemDns.lookup("127.0.0.1").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
