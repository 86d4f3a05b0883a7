//! Application protocols negotiated over a transport.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An application protocol, in ALPN token form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `http/1.1`.
    Http11,
    /// `h2`, negotiated via ALPN on a TLS transport.
    H2,
    /// Cleartext HTTP/2 with no upgrade round trip. Requires prior
    /// knowledge that the server speaks it; never negotiated.
    H2PriorKnowledge,
}

impl Protocol {
    /// The ALPN identification string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::H2 | Protocol::H2PriorKnowledge => "h2",
        }
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        matches!(self, Protocol::H2 | Protocol::H2PriorKnowledge)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Protocol> {
        match s {
            "http/1.1" => Ok(Protocol::Http11),
            "h2" => Ok(Protocol::H2),
            other => Err(Error::new_config(format!("unexpected protocol: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Protocol;

    #[test]
    fn alpn_tokens() {
        assert_eq!(Protocol::Http11.as_str(), "http/1.1");
        assert_eq!(Protocol::H2.as_str(), "h2");
        assert_eq!(Protocol::H2PriorKnowledge.as_str(), "h2");
    }

    #[test]
    fn prior_knowledge_never_parsed() {
        assert_eq!("h2".parse::<Protocol>().unwrap(), Protocol::H2);
        assert!("h2c".parse::<Protocol>().is_err());
    }
}
