//! A model of HTTP and HTTPS URLs.
//!
//! Parsing follows RFC 3986 with WHATWG leanings: each component has its
//! own percent-encoding category, hosts are canonicalized (IDN, IPv4,
//! IPv6), and relative references resolve against a base for redirects.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::Error;

mod host;
pub(crate) mod psl;

pub(crate) use host::canonicalize_host;
pub use psl::PublicSuffixDatabase;

const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'/')
    .add(b':');

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\');

const QUERY: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'<').add(b'>');

const FRAGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

/// A parsed, canonicalized `http` or `https` URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HttpUrl {
    scheme: Scheme,
    username: String,
    password: String,
    host: Host,
    port: u16,
    /// Canonical encoded path, always beginning with `/`.
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Host {
    /// A registered name or IPv4 address in canonical text form.
    Name(String),
    /// An IPv6 address in RFC 5952 text form, without brackets.
    Ipv6(String),
}

impl HttpUrl {
    /// Parses an absolute URL.
    pub fn parse(input: &str) -> crate::Result<HttpUrl> {
        let input = input.trim();
        let scheme_end = input
            .find("://")
            .ok_or_else(|| Error::new_url(format!("not an absolute url: {}", input)))?;
        let scheme = match input[..scheme_end].to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::new_url(format!("unexpected scheme: {}", other)));
            }
        };

        let rest = &input[scheme_end + 3..];
        let authority_end = rest
            .find(|c| c == '/' || c == '?' || c == '#')
            .unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        let rest = &rest[authority_end..];

        let (userinfo, host_port) = match authority.rfind('@') {
            Some(at) => (&authority[..at], &authority[at + 1..]),
            None => ("", authority),
        };
        let (username, password) = match userinfo.find(':') {
            Some(colon) => (&userinfo[..colon], &userinfo[colon + 1..]),
            None => (userinfo, ""),
        };

        let (raw_host, raw_port) = split_host_port(host_port)?;
        let decoded_host = percent_decode_str(raw_host)
            .decode_utf8()
            .map_err(|e| Error::new_url(e.to_string()))?;
        let host = match canonicalize_host(&decoded_host) {
            Some(canonical) if canonical.contains(':') => Host::Ipv6(canonical),
            Some(canonical) => Host::Name(canonical),
            None => return Err(Error::new_url(format!("invalid host: {}", raw_host))),
        };
        let port = match raw_port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| Error::new_url(format!("invalid port: {}", p)))?,
            None => default_port(scheme),
        };

        let (path, query, fragment) = split_path_query_fragment(rest);
        Ok(HttpUrl {
            scheme,
            username: canonicalize_component(username, USERINFO),
            password: canonicalize_component(password, USERINFO),
            host,
            port,
            path: canonicalize_path(path),
            query: query.map(|q| canonicalize_component(q, QUERY)),
            fragment: fragment.map(|f| canonicalize_component(f, FRAGMENT)),
        })
    }

    /// `http` or `https`.
    pub fn scheme(&self) -> &str {
        match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// The canonical host. IPv6 hosts carry no brackets.
    pub fn host(&self) -> &str {
        match &self.host {
            Host::Name(h) | Host::Ipv6(h) => h,
        }
    }

    pub(crate) fn is_ipv6_host(&self) -> bool {
        matches!(self.host, Host::Ipv6(_))
    }

    /// True when the host is an IP address literal rather than a name.
    pub fn host_is_ip_address(&self) -> bool {
        match &self.host {
            Host::Ipv6(_) => true,
            Host::Name(h) => h.parse::<std::net::Ipv4Addr>().is_ok(),
        }
    }

    /// The effective port: explicit, or the scheme default.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The encoded path, always starting with `/`.
    pub fn encoded_path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Path plus `?query`, as written on an HTTP/1 request line.
    pub fn encoded_path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// The value for a `Host` header: brackets for IPv6, port only when
    /// not the scheme default.
    pub fn host_header(&self) -> String {
        let host = match &self.host {
            Host::Ipv6(h) => format!("[{}]", h),
            Host::Name(h) => h.clone(),
        };
        if self.port == default_port(self.scheme) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// The registrable domain of this URL's host, if it has one.
    pub fn top_private_domain(&self) -> Option<String> {
        if self.host_is_ip_address() {
            return None;
        }
        match &self.host {
            Host::Ipv6(_) => None,
            Host::Name(h) => PublicSuffixDatabase::get().top_private_domain(h),
        }
    }

    /// Resolves a possibly-relative `link` against this URL. Returns
    /// `None` when the link is absolute with a non-HTTP scheme.
    pub fn resolve(&self, link: &str) -> Option<HttpUrl> {
        let link = link.trim();
        // Absolute with scheme?
        if let Some(colon) = link.find(':') {
            let scheme = &link[..colon];
            if !scheme.is_empty()
                && scheme
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
                && scheme.as_bytes()[0].is_ascii_alphabetic()
            {
                return HttpUrl::parse(link).ok();
            }
        }
        if let Some(rest) = link.strip_prefix("//") {
            return HttpUrl::parse(&format!("{}://{}", self.scheme(), rest)).ok();
        }

        let mut resolved = self.clone();
        resolved.fragment = None;
        if link.is_empty() {
            return Some(resolved);
        }
        if let Some(frag) = link.strip_prefix('#') {
            resolved.fragment = Some(canonicalize_component(frag, FRAGMENT));
            resolved.query = self.query.clone();
            return Some(resolved);
        }

        let (path_part, query, fragment) = split_path_query_fragment(link);
        resolved.query = query.map(|q| canonicalize_component(q, QUERY));
        resolved.fragment = fragment.map(|f| canonicalize_component(f, FRAGMENT));
        if path_part.is_empty() {
            resolved.path = self.path.clone();
        } else if path_part.starts_with('/') {
            resolved.path = canonicalize_path(path_part);
        } else {
            // Merge with the base path, then remove dot segments.
            let base = match self.path.rfind('/') {
                Some(idx) => &self.path[..=idx],
                None => "/",
            };
            resolved.path = canonicalize_path(&format!("{}{}", base, path_part));
        }
        Some(resolved)
    }

    /// This URL without username, password, query, or fragment; used in
    /// log output.
    pub fn redact(&self) -> String {
        format!("{}://{}{}", self.scheme(), self.host_header(), self.path)
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme())?;
        if !self.username.is_empty() || !self.password.is_empty() {
            f.write_str(&self.username)?;
            if !self.password.is_empty() {
                write!(f, ":{}", self.password)?;
            }
            f.write_str("@")?;
        }
        match &self.host {
            Host::Ipv6(h) => write!(f, "[{}]", h)?,
            Host::Name(h) => f.write_str(h)?,
        }
        if self.port != default_port(self.scheme) {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.path)?;
        if let Some(ref q) = self.query {
            write!(f, "?{}", q)?;
        }
        if let Some(ref frag) = self.fragment {
            write!(f, "#{}", frag)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for HttpUrl {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<HttpUrl> {
        HttpUrl::parse(s)
    }
}

fn default_port(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    }
}

fn split_host_port(host_port: &str) -> crate::Result<(&str, Option<&str>)> {
    if host_port.starts_with('[') {
        match host_port.find(']') {
            Some(close) => {
                let host = &host_port[..=close];
                let rest = &host_port[close + 1..];
                if rest.is_empty() {
                    Ok((host, None))
                } else if let Some(port) = rest.strip_prefix(':') {
                    Ok((host, Some(port)))
                } else {
                    Err(Error::new_url(format!("invalid authority: {}", host_port)))
                }
            }
            None => Err(Error::new_url(format!("invalid authority: {}", host_port))),
        }
    } else {
        match host_port.rfind(':') {
            Some(colon) => Ok((&host_port[..colon], Some(&host_port[colon + 1..]))),
            None => Ok((host_port, None)),
        }
    }
}

fn split_path_query_fragment(rest: &str) -> (&str, Option<&str>, Option<&str>) {
    let (without_fragment, fragment) = match rest.find('#') {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };
    let (path, query) = match without_fragment.find('?') {
        Some(idx) => (
            &without_fragment[..idx],
            Some(&without_fragment[idx + 1..]),
        ),
        None => (without_fragment, None),
    };
    (path, query, fragment)
}

/// Percent-encodes bytes outside the component's allowed set, passing
/// existing `%XY` escapes through unchanged.
fn canonicalize_component(input: &str, set: &'static AsciiSet) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut run_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            out.push_str(&utf8_percent_encode(&input[run_start..i], set).to_string());
            if valid {
                out.push_str(&input[i..i + 3]);
                i += 3;
            } else {
                out.push_str("%25");
                i += 1;
            }
            run_start = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&utf8_percent_encode(&input[run_start..], set).to_string());
    out
}

/// Canonicalizes a path: leading slash, dot-segment removal, per-segment
/// encoding.
fn canonicalize_path(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let mut segments: Vec<String> = Vec::new();
    let raw: Vec<&str> = path[1..].split('/').collect();
    let trailing_slash = matches!(raw.last(), Some(&"") | Some(&".") | Some(&".."));
    for segment in &raw {
        match *segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(canonicalize_component(other, PATH_SEGMENT)),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::HttpUrl;

    #[test]
    fn parse_basic() {
        let url = HttpUrl::parse("http://example.com/a/b?q=1#frag").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host(), "example.com");
        assert_eq!(url.port(), 80);
        assert_eq!(url.encoded_path(), "/a/b");
        assert_eq!(url.query(), Some("q=1"));
        assert_eq!(url.fragment(), Some("frag"));
        assert_eq!(url.to_string(), "http://example.com/a/b?q=1#frag");
    }

    #[test]
    fn default_ports_dropped() {
        assert_eq!(
            HttpUrl::parse("https://example.com:443/").unwrap().to_string(),
            "https://example.com/"
        );
        assert_eq!(
            HttpUrl::parse("http://example.com:8080/").unwrap().port(),
            8080
        );
    }

    #[test]
    fn empty_path_becomes_slash() {
        assert_eq!(HttpUrl::parse("http://x.test").unwrap().encoded_path(), "/");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(HttpUrl::parse("ftp://example.com/").is_err());
        assert!(HttpUrl::parse("example.com/").is_err());
    }

    #[test]
    fn ipv6_host() {
        let url = HttpUrl::parse("http://[2001:db8:0:0:0:0:0:1]:8080/x").unwrap();
        assert_eq!(url.host(), "2001:db8::1");
        assert_eq!(url.host_header(), "[2001:db8::1]:8080");
        assert_eq!(url.to_string(), "http://[2001:db8::1]:8080/x");
    }

    #[test]
    fn host_canonicalized() {
        let url = HttpUrl::parse("http://EXAMPLE.COM./").unwrap();
        assert_eq!(url.host(), "example.com");
    }

    #[test]
    fn dot_segments_removed() {
        let url = HttpUrl::parse("http://x.test/a/b/../c/./d").unwrap();
        assert_eq!(url.encoded_path(), "/a/c/d");
    }

    #[test]
    fn path_encodes_spaces() {
        let url = HttpUrl::parse("http://x.test/a b").unwrap();
        assert_eq!(url.encoded_path(), "/a%20b");
    }

    #[test]
    fn existing_escapes_preserved() {
        let url = HttpUrl::parse("http://x.test/a%2Fb?q=%41").unwrap();
        assert_eq!(url.encoded_path(), "/a%2Fb");
        assert_eq!(url.query(), Some("q=%41"));
    }

    #[test]
    fn resolve_relative_forms() {
        let base = HttpUrl::parse("http://x.test/a/b?base=1").unwrap();
        assert_eq!(
            base.resolve("c").unwrap().to_string(),
            "http://x.test/a/c"
        );
        assert_eq!(
            base.resolve("/c").unwrap().to_string(),
            "http://x.test/c"
        );
        assert_eq!(
            base.resolve("../z").unwrap().to_string(),
            "http://x.test/z"
        );
        assert_eq!(
            base.resolve("?q=2").unwrap().to_string(),
            "http://x.test/a/b?q=2"
        );
        assert_eq!(
            base.resolve("//other.test/p").unwrap().to_string(),
            "http://other.test/p"
        );
        assert_eq!(
            base.resolve("https://other.test/p").unwrap().to_string(),
            "https://other.test/p"
        );
        assert!(base.resolve("mailto:user@example.com").is_none());
    }

    #[test]
    fn resolve_fragment_only_keeps_query() {
        let base = HttpUrl::parse("http://x.test/a?q=1").unwrap();
        assert_eq!(
            base.resolve("#top").unwrap().to_string(),
            "http://x.test/a?q=1#top"
        );
    }

    #[test]
    fn userinfo_round_trip() {
        let url = HttpUrl::parse("http://user:pa ss@x.test/").unwrap();
        assert_eq!(url.username(), "user");
        assert_eq!(url.password(), "pa%20ss");
    }

    #[test]
    fn round_trip_normal_form() {
        for s in [
            "http://example.com/",
            "https://example.com/path?a=b&c=d",
            "http://example.com:8080/deep/path/",
            "http://[::1]/x",
        ] {
            assert_eq!(HttpUrl::parse(s).unwrap().to_string(), s, "{}", s);
        }
    }
}
