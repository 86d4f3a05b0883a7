//! Cookies and the jar seam.
//!
//! This is a structured view over `Set-Cookie` / `Cookie` header values
//! with domain and path matching. Persistence and the full browser
//! model are intentionally out of scope; deployments that need them
//! supply their own [`CookieJar`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::url::{HttpUrl, PublicSuffixDatabase};

/// An HTTP cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Absolute expiry; `None` for session cookies.
    pub expires_at: Option<SystemTime>,
    pub domain: String,
    /// True when the `Domain` attribute was present, so subdomains match.
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Parses one `Set-Cookie` value in the context of `url`. Returns
    /// `None` for malformed or disallowed cookies.
    pub fn parse(url: &HttpUrl, set_cookie: &str) -> Option<Cookie> {
        let mut parts = set_cookie.split(';');
        let name_value = parts.next()?;
        let eq = name_value.find('=')?;
        let name = name_value[..eq].trim();
        let value = name_value[eq + 1..].trim().trim_matches('"');
        if name.is_empty() {
            return None;
        }

        let mut expires_at: Option<SystemTime> = None;
        let mut max_age: Option<i64> = None;
        let mut domain: Option<String> = None;
        let mut path: Option<String> = None;
        let mut secure = false;
        let mut http_only = false;

        for attr in parts {
            let attr = attr.trim();
            let (attr_name, attr_value) = match attr.find('=') {
                Some(idx) => (&attr[..idx], attr[idx + 1..].trim()),
                None => (attr, ""),
            };
            match attr_name.to_ascii_lowercase().as_str() {
                "expires" => expires_at = httpdate::parse_http_date(attr_value).ok(),
                "max-age" => max_age = attr_value.parse::<i64>().ok(),
                "domain" => {
                    let d = attr_value.trim_start_matches('.').to_ascii_lowercase();
                    if !d.is_empty() {
                        domain = Some(d);
                    }
                }
                "path" => {
                    if attr_value.starts_with('/') {
                        path = Some(attr_value.to_string());
                    }
                }
                "secure" => secure = true,
                "httponly" => http_only = true,
                _ => {}
            }
        }

        // Max-Age beats Expires.
        if let Some(seconds) = max_age {
            expires_at = Some(if seconds <= 0 {
                SystemTime::UNIX_EPOCH
            } else {
                SystemTime::now() + Duration::from_secs(seconds as u64)
            });
        }

        let host = url.host().to_string();
        let (domain, host_only) = match domain {
            Some(d) => {
                if !domain_match(&host, &d) {
                    return None;
                }
                // A cookie may not span a whole public suffix.
                if PublicSuffixDatabase::get().is_public_suffix(&d) && d != host {
                    return None;
                }
                (d, false)
            }
            None => (host, true),
        };

        let path = path.unwrap_or_else(|| default_path(url));

        Some(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            expires_at,
            domain,
            host_only,
            path,
            secure,
            http_only,
        })
    }

    /// True if this cookie should be sent with a request for `url`.
    pub fn matches(&self, url: &HttpUrl) -> bool {
        let domain_ok = if self.host_only {
            url.host() == self.domain
        } else {
            domain_match(url.host(), &self.domain)
        };
        domain_ok && path_match(url.encoded_path(), &self.path) && (!self.secure || url.is_https())
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host.parse::<std::net::IpAddr>().is_err()
}

fn path_match(url_path: &str, cookie_path: &str) -> bool {
    if url_path == cookie_path {
        return true;
    }
    url_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || url_path.as_bytes()[cookie_path.len()] == b'/')
}

fn default_path(url: &HttpUrl) -> String {
    let path = url.encoded_path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Provides cookies to outbound requests and learns them from responses.
pub trait CookieJar: Send + Sync {
    fn load(&self, url: &HttpUrl) -> Vec<Cookie>;
    fn save(&self, url: &HttpUrl, cookies: Vec<Cookie>);
}

impl fmt::Debug for dyn CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("CookieJar")
    }
}

/// Accepts no cookies and offers none. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load(&self, _url: &HttpUrl) -> Vec<Cookie> {
        Vec::new()
    }

    fn save(&self, _url: &HttpUrl, _cookies: Vec<Cookie>) {}
}

/// A process-lifetime jar with expiry but no persistence.
#[derive(Debug, Default)]
pub struct InMemoryCookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar for InMemoryCookieJar {
    fn load(&self, url: &HttpUrl) -> Vec<Cookie> {
        let now = SystemTime::now();
        let mut cookies = self.cookies.lock().unwrap();
        cookies.retain(|c| !c.is_expired(now));
        cookies.iter().filter(|c| c.matches(url)).cloned().collect()
    }

    fn save(&self, _url: &HttpUrl, new_cookies: Vec<Cookie>) {
        let mut cookies = self.cookies.lock().unwrap();
        for cookie in new_cookies {
            cookies.retain(|c| {
                !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
            });
            cookies.push(cookie);
        }
    }
}

pub type CookieJarRef = Arc<dyn CookieJar>;

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> HttpUrl {
        HttpUrl::parse(s).unwrap()
    }

    #[test]
    fn parse_simple() {
        let c = Cookie::parse(&url("http://example.com/a/b"), "SID=31d4d96e407aad42").unwrap();
        assert_eq!(c.name, "SID");
        assert_eq!(c.value, "31d4d96e407aad42");
        assert!(c.host_only);
        assert_eq!(c.path, "/a");
        assert!(c.expires_at.is_none());
    }

    #[test]
    fn parse_attributes() {
        let c = Cookie::parse(
            &url("https://www.example.com/"),
            "id=1; Domain=example.com; Path=/; Secure; HttpOnly; Max-Age=60",
        )
        .unwrap();
        assert!(!c.host_only);
        assert_eq!(c.domain, "example.com");
        assert!(c.secure);
        assert!(c.http_only);
        assert!(c.expires_at.is_some());
    }

    #[test]
    fn domain_mismatch_rejected() {
        assert!(Cookie::parse(&url("http://example.com/"), "a=b; Domain=other.com").is_none());
    }

    #[test]
    fn public_suffix_domain_rejected() {
        assert!(Cookie::parse(&url("http://foo.co.uk/"), "a=b; Domain=co.uk").is_none());
    }

    #[test]
    fn matching_rules() {
        let c = Cookie::parse(
            &url("http://www.example.com/docs/"),
            "a=b; Domain=example.com; Path=/docs",
        )
        .unwrap();
        assert!(c.matches(&url("http://sub.example.com/docs/page")));
        assert!(!c.matches(&url("http://sub.example.com/other")));
        assert!(!c.matches(&url("http://examples.com/docs")));
    }

    #[test]
    fn secure_cookie_requires_https() {
        let c = Cookie::parse(&url("https://example.com/"), "a=b; Secure").unwrap();
        assert!(c.matches(&url("https://example.com/")));
        assert!(!c.matches(&url("http://example.com/")));
    }

    #[test]
    fn in_memory_jar_replaces_and_expires() {
        let jar = InMemoryCookieJar::default();
        let u = url("http://example.com/");
        jar.save(&u, vec![Cookie::parse(&u, "a=1").unwrap()]);
        jar.save(&u, vec![Cookie::parse(&u, "a=2").unwrap()]);
        let loaded = jar.load(&u);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value, "2");

        jar.save(&u, vec![Cookie::parse(&u, "a=3; Max-Age=0").unwrap()]);
        assert!(jar.load(&u).is_empty());
    }
}
