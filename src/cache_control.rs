//! A structured view over `Cache-Control` header directives.

use std::fmt;
use std::time::Duration;

use crate::headers::Headers;

/// Parsed cache directives from a request or response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_max_age: Option<Duration>,
    pub is_private: bool,
    pub is_public: bool,
    pub must_revalidate: bool,
    pub max_stale: Option<Duration>,
    /// `max-stale` present with no argument: any staleness is acceptable.
    pub max_stale_unbounded: bool,
    pub min_fresh: Option<Duration>,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl CacheControl {
    /// Cache directives that force a network response.
    pub const FORCE_NETWORK: CacheControl = CacheControl {
        no_cache: true,
        no_store: false,
        max_age: None,
        s_max_age: None,
        is_private: false,
        is_public: false,
        must_revalidate: false,
        max_stale: None,
        max_stale_unbounded: false,
        min_fresh: None,
        only_if_cached: false,
        no_transform: false,
        immutable: false,
    };

    /// Cache directives that accept a cached response of any staleness and
    /// never touch the network.
    pub const FORCE_CACHE: CacheControl = CacheControl {
        no_cache: false,
        no_store: false,
        max_age: None,
        s_max_age: None,
        is_private: false,
        is_public: false,
        must_revalidate: false,
        max_stale: None,
        max_stale_unbounded: true,
        min_fresh: None,
        only_if_cached: true,
        no_transform: false,
        immutable: false,
    };

    /// Parses every `Cache-Control` and legacy `Pragma` field in `headers`.
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut cc = CacheControl::default();
        let mut directives = Vec::new();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("Cache-Control") {
                collect_directives(value, &mut directives);
            } else if name.eq_ignore_ascii_case("Pragma") && value.eq_ignore_ascii_case("no-cache")
            {
                directives.push(("no-cache".to_string(), None));
            }
        }
        for (directive, argument) in directives {
            match directive.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "max-age" => cc.max_age = parse_seconds(argument.as_deref()),
                "s-maxage" => cc.s_max_age = parse_seconds(argument.as_deref()),
                "private" => cc.is_private = true,
                "public" => cc.is_public = true,
                "must-revalidate" => cc.must_revalidate = true,
                "max-stale" => match parse_seconds(argument.as_deref()) {
                    Some(d) => cc.max_stale = Some(d),
                    None => cc.max_stale_unbounded = true,
                },
                "min-fresh" => cc.min_fresh = parse_seconds(argument.as_deref()),
                "only-if-cached" => cc.only_if_cached = true,
                "no-transform" => cc.no_transform = true,
                "immutable" => cc.immutable = true,
                _ => {}
            }
        }
        cc
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self == CacheControl::default()
    }

    /// Serializes the directives back into a header value.
    pub(crate) fn header_value(&self) -> String {
        let mut out = Vec::new();
        if self.no_cache {
            out.push("no-cache".to_string());
        }
        if self.no_store {
            out.push("no-store".to_string());
        }
        if let Some(d) = self.max_age {
            out.push(format!("max-age={}", d.as_secs()));
        }
        if let Some(d) = self.s_max_age {
            out.push(format!("s-maxage={}", d.as_secs()));
        }
        if self.is_private {
            out.push("private".to_string());
        }
        if self.is_public {
            out.push("public".to_string());
        }
        if self.must_revalidate {
            out.push("must-revalidate".to_string());
        }
        if self.max_stale_unbounded {
            out.push("max-stale".to_string());
        } else if let Some(d) = self.max_stale {
            out.push(format!("max-stale={}", d.as_secs()));
        }
        if let Some(d) = self.min_fresh {
            out.push(format!("min-fresh={}", d.as_secs()));
        }
        if self.only_if_cached {
            out.push("only-if-cached".to_string());
        }
        if self.no_transform {
            out.push("no-transform".to_string());
        }
        if self.immutable {
            out.push("immutable".to_string());
        }
        out.join(", ")
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

fn collect_directives(value: &str, out: &mut Vec<(String, Option<String>)>) {
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.find('=') {
            Some(idx) => {
                let (name, arg) = part.split_at(idx);
                let arg = arg[1..].trim().trim_matches('"');
                out.push((name.trim().to_ascii_lowercase(), Some(arg.to_string())));
            }
            None => out.push((part.to_ascii_lowercase(), None)),
        }
    }
}

fn parse_seconds(arg: Option<&str>) -> Option<Duration> {
    let arg = arg?;
    match arg.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        // Very large ages clamp rather than fail.
        Err(_) if arg.bytes().all(|b| b.is_ascii_digit()) && !arg.is_empty() => {
            Some(Duration::from_secs(u64::MAX / 2))
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;

    #[test]
    fn parse_common_directives() {
        let headers = Headers::of(&["Cache-Control", "no-cache, max-age=120, private"]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache);
        assert!(cc.is_private);
        assert_eq!(cc.max_age, Some(Duration::from_secs(120)));
    }

    #[test]
    fn pragma_no_cache() {
        let headers = Headers::of(&["Pragma", "no-cache"]);
        assert!(CacheControl::parse(&headers).no_cache);
    }

    #[test]
    fn multiple_fields_merge() {
        let headers = Headers::of(&["Cache-Control", "no-store", "Cache-Control", "max-age=0"]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_store);
        assert_eq!(cc.max_age, Some(Duration::ZERO));
    }

    #[test]
    fn max_stale_without_argument_is_unbounded() {
        let headers = Headers::of(&["Cache-Control", "max-stale"]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.max_stale_unbounded);
        assert!(cc.max_stale.is_none());
    }

    #[test]
    fn force_cache_round_trip() {
        assert_eq!(
            CacheControl::FORCE_CACHE.header_value(),
            "max-stale, only-if-cached"
        );
    }
}
