//! A parsed `Content-Type` value.

use std::fmt;
use std::str::FromStr;

/// A media type such as `text/plain; charset=utf-8`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaType {
    full: String,
    kind: String,
    subtype: String,
    charset: Option<String>,
}

impl MediaType {
    /// The top-level type, e.g. `text`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The subtype, e.g. `plain`.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// The `charset` parameter, if present.
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }
}

impl FromStr for MediaType {
    type Err = ();

    fn from_str(s: &str) -> Result<MediaType, ()> {
        let s = s.trim();
        let mut parts = s.split(';');
        let essence = parts.next().ok_or(())?.trim();
        let slash = essence.find('/').ok_or(())?;
        let (kind, subtype) = essence.split_at(slash);
        if kind.is_empty() || subtype.len() < 2 {
            return Err(());
        }
        let mut charset = None;
        for param in parts {
            let mut kv = param.splitn(2, '=');
            let name = kv.next().unwrap_or("").trim();
            if name.eq_ignore_ascii_case("charset") {
                let value = kv.next().ok_or(())?.trim().trim_matches('"');
                charset = Some(value.to_ascii_lowercase());
            }
        }
        Ok(MediaType {
            full: s.to_string(),
            kind: kind.to_ascii_lowercase(),
            subtype: subtype[1..].to_ascii_lowercase(),
            charset,
        })
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::MediaType;

    #[test]
    fn parse_with_charset() {
        let mt: MediaType = "text/html; charset=\"UTF-8\"".parse().unwrap();
        assert_eq!(mt.kind(), "text");
        assert_eq!(mt.subtype(), "html");
        assert_eq!(mt.charset(), Some("utf-8"));
    }

    #[test]
    fn parse_bare() {
        let mt: MediaType = "application/json".parse().unwrap();
        assert_eq!(mt.charset(), None);
    }

    #[test]
    fn reject_missing_slash() {
        assert!("texthtml".parse::<MediaType>().is_err());
    }
}
