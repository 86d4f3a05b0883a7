//! An ordered, case-insensitive multimap of HTTP header fields.
//!
//! Headers preserve insertion order and may repeat names; lookups compare
//! names case-insensitively. Construction validates names as RFC 7230
//! tokens and values as visible ASCII. A lenient mode is used for header
//! blocks read off the wire, where servers are given more latitude than
//! callers.

use std::fmt;
use std::slice;
use std::time::SystemTime;

use crate::error::{Error, Parse};

/// An immutable ordered list of `(name, value)` pairs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// An empty header block.
    pub fn new() -> Headers {
        Headers { fields: Vec::new() }
    }

    /// Builds headers from alternating name/value pairs.
    ///
    /// # Panics
    ///
    /// Panics if `pairs` has odd length or any field fails validation.
    pub fn of(pairs: &[&str]) -> Headers {
        assert!(pairs.len() % 2 == 0, "expected alternating names and values");
        let mut builder = Headers::builder();
        for pair in pairs.chunks(2) {
            builder = builder.add(pair[0], pair[1]).expect("invalid header");
        }
        builder.build()
    }

    pub fn builder() -> HeadersBuilder {
        HeadersBuilder {
            fields: Vec::new(),
            lenient: false,
        }
    }

    pub(crate) fn lenient_builder() -> HeadersBuilder {
        HeadersBuilder {
            fields: Vec::new(),
            lenient: true,
        }
    }

    /// Returns the last value for `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Parses the named header as an HTTP-date.
    pub fn get_date(&self, name: &str) -> Option<SystemTime> {
        self.get(name).and_then(|v| httpdate::parse_http_date(v).ok())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.fields[index].0
    }

    pub fn value(&self, index: usize) -> &str {
        &self.fields[index].1
    }

    /// Byte size of all names and values, excluding framing overhead.
    pub fn byte_count(&self) -> u64 {
        self.fields
            .iter()
            .map(|(n, v)| n.len() as u64 + v.len() as u64)
            .sum()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.fields.iter(),
        }
    }

    /// Returns a builder seeded with this block's fields.
    pub fn to_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            fields: self.fields.clone(),
            lenient: true,
        }
    }

    pub(crate) fn contains_value(&self, name: &str, value: &str) -> bool {
        self.values(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Splits comma-separated values of every `name` field, trimmed.
    pub(crate) fn comma_values(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        for value in self.values(name) {
            for part in value.split(',') {
                let part = part.trim();
                if !part.is_empty() {
                    out.push(part.to_ascii_lowercase());
                }
            }
        }
        out
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Iterator over `(name, value)` pairs in insertion order.
pub struct Iter<'a> {
    inner: slice::Iter<'a, (String, String)>,
}

impl fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("headers::Iter")
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        self.inner.next().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self {
            map.entry(&name, &value);
        }
        map.finish()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

/// Builds a [`Headers`] block.
#[derive(Clone, Debug)]
pub struct HeadersBuilder {
    fields: Vec<(String, String)>,
    lenient: bool,
}

impl HeadersBuilder {
    /// Appends a field, validating name and value.
    pub fn add(mut self, name: &str, value: &str) -> crate::Result<HeadersBuilder> {
        check_name(name)?;
        check_value(value, self.lenient)?;
        self.fields
            .push((name.to_string(), value.trim().to_string()));
        Ok(self)
    }

    /// Appends a field without returning; panics on invalid input.
    pub(crate) fn add_checked(&mut self, name: &str, value: &str) {
        check_name(name).expect("invalid header name");
        check_value(value, self.lenient).expect("invalid header value");
        self.fields
            .push((name.to_string(), value.trim().to_string()));
    }

    /// Appends a raw line read off the wire, splitting at the first colon.
    pub(crate) fn add_line(&mut self, line: &str) -> crate::Result<()> {
        match line.find(':') {
            Some(idx) => {
                let (name, value) = line.split_at(idx);
                check_name(name.trim())?;
                self.fields
                    .push((name.trim().to_string(), value[1..].trim().to_string()));
                Ok(())
            }
            None => Err(Error::from(Parse::Header)),
        }
    }

    /// Removes every field named `name`, then appends the replacement.
    pub fn set(mut self, name: &str, value: &str) -> crate::Result<HeadersBuilder> {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add(name, value)
    }

    /// Removes every field named `name`.
    pub fn remove_all(mut self, name: &str) -> HeadersBuilder {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    pub fn build(self) -> Headers {
        Headers {
            fields: self.fields,
        }
    }
}

fn check_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::from(Parse::Header).with("name is empty"));
    }
    for &b in name.as_bytes() {
        if !is_token_char(b) {
            return Err(
                Error::from(Parse::Header).with(format!("unexpected char in header name: {:?}", name))
            );
        }
    }
    Ok(())
}

fn check_value(value: &str, lenient: bool) -> crate::Result<()> {
    for &b in value.as_bytes() {
        let ok = match b {
            b'\t' => true,
            0x20..=0x7e => true,
            // Servers emit latin-1 and utf-8 values in the wild.
            0x80..=0xff => lenient,
            _ => false,
        };
        if !ok {
            return Err(
                Error::from(Parse::Header).with(format!("unexpected char in header value: {:?}", value))
            );
        }
    }
    Ok(())
}

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' |
        b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

#[cfg(test)]
mod tests {
    use super::Headers;

    #[test]
    fn order_and_repeats_preserved() {
        let headers = Headers::of(&["Set-Cookie", "a=1", "Content-Type", "text/plain", "Set-Cookie", "b=2"]);
        assert_eq!(headers.values("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.name(0), "Set-Cookie");
        assert_eq!(headers.name(1), "Content-Type");
    }

    #[test]
    fn get_returns_last() {
        let headers = Headers::of(&["X-A", "1", "x-a", "2"]);
        assert_eq!(headers.get("X-A"), Some("2"));
    }

    #[test]
    fn case_insensitive_lookup() {
        let headers = Headers::of(&["Content-Length", "5"]);
        assert_eq!(headers.get("content-length"), Some("5"));
        assert!(headers.get("content-type").is_none());
    }

    #[test]
    fn rejects_bad_name() {
        assert!(Headers::builder().add("bad name", "x").is_err());
        assert!(Headers::builder().add("", "x").is_err());
    }

    #[test]
    fn rejects_control_value_accepts_lenient_high_bytes() {
        assert!(Headers::builder().add("X", "a\nb").is_err());
        assert!(Headers::lenient_builder().add("X", "caf\u{e9}").is_ok());
        assert!(Headers::builder().add("X", "caf\u{e9}").is_err());
    }

    #[test]
    fn set_replaces_all() {
        let headers = Headers::of(&["A", "1", "A", "2"])
            .to_builder()
            .set("a", "3")
            .unwrap()
            .build();
        assert_eq!(headers.values("A"), vec!["3"]);
    }

    #[test]
    fn comma_values_split_and_trim() {
        let headers = Headers::of(&["Connection", "Upgrade, Keep-Alive"]);
        assert_eq!(headers.comma_values("connection"), vec!["upgrade", "keep-alive"]);
    }
}
