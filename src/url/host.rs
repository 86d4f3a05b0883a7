//! Hostname canonicalization.
//!
//! Hosts come in three shapes: IPv4 dotted-decimal, IPv6 (optionally
//! bracketed), and registered names. Registered names are lowercased,
//! IDN-mapped, and Punycode-encoded per label (RFC 3492); addresses are
//! reduced to their canonical textual form (RFC 5952 for IPv6).

use std::net::{Ipv4Addr, Ipv6Addr};

const MAX_LABEL_BYTES: usize = 63;
const MAX_HOST_BYTES: usize = 253;

/// Canonicalizes `host`, returning `None` if it cannot name an origin.
///
/// IPv6 results carry no brackets; serializers add them.
pub(crate) fn canonicalize_host(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }

    if host.starts_with('[') {
        if !host.ends_with(']') || host.len() < 4 {
            return None;
        }
        let inner = &host[1..host.len() - 1];
        return inner.parse::<Ipv6Addr>().ok().map(|ip| ip.to_string());
    }

    if host.contains(':') {
        return host.parse::<Ipv6Addr>().ok().map(|ip| ip.to_string());
    }

    // Strict dotted-quad: exactly four decimal octets, no leading zeros.
    // A host that is shaped like one but fails to parse is not demoted to
    // a registered name.
    if host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        if host.split('.').count() != 4 {
            return None;
        }
        return host.parse::<Ipv4Addr>().ok().map(|ip| ip.to_string());
    }

    canonicalize_registered_name(host)
}

fn canonicalize_registered_name(host: &str) -> Option<String> {
    let mut labels = Vec::new();
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() {
            return None;
        }
        let mapped = idn_map(label)?;
        let encoded = if mapped.is_ascii() {
            mapped
        } else {
            format!("xn--{}", punycode_encode(&mapped)?)
        };
        if encoded.len() > MAX_LABEL_BYTES {
            return None;
        }
        labels.push(encoded);
    }
    let joined = labels.join(".");
    if joined.is_empty() || joined.len() > MAX_HOST_BYTES {
        return None;
    }
    Some(joined)
}

/// Case-maps a label and rejects code points that can never appear in a
/// host. This is the mapping half of UTS#46 without the normalization
/// tables; labels already in NFC pass through unchanged.
fn idn_map(label: &str) -> Option<String> {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '\0'..='\u{1f}' | '\u{7f}' | ' ' | '#' | '%' | '/' | ':' | '?' | '@' | '[' | '\\'
            | ']' | '^' | '|' | '<' | '>' | '"' => return None,
            _ => {
                for lower in c.to_lowercase() {
                    out.push(lower);
                }
            }
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}

// Punycode bootstring parameters, RFC 3492 section 5.
const BASE: u32 = 36;
const TMIN: u32 = 1;
const TMAX: u32 = 26;
const SKEW: u32 = 38;
const DAMP: u32 = 700;
const INITIAL_BIAS: u32 = 72;
const INITIAL_N: u32 = 128;

fn adapt(mut delta: u32, num_points: u32, first_time: bool) -> u32 {
    delta /= if first_time { DAMP } else { 2 };
    delta += delta / num_points;
    let mut k = 0;
    while delta > ((BASE - TMIN) * TMAX) / 2 {
        delta /= BASE - TMIN;
        k += BASE;
    }
    k + (((BASE - TMIN + 1) * delta) / (delta + SKEW))
}

fn encode_digit(d: u32) -> char {
    if d < 26 {
        (b'a' + d as u8) as char
    } else {
        (b'0' + (d - 26) as u8) as char
    }
}

fn decode_digit(c: char) -> Option<u32> {
    match c {
        'a'..='z' => Some(c as u32 - 'a' as u32),
        'A'..='Z' => Some(c as u32 - 'A' as u32),
        '0'..='9' => Some(c as u32 - '0' as u32 + 26),
        _ => None,
    }
}

/// Encodes a Unicode label into its Punycode form, without the ACE prefix.
pub(crate) fn punycode_encode(input: &str) -> Option<String> {
    let mut output = String::new();
    let basic: Vec<char> = input.chars().filter(|c| c.is_ascii()).collect();
    let mut handled = basic.len() as u32;
    let basic_len = handled;
    for c in &basic {
        output.push(*c);
    }
    if basic_len > 0 {
        output.push('-');
    }

    let input_len = input.chars().count() as u32;
    let mut n = INITIAL_N;
    let mut delta: u32 = 0;
    let mut bias = INITIAL_BIAS;

    while handled < input_len {
        let m = input
            .chars()
            .map(|c| c as u32)
            .filter(|&c| c >= n)
            .min()?;
        delta = delta.checked_add((m - n).checked_mul(handled + 1)?)?;
        n = m;
        for c in input.chars().map(|c| c as u32) {
            if c < n {
                delta = delta.checked_add(1)?;
            }
            if c == n {
                let mut q = delta;
                let mut k = BASE;
                loop {
                    let t = if k <= bias {
                        TMIN
                    } else if k >= bias + TMAX {
                        TMAX
                    } else {
                        k - bias
                    };
                    if q < t {
                        break;
                    }
                    output.push(encode_digit(t + (q - t) % (BASE - t)));
                    q = (q - t) / (BASE - t);
                    k += BASE;
                }
                output.push(encode_digit(q));
                bias = adapt(delta, handled + 1, handled == basic_len);
                delta = 0;
                handled += 1;
            }
        }
        delta += 1;
        n += 1;
    }
    Some(output)
}

/// Decodes a Punycode label (without the ACE prefix) back to Unicode.
pub(crate) fn punycode_decode(input: &str) -> Option<String> {
    let mut output: Vec<char> = Vec::new();
    let (basic, extended) = match input.rfind('-') {
        Some(idx) => (&input[..idx], &input[idx + 1..]),
        None => ("", input),
    };
    for c in basic.chars() {
        if !c.is_ascii() {
            return None;
        }
        output.push(c);
    }

    let mut n = INITIAL_N;
    let mut i: u32 = 0;
    let mut bias = INITIAL_BIAS;
    let mut chars = extended.chars().peekable();

    while chars.peek().is_some() {
        let old_i = i;
        let mut w: u32 = 1;
        let mut k = BASE;
        loop {
            let digit = decode_digit(chars.next()?)?;
            i = i.checked_add(digit.checked_mul(w)?)?;
            let t = if k <= bias {
                TMIN
            } else if k >= bias + TMAX {
                TMAX
            } else {
                k - bias
            };
            if digit < t {
                break;
            }
            w = w.checked_mul(BASE - t)?;
            k += BASE;
        }
        let len = output.len() as u32 + 1;
        bias = adapt(i - old_i, len, old_i == 0);
        n = n.checked_add(i / len)?;
        i %= len;
        let c = char::from_u32(n)?;
        output.insert(i as usize, c);
        i += 1;
    }
    Some(output.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii_lowercased() {
        assert_eq!(canonicalize_host("EXAMPLE.com").as_deref(), Some("example.com"));
    }

    #[test]
    fn ipv4_canonical() {
        assert_eq!(canonicalize_host("192.0.2.1").as_deref(), Some("192.0.2.1"));
        assert!(canonicalize_host("256.0.0.1").is_none());
        assert!(canonicalize_host("1.2.3").is_none());
    }

    #[test]
    fn ipv6_compression_and_brackets() {
        assert_eq!(
            canonicalize_host("[2001:db8:0:0:0:0:0:1]").as_deref(),
            Some("2001:db8::1")
        );
        assert_eq!(canonicalize_host("0:0:0:0:0:0:0:1").as_deref(), Some("::1"));
        assert!(canonicalize_host("[::1").is_none());
        assert!(canonicalize_host("1:2:3:4:5:6:7:8:9").is_none());
    }

    #[test]
    fn idn_punycode() {
        assert_eq!(
            canonicalize_host("bücher.example").as_deref(),
            Some("xn--bcher-kva.example")
        );
    }

    #[test]
    fn rejects_forbidden_chars() {
        assert!(canonicalize_host("exa mple.com").is_none());
        assert!(canonicalize_host("exa%mple.com").is_none());
        assert!(canonicalize_host("").is_none());
    }

    #[test]
    fn label_length_limits() {
        let long_label = "a".repeat(64);
        assert!(canonicalize_host(&long_label).is_none());
        let ok_label = "a".repeat(63);
        assert!(canonicalize_host(&ok_label).is_some());
        let long_host = format!("{}.{}.{}.{}.{}", "a".repeat(60), "b".repeat(60), "c".repeat(60), "d".repeat(60), "e".repeat(60));
        assert!(canonicalize_host(&long_host).is_none());
    }

    // RFC 3492 section 7.1 sample strings.
    #[test]
    fn punycode_rfc_vectors() {
        let arabic = "\u{644}\u{64A}\u{647}\u{645}\u{627}\u{628}\u{62A}\u{643}\u{644}\u{645}\u{648}\u{634}\u{639}\u{631}\u{628}\u{64A}\u{61F}";
        assert_eq!(punycode_encode(arabic).as_deref(), Some("egbpdaj6bu4bxfgehfvwxn"));
        let chinese = "\u{4ED6}\u{4EEC}\u{4E3A}\u{4EC0}\u{4E48}\u{4E0D}\u{8BF4}\u{4E2D}\u{6587}";
        assert_eq!(punycode_encode(chinese).as_deref(), Some("ihqwcrb4cv8a8dqg056pqjye"));
    }

    #[test]
    fn punycode_round_trip() {
        for label in ["bücher", "日本語", "ドメイン名例", "mixed-ascii-日本"] {
            let encoded = punycode_encode(label).unwrap();
            assert_eq!(punycode_decode(&encoded).unwrap(), label, "{}", label);
        }
    }
}
