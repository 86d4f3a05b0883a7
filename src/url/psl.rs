//! The public suffix database.
//!
//! A gzipped blob with two newline-separated, sorted sections: regular
//! rules and exception rules. Lookup walks the domain's labels through a
//! two-phase binary search (exact rules, then single-wildcard rules),
//! then checks the exception section; an exception inverts the match.

use std::io::Read;
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use log::warn;

static LIST_BYTES: &[u8] = include_bytes!("public_suffix_list.gz");

static GLOBAL: OnceLock<PublicSuffixDatabase> = OnceLock::new();

const WILDCARD_LABEL: &str = "*";

/// Two-section suffix rule database, loaded lazily from the embedded blob.
pub struct PublicSuffixDatabase {
    rules: Vec<u8>,
    exceptions: Vec<u8>,
}

impl PublicSuffixDatabase {
    /// The process-wide database.
    pub fn get() -> &'static PublicSuffixDatabase {
        GLOBAL.get_or_init(|| match PublicSuffixDatabase::load(LIST_BYTES) {
            Ok(db) => db,
            Err(e) => {
                warn!("failed to load public suffix list: {}", e);
                PublicSuffixDatabase {
                    rules: Vec::new(),
                    exceptions: Vec::new(),
                }
            }
        })
    }

    fn load(blob: &[u8]) -> std::io::Result<PublicSuffixDatabase> {
        let mut raw = Vec::new();
        GzDecoder::new(blob).read_to_end(&mut raw)?;
        let rule_len = read_u32(&raw, 0)? as usize;
        let rules = section(&raw, 4, rule_len)?;
        let exc_len = read_u32(&raw, 4 + rule_len)? as usize;
        let exceptions = section(&raw, 8 + rule_len, exc_len)?;
        Ok(PublicSuffixDatabase { rules, exceptions })
    }

    /// Returns the effective top-level domain plus one label, or `None`
    /// if `host` is itself a public suffix (or shorter).
    pub fn top_private_domain(&self, host: &str) -> Option<String> {
        let labels: Vec<&str> = host.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return None;
        }
        let suffix_len = self.public_suffix_label_count(&labels);
        if labels.len() <= suffix_len {
            return None;
        }
        Some(labels[labels.len() - suffix_len - 1..].join("."))
    }

    /// True if `host` exactly names a public suffix.
    pub fn is_public_suffix(&self, host: &str) -> bool {
        let labels: Vec<&str> = host.split('.').collect();
        !labels.iter().any(|l| l.is_empty())
            && self.public_suffix_label_count(&labels) == labels.len()
    }

    fn public_suffix_label_count(&self, labels: &[&str]) -> usize {
        // Phase 1: the longest exact rule matching a suffix of the labels.
        let mut exact: Option<usize> = None;
        for start in 0..labels.len() {
            if binary_search(&self.rules, &labels[start..]).is_some() {
                exact = Some(labels.len() - start);
                break;
            }
        }

        // Phase 2: a single leftmost wildcard.
        let mut wildcard: Option<usize> = None;
        if labels.len() > 1 {
            let mut swapped: Vec<&str> = labels.to_vec();
            for start in 0..labels.len() - 1 {
                swapped[start] = WILDCARD_LABEL;
                if binary_search(&self.rules, &swapped[start..]).is_some() {
                    wildcard = Some(labels.len() - start);
                    break;
                }
            }
        }

        // Phase 3: exceptions invert the wildcard result.
        for start in 0..labels.len() {
            if binary_search(&self.exceptions, &labels[start..]).is_some() {
                // The exception names a registrable domain: its suffix is
                // everything after its leftmost label.
                return labels.len() - start - 1;
            }
        }

        match (exact, wildcard) {
            (Some(e), Some(w)) => e.max(w),
            (Some(e), None) => e,
            (None, Some(w)) => w,
            // Unknown TLDs use the prevailing rule `*`.
            (None, None) => 1,
        }
    }
}

impl std::fmt::Debug for PublicSuffixDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("PublicSuffixDatabase")
    }
}

fn read_u32(raw: &[u8], at: usize) -> std::io::Result<u32> {
    if raw.len() < at + 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated public suffix list",
        ));
    }
    Ok(u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]))
}

fn section(raw: &[u8], at: usize, len: usize) -> std::io::Result<Vec<u8>> {
    if raw.len() < at + len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated public suffix list",
        ));
    }
    Ok(raw[at..at + len].to_vec())
}

/// Binary search over sorted newline-separated lines for the rule equal to
/// `labels` joined by dots. Returns the matching line.
fn binary_search<'a>(bytes: &'a [u8], labels: &[&str]) -> Option<&'a [u8]> {
    let target = labels.join(".");
    let target = target.as_bytes();
    let mut low = 0usize;
    let mut high = bytes.len();
    while low < high {
        let mut mid = low + (high - low) / 2;
        while mid > low && bytes[mid - 1] != b'\n' {
            mid -= 1;
        }
        let end = bytes[mid..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| mid + p)
            .unwrap_or(bytes.len());
        let line = &bytes[mid..end];
        match line.cmp(target) {
            std::cmp::Ordering::Equal => return Some(line),
            std::cmp::Ordering::Less => low = end + 1,
            std::cmp::Ordering::Greater => high = mid,
        }
    }
    None
}
