//! An HTTP response cache per RFC 7234, stored in a [`DiskLruCache`].
//!
//! Each response occupies one entry with two streams: `.0` holds the
//! metadata (URL, vary headers, status line, headers, TLS details,
//! timestamps) and `.1` holds the body bytes. Keys are the hex SHA-256
//! of the request URL.

pub(crate) mod disk_lru;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use log::warn;
use sha2::{Digest, Sha256};

use crate::body::ResponseBody;
use crate::headers::Headers;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::Response;
use crate::task::TaskRunner;
use crate::tls::Handshake;
use crate::url::HttpUrl;

use self::disk_lru::{DiskLruCache, Editor};

const ENTRY_METADATA: usize = 0;
const ENTRY_BODY: usize = 1;
const VALUE_COUNT: usize = 2;
const APP_VERSION: u32 = 201105;

const SENT_MILLIS: &str = "Courier-Sent-Millis";
const RECEIVED_MILLIS: &str = "Courier-Received-Millis";

/// Caches HTTP responses on the filesystem.
pub struct Cache {
    store: Arc<DiskLruCache>,
    request_count: AtomicU64,
    network_count: AtomicU64,
    hit_count: AtomicU64,
}

impl Cache {
    /// Opens (or creates) a cache in `directory`, bounded to `max_size`
    /// bytes.
    pub fn new(directory: impl Into<PathBuf>, max_size: u64) -> Cache {
        Cache {
            store: DiskLruCache::open(
                directory,
                APP_VERSION,
                VALUE_COUNT,
                max_size,
                TaskRunner::global(),
            ),
            request_count: AtomicU64::new(0),
            network_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn key(url: &HttpUrl) -> String {
        let digest = Sha256::digest(url.to_string().as_bytes());
        let mut out = String::with_capacity(64);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Looks up a stored response for `request`, honoring `Vary`.
    /// Returns the response and the entry's sequence number.
    pub(crate) fn get(&self, request: &Request) -> Option<(Response, u64)> {
        let key = Cache::key(request.cache_url());
        let mut snapshot = self.store.get(&key)?;
        let entry = match Entry::read(&mut snapshot.sources[ENTRY_METADATA]) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("dropping unreadable cache entry: {}", e);
                self.store.remove(&key);
                return None;
            }
        };
        if !entry.matches(request) {
            return None;
        }
        let sequence = snapshot.sequence_number;
        let body_len = snapshot.lengths[ENTRY_BODY];
        let body = snapshot.sources.remove(ENTRY_BODY);
        Some((entry.response(request, body, body_len), sequence))
    }

    /// Begins storing `response`. Returns `None` when the response is
    /// not cacheable at the storage layer.
    pub(crate) fn put(&self, response: &Response) -> Option<CacheWriter> {
        let request = response.request();
        if request.method() != http::Method::GET {
            // Other methods have marginal hit rates; match the original
            // engine and store GET responses only.
            return None;
        }
        if has_vary_all(response.headers()) {
            return None;
        }
        let entry = Entry::from_response(response);
        let key = Cache::key(request.cache_url());
        let mut editor = self.store.edit(&key, None)?;
        match Self::write_metadata(&mut editor, &entry) {
            Ok(()) => {}
            Err(e) => {
                warn!("cache metadata write failed: {}", e);
                editor.abort();
                return None;
            }
        }
        let body_sink = match editor.new_sink(ENTRY_BODY) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("cache body open failed: {}", e);
                editor.abort();
                return None;
            }
        };
        Some(CacheWriter {
            editor: Some(editor),
            body_sink: Some(body_sink),
        })
    }

    /// Replaces the metadata of a cached response after a 304, keeping
    /// the stored body. Fails silently if the entry changed since
    /// `sequence`.
    pub(crate) fn update(&self, sequence: u64, response: &Response) {
        let entry = Entry::from_response(response);
        let key = Cache::key(response.request().cache_url());
        let editor = match self.store.edit(&key, Some(sequence)) {
            Some(editor) => editor,
            None => return,
        };
        let mut editor = editor;
        match Self::write_metadata(&mut editor, &entry) {
            Ok(()) => {
                // The body stream is untouched so the old bytes survive.
                editor.commit();
            }
            Err(e) => {
                warn!("cache update failed: {}", e);
                editor.abort();
            }
        }
    }

    fn write_metadata(editor: &mut Editor, entry: &Entry) -> io::Result<()> {
        let mut sink = editor.new_sink(ENTRY_METADATA)?;
        entry.write(&mut sink)?;
        sink.flush()
    }

    /// Drops any entry for `request`'s URL; used when a non-safe method
    /// gets a non-error response.
    pub(crate) fn invalidate(&self, request: &Request) {
        self.store.remove(&Cache::key(request.cache_url()));
    }

    pub(crate) fn track_response(&self, strategy: &CacheStrategy) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if strategy.network_request.is_some() {
            self.network_count.fetch_add(1, Ordering::Relaxed);
        } else if strategy.cache_response.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn track_conditional_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn network_count(&self) -> u64 {
        self.network_count.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Total size of stored entries in bytes.
    pub fn size(&self) -> u64 {
        self.store.size()
    }

    pub fn max_size(&self) -> u64 {
        self.store.max_size()
    }

    /// Removes every stored response.
    pub fn evict_all(&self) {
        self.store.evict_all();
    }

    pub fn close(&self) {
        self.store.close();
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("size", &self.size()).finish()
    }
}

/// Streams a network body into the cache as the application reads it.
pub(crate) struct CacheWriter {
    editor: Option<Editor>,
    body_sink: Option<File>,
}

impl CacheWriter {
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.body_sink {
            Some(ref mut sink) => sink.write_all(data),
            None => Ok(()),
        }
    }

    /// Publishes the entry; call only after the body completed.
    pub(crate) fn commit(mut self) {
        if let Some(mut sink) = self.body_sink.take() {
            let _ = sink.flush();
        }
        if let Some(editor) = self.editor.take() {
            editor.commit();
        }
    }

    pub(crate) fn abort(mut self) {
        self.body_sink.take();
        if let Some(editor) = self.editor.take() {
            editor.abort();
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Unfinished bodies must never publish.
        if let Some(editor) = self.editor.take() {
            editor.abort();
        }
    }
}

fn has_vary_all(headers: &Headers) -> bool {
    headers.comma_values("Vary").iter().any(|v| v == "*")
}

/// The header names a response varies on.
fn vary_fields(headers: &Headers) -> Vec<String> {
    let mut fields = headers.comma_values("Vary");
    fields.sort();
    fields.dedup();
    fields
}

/// The serialized form of one cached response.
struct Entry {
    url: String,
    request_method: String,
    vary_headers: Headers,
    protocol: Protocol,
    code: u16,
    message: String,
    response_headers: Headers,
    handshake: Option<Handshake>,
    sent_request_millis: u64,
    received_response_millis: u64,
}

impl Entry {
    fn from_response(response: &Response) -> Entry {
        let request = response.request();
        let mut vary_headers = Headers::builder();
        for field in vary_fields(response.headers()) {
            for value in request.headers().values(&field) {
                vary_headers.add_checked(&field, value);
            }
        }
        Entry {
            url: request.cache_url().to_string(),
            request_method: request.method().to_string(),
            vary_headers: vary_headers.build(),
            protocol: response.protocol(),
            code: response.code(),
            message: response.message().to_string(),
            response_headers: response.headers().clone(),
            handshake: response.handshake().cloned(),
            sent_request_millis: response.sent_request_at_millis(),
            received_response_millis: response.received_response_at_millis(),
        }
    }

    fn write(&self, sink: &mut dyn Write) -> io::Result<()> {
        writeln!(sink, "{}", self.url)?;
        writeln!(sink, "{}", self.request_method)?;
        writeln!(sink, "{}", self.vary_headers.len())?;
        for (name, value) in &self.vary_headers {
            writeln!(sink, "{}: {}", name, value)?;
        }
        writeln!(
            sink,
            "{} {} {}",
            match self.protocol {
                Protocol::Http11 => "HTTP/1.1",
                Protocol::H2 | Protocol::H2PriorKnowledge => "h2",
            },
            self.code,
            self.message
        )?;
        writeln!(sink, "{}", self.response_headers.len() + 2)?;
        for (name, value) in &self.response_headers {
            writeln!(sink, "{}: {}", name, value)?;
        }
        writeln!(sink, "{}: {}", SENT_MILLIS, self.sent_request_millis)?;
        writeln!(sink, "{}: {}", RECEIVED_MILLIS, self.received_response_millis)?;

        if let Some(ref handshake) = self.handshake {
            writeln!(sink)?;
            writeln!(sink, "{}", handshake.cipher_suite)?;
            writeln!(sink, "{}", handshake.peer_certificates.len())?;
            for cert in &handshake.peer_certificates {
                writeln!(
                    sink,
                    "{}",
                    base64::engine::general_purpose::STANDARD.encode(cert)
                )?;
            }
            writeln!(sink, "{}", handshake.local_certificates.len())?;
            for cert in &handshake.local_certificates {
                writeln!(
                    sink,
                    "{}",
                    base64::engine::general_purpose::STANDARD.encode(cert)
                )?;
            }
            writeln!(sink, "{}", handshake.tls_version)?;
        }
        Ok(())
    }

    fn read(source: &mut File) -> io::Result<Entry> {
        let mut reader = BufReader::new(source);
        let url = read_line(&mut reader)?;
        let request_method = read_line(&mut reader)?;
        let vary_count = read_count(&mut reader)?;
        let mut vary_headers = Headers::lenient_builder();
        for _ in 0..vary_count {
            let line = read_line(&mut reader)?;
            vary_headers
                .add_line(&line)
                .map_err(|_| invalid("bad vary header"))?;
        }

        let status_line = read_line(&mut reader)?;
        let mut status_parts = status_line.splitn(3, ' ');
        let protocol = match status_parts.next().unwrap_or("") {
            "HTTP/1.1" | "HTTP/1.0" => Protocol::Http11,
            "h2" => Protocol::H2,
            other => return Err(invalid_owned(format!("bad protocol: {}", other))),
        };
        let code = status_parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| invalid("bad status code"))?;
        let message = status_parts.next().unwrap_or("").to_string();

        let header_count = read_count(&mut reader)?;
        let mut response_headers = Headers::lenient_builder();
        let mut sent_request_millis = 0u64;
        let mut received_response_millis = 0u64;
        for _ in 0..header_count {
            let line = read_line(&mut reader)?;
            if let Some(value) = line.strip_prefix(&format!("{}: ", SENT_MILLIS)) {
                sent_request_millis = value.parse().map_err(|_| invalid("bad sent millis"))?;
            } else if let Some(value) = line.strip_prefix(&format!("{}: ", RECEIVED_MILLIS)) {
                received_response_millis =
                    value.parse().map_err(|_| invalid("bad received millis"))?;
            } else {
                response_headers
                    .add_line(&line)
                    .map_err(|_| invalid("bad response header"))?;
            }
        }

        let handshake = if url.starts_with("https://") {
            let blank = read_line(&mut reader)?;
            if !blank.is_empty() {
                return Err(invalid("expected blank line before TLS section"));
            }
            let cipher_suite = read_line(&mut reader)?;
            let peer_certificates = read_certs(&mut reader)?;
            let local_certificates = read_certs(&mut reader)?;
            let tls_version = read_line(&mut reader)?;
            Some(Handshake {
                tls_version,
                cipher_suite,
                peer_certificates,
                local_certificates,
            })
        } else {
            None
        };

        Ok(Entry {
            url,
            request_method,
            vary_headers: vary_headers.build(),
            protocol,
            code,
            message,
            response_headers: response_headers.build(),
            handshake,
            sent_request_millis,
            received_response_millis,
        })
    }

    /// True when `request` would have sent the same vary header values.
    fn matches(&self, request: &Request) -> bool {
        if self.url != request.cache_url().to_string() {
            return false;
        }
        if self.request_method != request.method().as_str() {
            return false;
        }
        let varied: Vec<String> = self
            .vary_headers
            .iter()
            .map(|(n, _)| n.to_string())
            .collect();
        for name in varied {
            if self.vary_headers.values(&name) != request.headers().values(&name) {
                return false;
            }
        }
        true
    }

    fn response(&self, request: &Request, body: File, body_len: u64) -> Response {
        let content_type = self.response_headers.get("Content-Type").map(String::from);
        Response::builder()
            .request(request.clone())
            .protocol(self.protocol)
            .code(self.code)
            .message(self.message.clone())
            .headers(self.response_headers.clone())
            .handshake(self.handshake.clone())
            .body(Some(ResponseBody::new(
                content_type,
                Some(body_len),
                Box::new(FileBodySource { file: body }),
            )))
            .sent_request_at_millis(self.sent_request_millis)
            .received_response_at_millis(self.received_response_millis)
            .build()
            .expect("cached entry builds a response")
    }
}

struct FileBodySource {
    file: File,
}

impl Read for FileBodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl crate::body::BodySource for FileBodySource {}

fn read_line(reader: &mut BufReader<&mut File>) -> io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn read_count(reader: &mut BufReader<&mut File>) -> io::Result<usize> {
    read_line(reader)?
        .parse::<usize>()
        .map_err(|_| invalid("expected a count"))
}

fn read_certs(reader: &mut BufReader<&mut File>) -> io::Result<Vec<Vec<u8>>> {
    let count = read_count(reader)?;
    if count > 64 {
        return Err(invalid("implausible certificate count"));
    }
    let mut certs = Vec::with_capacity(count);
    for _ in 0..count {
        let line = read_line(reader)?;
        let der = base64::engine::general_purpose::STANDARD
            .decode(line.as_bytes())
            .map_err(|_| invalid("bad certificate encoding"))?;
        certs.push(der);
    }
    Ok(certs)
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn invalid_owned(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

// ===== CacheStrategy =====

/// The decision for one request: consult the network, serve from cache,
/// or both (a conditional request). Neither means the request demanded
/// cache-only service that the cache cannot give (504).
pub(crate) struct CacheStrategy {
    pub(crate) network_request: Option<Request>,
    pub(crate) cache_response: Option<Response>,
}

impl CacheStrategy {
    /// Computes the strategy per RFC 7234.
    pub(crate) fn compute(
        now_millis: u64,
        request: &Request,
        cache_response: Option<Response>,
    ) -> CacheStrategy {
        let candidate = Self::compute_candidate(now_millis, request, cache_response);
        if candidate.network_request.is_some() && request.cache_control().only_if_cached {
            // Forbidden from the network, and the cache cannot satisfy.
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }
        candidate
    }

    fn compute_candidate(
        now_millis: u64,
        request: &Request,
        cache_response: Option<Response>,
    ) -> CacheStrategy {
        let network_only = |request: &Request| CacheStrategy {
            network_request: Some(request.clone()),
            cache_response: None,
        };

        let cached = match cache_response {
            Some(cached) => cached,
            None => return network_only(request),
        };

        // An https response missing its handshake was stored badly.
        if request.url().is_https() && cached.handshake().is_none() {
            return network_only(request);
        }

        if !is_cacheable(&cached, request) {
            return network_only(request);
        }

        let request_cc = request.cache_control();
        if request_cc.no_cache || has_conditions(request) {
            return network_only(request);
        }

        let response_cc = cached.cache_control();
        let age_millis = cache_response_age(now_millis, &cached);
        let mut fresh_millis = compute_freshness_lifetime(&cached);
        if let Some(max_age) = request_cc.max_age {
            fresh_millis = fresh_millis.min(max_age.as_millis() as u64);
        }
        let min_fresh_millis = request_cc
            .min_fresh
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let max_stale_millis = if response_cc.must_revalidate {
            0
        } else if request_cc.max_stale_unbounded {
            u64::MAX / 2
        } else {
            request_cc
                .max_stale
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        };

        if !response_cc.no_cache
            && age_millis + min_fresh_millis < fresh_millis + max_stale_millis
        {
            let mut cached = cached;
            let body = cached.take_body();
            let mut builder = cached.to_builder();
            if age_millis + min_fresh_millis >= fresh_millis {
                if let Ok(with_warning) =
                    builder.header("Warning", "110 HttpURLConnection \"Response is stale\"")
                {
                    builder = with_warning;
                } else {
                    builder = cached.to_builder();
                }
            }
            let response = builder
                .request(request.clone())
                .body(body)
                .build()
                .expect("cached response rebuilds");
            return CacheStrategy {
                network_request: None,
                cache_response: Some(response),
            };
        }

        // Revalidate with the origin if the stored response has a
        // validator; otherwise it is useless.
        let (condition_name, condition_value) = if let Some(etag) = cached.header("ETag") {
            ("If-None-Match", etag.to_string())
        } else if let Some(last_modified) = cached.header("Last-Modified") {
            ("If-Modified-Since", last_modified.to_string())
        } else if let Some(date) = cached.header("Date") {
            ("If-Modified-Since", date.to_string())
        } else {
            return network_only(request);
        };

        let conditional = match request
            .to_builder()
            .header(condition_name, &condition_value)
        {
            Ok(builder) => builder.build().expect("conditional request builds"),
            Err(_) => return network_only(request),
        };
        CacheStrategy {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }
}

/// Whether `response` may be stored and later served (RFC 7234 §3).
pub(crate) fn is_cacheable(response: &Response, request: &Request) -> bool {
    match response.code() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            // Only cacheable with explicit freshness or public markers.
            let cc = response.cache_control();
            if response.header("Expires").is_none()
                && cc.max_age.is_none()
                && !cc.is_public
                && !cc.is_private
            {
                return false;
            }
        }
        _ => return false,
    }
    !response.cache_control().no_store && !request.cache_control().no_store
}

fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

/// The age of a cached response per RFC 7234 §4.2.3.
fn cache_response_age(now_millis: u64, cached: &Response) -> u64 {
    let served_date_millis = cached.headers().get_date("Date").map(millis_of);
    let received = cached.received_response_at_millis();
    let sent = cached.sent_request_at_millis();

    let apparent_received_age = served_date_millis
        .map(|served| received.saturating_sub(served))
        .unwrap_or(0);
    let age_header_millis = cached
        .header("Age")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or(0);
    let received_age = apparent_received_age.max(age_header_millis);

    let response_duration = received.saturating_sub(sent);
    let residence_duration = now_millis.saturating_sub(received);
    received_age + response_duration + residence_duration
}

/// How long the response stays fresh, in milliseconds.
fn compute_freshness_lifetime(cached: &Response) -> u64 {
    let response_cc = cached.cache_control();
    if let Some(max_age) = response_cc.max_age {
        return max_age.as_millis() as u64;
    }
    let served_millis = cached
        .headers()
        .get_date("Date")
        .map(millis_of)
        .unwrap_or_else(|| cached.received_response_at_millis());
    if let Some(expires) = cached.headers().get_date("Expires") {
        return millis_of(expires).saturating_sub(served_millis);
    }
    // Heuristic freshness for responses with a validator but no
    // explicit lifetime: a tenth of the document's age, query-free
    // URLs only.
    if let Some(last_modified) = cached.headers().get_date("Last-Modified") {
        if cached.request().url().query().is_none() {
            return served_millis.saturating_sub(millis_of(last_modified)) / 10;
        }
    }
    0
}

fn millis_of(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub(crate) fn now_millis() -> u64 {
    millis_of(SystemTime::now())
}

/// Headers that describe the connection, not the entity; never copied
/// into a cache entry during a 304 merge.
fn is_end_to_end(name: &str) -> bool {
    !matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Whether a 304's copy of `name` should replace the stored one.
fn is_content_specific(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length" | "content-encoding" | "content-type"
    )
}

/// Merges network headers into cached headers after a 304 (RFC 7234
/// §4.3.4): hop-by-hop fields drop, 100-level metadata stays.
pub(crate) fn combine_headers(cached: &Headers, network: &Headers) -> Headers {
    let mut out = Headers::lenient_builder();
    for (name, value) in cached {
        if !is_end_to_end(name) {
            continue;
        }
        // Superseded by the revalidation response?
        if !is_content_specific(name) && network.get(name).is_some() {
            continue;
        }
        out.add_checked(name, value);
    }
    for (name, value) in network {
        if !is_end_to_end(name) || is_content_specific(name) {
            continue;
        }
        out.add_checked(name, value);
    }
    out.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    fn cached_response(headers: &[&str], sent: u64, received: u64) -> Response {
        Response::builder()
            .request(request("http://x.test/a"))
            .code(200)
            .message("OK")
            .headers(Headers::of(headers))
            .body(Some(ResponseBody::from_bytes(None, Bytes::from("abc"))))
            .sent_request_at_millis(sent)
            .received_response_at_millis(received)
            .build()
            .unwrap()
    }

    #[test]
    fn cache_key_is_sha256_hex() {
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let key = Cache::key(&url);
        assert_eq!(key.len(), 64);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(key, Cache::key(&HttpUrl::parse("http://example.com/").unwrap()));
    }

    #[test]
    fn no_cached_response_goes_to_network() {
        let strategy = CacheStrategy::compute(1_000, &request("http://x.test/a"), None);
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn fresh_response_served_from_cache() {
        let now = 10_000;
        let cached = cached_response(&["Cache-Control", "max-age=60"], 9_000, 9_500);
        let strategy = CacheStrategy::compute(now, &request("http://x.test/a"), Some(cached));
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_with_etag_revalidates() {
        let now = 200_000;
        let cached = cached_response(
            &["Cache-Control", "max-age=1", "ETag", "\"v1\""],
            1_000,
            1_100,
        );
        let strategy = CacheStrategy::compute(now, &request("http://x.test/a"), Some(cached));
        let network = strategy.network_request.expect("conditional request");
        assert_eq!(network.header("If-None-Match"), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_without_validator_goes_to_network() {
        let now = 200_000;
        let cached = cached_response(&["Cache-Control", "max-age=1"], 1_000, 1_100);
        let strategy = CacheStrategy::compute(now, &request("http://x.test/a"), Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn only_if_cached_unsatisfiable() {
        let request = Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Cache-Control", "only-if-cached")
            .unwrap()
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(1_000, &request, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn request_no_cache_forces_network() {
        let request = Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Cache-Control", "no-cache")
            .unwrap()
            .build()
            .unwrap();
        let cached = cached_response(&["Cache-Control", "max-age=600"], 500, 600);
        let strategy = CacheStrategy::compute(1_000, &request, Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn age_formula_accumulates() {
        // Served at 0 per Date; received at 2_000 after a 1_000ms trip;
        // now 10_000. age = max(2000-0, 0) + (2000-1000) + (10000-2000).
        let cached = cached_response(
            &["Date", "Thu, 01 Jan 1970 00:00:00 GMT", "Cache-Control", "max-age=60"],
            1_000,
            2_000,
        );
        assert_eq!(cache_response_age(10_000, &cached), 2_000 + 1_000 + 8_000);
    }

    #[test]
    fn combine_headers_prefers_network_but_keeps_content_fields() {
        let cached = Headers::of(&[
            "Content-Type", "text/plain",
            "ETag", "\"v1\"",
            "Transfer-Encoding", "chunked",
        ]);
        let network = Headers::of(&[
            "ETag", "\"v2\"",
            "X-Extra", "y",
            "Content-Type", "application/octet-stream",
        ]);
        let merged = combine_headers(&cached, &network);
        assert_eq!(merged.get("ETag"), Some("\"v2\""));
        assert_eq!(merged.get("X-Extra"), Some("y"));
        // Content metadata of the stored body wins over the 304's.
        assert_eq!(merged.get("Content-Type"), Some("text/plain"));
        assert!(merged.get("Transfer-Encoding").is_none());
    }

    #[test]
    fn not_cacheable_status() {
        let cached = cached_response(&[], 0, 0);
        assert!(is_cacheable(&cached, &request("http://x.test/a")));
        let mut partial = cached_response(&[], 0, 0).to_builder();
        partial = partial.code(206);
        let partial = partial
            .request(request("http://x.test/a"))
            .build()
            .unwrap();
        assert!(!is_cacheable(&partial, &request("http://x.test/a")));
    }

    #[test]
    fn no_store_blocks_caching() {
        let cached = cached_response(&["Cache-Control", "no-store"], 0, 0);
        assert!(!is_cacheable(&cached, &request("http://x.test/a")));
    }

    #[test]
    fn round_trip_entry_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10 * 1024);
        let response = Response::builder()
            .request(request("http://x.test/a"))
            .code(200)
            .message("OK")
            .headers(Headers::of(&["Content-Type", "text/plain", "ETag", "\"v1\""]))
            .sent_request_at_millis(111)
            .received_response_at_millis(222)
            .build()
            .unwrap();
        let mut writer = cache.put(&response).expect("cacheable");
        writer.write(b"abc").unwrap();
        writer.commit();

        let (stored, _seq) = cache.get(&request("http://x.test/a")).expect("hit");
        assert_eq!(stored.code(), 200);
        assert_eq!(stored.header("ETag"), Some("\"v1\""));
        assert_eq!(stored.sent_request_at_millis(), 111);
        assert_eq!(stored.received_response_at_millis(), 222);
        assert_eq!(stored.into_body().string().unwrap(), "abc");
    }

    #[test]
    fn vary_mismatch_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10 * 1024);
        let original_request = Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Accept-Language", "en")
            .unwrap()
            .build()
            .unwrap();
        let response = Response::builder()
            .request(original_request)
            .code(200)
            .headers(Headers::of(&["Vary", "Accept-Language"]))
            .build()
            .unwrap();
        let mut writer = cache.put(&response).expect("cacheable");
        writer.write(b"en body").unwrap();
        writer.commit();

        let same = Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Accept-Language", "en")
            .unwrap()
            .build()
            .unwrap();
        assert!(cache.get(&same).is_some());

        let different = Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Accept-Language", "fr")
            .unwrap()
            .build()
            .unwrap();
        assert!(cache.get(&different).is_none());
    }

    #[test]
    fn vary_star_never_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10 * 1024);
        let response = Response::builder()
            .request(request("http://x.test/a"))
            .code(200)
            .headers(Headers::of(&["Vary", "*"]))
            .build()
            .unwrap();
        assert!(cache.put(&response).is_none());
    }
}
