//! HTTP cache behavior end to end: store, revalidate, merge.

mod support;

use std::io::{BufReader, Write};
use std::sync::Arc;

use courier::{Cache, Request};

use support::*;

#[test]
fn revalidation_merges_304_into_cached_response() {
    let addr = start_server({
        let mut hits = 0;
        move |stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            loop {
                let head = read_request_head(&mut reader);
                if head.is_empty() {
                    break;
                }
                hits += 1;
                if hits == 1 {
                    assert!(header(&head, "If-None-Match").is_none());
                    stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 3\r\n\r\nabc",
                        )
                        .unwrap();
                } else {
                    assert_eq!(header(&head, "If-None-Match"), Some("\"v1\""));
                    stream
                        .write_all(b"HTTP/1.1 304 Not Modified\r\nX-Extra: y\r\n\r\n")
                        .unwrap();
                }
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 10 * 1024 * 1024));
    let client = client_with(|config| {
        config.cache = Some(cache.clone());
    });

    // First fetch fills the cache.
    let url = format!("http://{}/x", addr);
    let response = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.into_body().string().unwrap(), "abc");

    // Second fetch revalidates and serves the merged entry.
    let response = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.header("X-Extra"), Some("y"));
    assert_eq!(response.header("ETag"), Some("\"v1\""));
    assert_eq!(
        response.cache_response().map(|r| r.code()),
        Some(200),
        "cache response link"
    );
    assert_eq!(
        response.network_response().map(|r| r.code()),
        Some(304),
        "network response link"
    );
    assert_eq!(response.into_body().string().unwrap(), "abc");

    assert_eq!(cache.request_count(), 2);
    assert!(cache.hit_count() >= 1);
}

#[test]
fn fresh_entry_serves_without_network() {
    let addr = start_server({
        let mut hits = 0;
        move |stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            loop {
                let head = read_request_head(&mut reader);
                if head.is_empty() {
                    break;
                }
                hits += 1;
                assert_eq!(hits, 1, "the second fetch must not reach the network");
                stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nCache-Control: max-age=120\r\nContent-Length: 4\r\n\r\nbody",
                    )
                    .unwrap();
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 10 * 1024 * 1024));
    let client = client_with(|config| {
        config.cache = Some(cache.clone());
    });

    let url = format!("http://{}/fresh", addr);
    let first = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    assert_eq!(first.into_body().string().unwrap(), "body");

    let second = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_none());
    assert_eq!(second.into_body().string().unwrap(), "body");
    assert_eq!(cache.hit_count(), 1);
}

#[test]
fn only_if_cached_without_entry_yields_504() {
    // No server at all: the request must not try the network.
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 1024 * 1024));
    let client = client_with(|config| {
        config.cache = Some(cache.clone());
    });

    let request = Request::builder()
        .url("http://localhost:1/only-if-cached")
        .unwrap()
        .header("Cache-Control", "only-if-cached")
        .unwrap()
        .build()
        .unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 504);
    assert_eq!(response.message(), "Unsatisfiable Request (only-if-cached)");
}

#[test]
fn post_invalidates_cached_entry() {
    let addr = start_server({
        let mut hits = 0;
        move |stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            loop {
                let head = read_request_head(&mut reader);
                if head.is_empty() {
                    break;
                }
                hits += 1;
                if request_line(&head).starts_with("POST") {
                    let length = content_length(&head);
                    let mut body = vec![0u8; length];
                    use std::io::Read;
                    reader.read_exact(&mut body).unwrap();
                    stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .unwrap();
                } else {
                    let body = format!("generation {}", hits);
                    write!(
                        stream,
                        "HTTP/1.1 200 OK\r\nCache-Control: max-age=120\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .unwrap();
                }
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 1024 * 1024));
    let client = client_with(|config| {
        config.cache = Some(cache.clone());
    });

    let url = format!("http://{}/entity", addr);
    let first = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    let first_body = first.into_body().string().unwrap();

    // Writing through the URL drops the entry.
    let post = Request::builder()
        .url(&url)
        .unwrap()
        .post(courier::Body::bytes(None, "update"))
        .unwrap()
        .build()
        .unwrap();
    client.new_call(post).execute().unwrap();

    let third = client.new_call(Request::get(&url).unwrap()).execute().unwrap();
    assert!(third.cache_response().is_none());
    let third_body = third.into_body().string().unwrap();
    assert_ne!(first_body, third_body);
}
