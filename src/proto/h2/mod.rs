//! HTTP/2 support: framing, HPACK, a multiplexed connection, and the
//! exchange codec bridging streams to the call pipeline.

pub(crate) mod conn;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod huffman;
pub(crate) mod settings;
pub(crate) mod stream;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::body::BodySource;
use crate::error::Error;
use crate::headers::Headers;
use crate::protocol::Protocol;
use crate::proto::ResponseHead;
use crate::request::Request;

pub use frame::ErrorCode;

use self::conn::Http2Connection;
use self::stream::{FramingSink, FramingSource, Http2Stream};

/// Decoded header fields in wire order, pseudo-headers included.
pub(crate) type HeaderBlock = Vec<(String, String)>;

/// Converts a decoded block into [`Headers`], optionally extracting the
/// `:status` pseudo-header. Pseudo-headers are rejected where they are
/// not expected.
pub(crate) fn headers_from_block(
    block: &HeaderBlock,
    allow_pseudo: bool,
) -> crate::Result<Headers> {
    let mut builder = Headers::lenient_builder();
    for (name, value) in block {
        if let Some(stripped) = name.strip_prefix(':') {
            if !allow_pseudo {
                return Err(Error::new_protocol(format!(
                    "unexpected pseudo-header :{}",
                    stripped
                )));
            }
            continue;
        }
        builder.add_line(&format!("{}: {}", name, value))?;
    }
    Ok(builder.build())
}

/// Request headers that are connection-specific and must not cross an
/// HTTP/2 framing boundary.
fn is_forbidden_request_header(name: &str) -> bool {
    matches!(
        name,
        "connection" | "host" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Maps a request to its HTTP/2 header list: pseudo-header fields first,
/// then the remaining fields lowercased.
pub(crate) fn http2_headers_list(request: &Request) -> HeaderBlock {
    let url = request.url();
    let mut out: HeaderBlock = Vec::with_capacity(request.headers().len() + 4);
    out.push((":method".to_string(), request.method().as_str().to_string()));
    out.push((":path".to_string(), url.encoded_path_and_query()));
    out.push((":authority".to_string(), url.host_header()));
    out.push((":scheme".to_string(), url.scheme().to_string()));
    for (name, value) in request.headers() {
        let lower = name.to_ascii_lowercase();
        if is_forbidden_request_header(&lower) {
            continue;
        }
        // TE is allowed only to advertise trailers.
        if lower == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        out.push((lower, value.to_string()));
    }
    out
}

/// The HTTP/2 half of the exchange codec pair.
pub(crate) struct Http2ExchangeCodec {
    conn: Arc<Http2Connection>,
    stream: Mutex<Option<Arc<Http2Stream>>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Http2ExchangeCodec {
    pub(crate) fn new(
        conn: Arc<Http2Connection>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Http2ExchangeCodec {
        Http2ExchangeCodec {
            conn,
            stream: Mutex::new(None),
            read_timeout,
            write_timeout,
        }
    }

    fn stream(&self) -> crate::Result<Arc<Http2Stream>> {
        self.stream
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new_protocol("no stream opened for this exchange"))
    }

    pub(crate) fn write_request_headers(
        &self,
        request: &Request,
        has_body: bool,
    ) -> crate::Result<()> {
        let headers = http2_headers_list(request);
        let stream = self.conn.new_stream(&headers, !has_body)?;
        stream.set_timeouts(self.read_timeout, self.write_timeout);
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    pub(crate) fn create_request_body(&self) -> crate::Result<FramingSink> {
        Ok(FramingSink {
            stream: self.stream()?,
            finished: false,
        })
    }

    pub(crate) fn flush_request(&self) -> crate::Result<()> {
        self.conn.flush()
    }

    pub(crate) fn finish_request(&self) -> crate::Result<()> {
        // Bodyless requests closed their half with END_STREAM on HEADERS.
        Ok(())
    }

    /// Takes HEADERS blocks until a final response arrives.
    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> crate::Result<Option<ResponseHead>> {
        let stream = self.stream()?;
        loop {
            let block = stream.take_headers()?;
            let mut status: Option<u16> = None;
            for (name, value) in &block {
                if name == ":status" {
                    status = value.parse::<u16>().ok();
                }
            }
            let code = status.ok_or_else(|| Error::new_protocol("response has no :status"))?;
            if (100..200).contains(&code) {
                if expect_continue && code == 100 {
                    return Ok(None);
                }
                continue;
            }
            let headers = headers_from_block(&block, true)?;
            return Ok(Some(ResponseHead {
                protocol: Protocol::H2,
                code,
                message: String::new(),
                headers,
            }));
        }
    }

    pub(crate) fn open_response_body(
        &self,
        head: &ResponseHead,
    ) -> crate::Result<(Option<u64>, Box<dyn BodySource>)> {
        let stream = self.stream()?;
        let content_length = head
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok((content_length, Box::new(FramingSource { stream })))
    }

    pub(crate) fn trailers(&self) -> crate::Result<Headers> {
        self.stream()?.take_trailers()
    }

    /// True when the stream failed in a way another connection can cure.
    pub(crate) fn is_retryable_error(error: &Error) -> bool {
        error.is_stream_reset() && error.h2_error_code().is_retryable()
    }

    pub(crate) fn cancel(&self) {
        if let Some(stream) = self.stream.lock().unwrap().clone() {
            self.conn.reset_stream(stream.id, ErrorCode::Cancel);
        }
    }
}

impl std::fmt::Debug for Http2ExchangeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Http2ExchangeCodec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_list_has_pseudo_first() {
        let request = Request::builder()
            .url("https://x.test:8443/a?q=1")
            .unwrap()
            .header("Accept", "text/plain")
            .unwrap()
            .header("Connection", "keep-alive")
            .unwrap()
            .header("TE", "trailers")
            .unwrap()
            .build()
            .unwrap();
        let list = http2_headers_list(&request);
        assert_eq!(list[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(list[1], (":path".to_string(), "/a?q=1".to_string()));
        assert_eq!(list[2], (":authority".to_string(), "x.test:8443".to_string()));
        assert_eq!(list[3], (":scheme".to_string(), "https".to_string()));
        assert!(list.contains(&("accept".to_string(), "text/plain".to_string())));
        assert!(list.contains(&("te".to_string(), "trailers".to_string())));
        assert!(!list.iter().any(|(n, _)| n == "connection"));
    }

    #[test]
    fn pseudo_rejected_in_trailers() {
        let block: HeaderBlock = vec![(":status".into(), "200".into())];
        assert!(headers_from_block(&block, false).is_err());
        assert!(headers_from_block(&block, true).unwrap().is_empty());
    }
}
