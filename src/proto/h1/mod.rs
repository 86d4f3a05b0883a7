//! The HTTP/1.1 exchange codec.
//!
//! One codec is bound to one socket for the life of the connection and
//! drives exchanges through a strict lifecycle:
//!
//! ```text
//! IDLE -> OPEN_REQUEST_BODY -> WRITING_REQUEST_BODY
//!      -> READ_RESPONSE_HEADERS -> OPEN_RESPONSE_BODY
//!      -> READING_RESPONSE_BODY -> IDLE (reusable) | CLOSED
//! ```
//!
//! Any protocol violation or I/O failure moves the codec to CLOSED and
//! poisons the carrying connection against further exchanges.

mod decode;
mod encode;
pub(crate) mod parse;

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::body::BodySource;
use crate::error::Error;
use crate::headers::Headers;
use crate::proto::ResponseHead;
use crate::request::Request;
use crate::transport::{SocketHandle, Transport};

use self::decode::Decoder;
use self::encode::Encoder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    OpenRequestBody,
    WritingRequestBody,
    ReadResponseHeaders,
    OpenResponseBody,
    ReadingResponseBody,
    Closed,
}

pub(crate) struct Http1Codec {
    socket: SocketHandle,
    inner: Mutex<Inner>,
}

struct Inner {
    source: BufReader<Box<dyn Read + Send>>,
    sink: BufWriter<Box<dyn Write + Send>>,
    state: State,
    decoder: Option<Decoder>,
    encoder: Option<Encoder>,
    /// Trailers captured when a chunked body reached EOF.
    trailers: Option<Headers>,
    /// Sticky: set on any framing violation or transport failure.
    poisoned: bool,
}

impl Inner {
    fn poison(&mut self) {
        self.poisoned = true;
        self.state = State::Closed;
    }
}

impl Http1Codec {
    pub(crate) fn new(transport: Transport) -> Http1Codec {
        Http1Codec {
            socket: transport.socket,
            inner: Mutex::new(Inner {
                source: transport.source,
                sink: transport.sink,
                state: State::Idle,
                decoder: None,
                encoder: None,
                trailers: None,
                poisoned: false,
            }),
        }
    }

    pub(crate) fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// True when a new exchange may begin on this codec.
    pub(crate) fn is_reusable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == State::Idle && !inner.poisoned
    }

    pub(crate) fn cancel(&self) {
        self.socket.shutdown();
    }

    /// Probes an idle connection with a 1 ms read: pending bytes or EOF
    /// mean the server already gave up on it.
    pub(crate) fn probe_alive(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.poisoned {
            return false;
        }
        if inner.state != State::Idle {
            // In use; the owning exchange vouches for it.
            return true;
        }
        if self
            .socket
            .set_read_timeout(Some(std::time::Duration::from_millis(1)))
            .is_err()
        {
            return false;
        }
        // EOF and unsolicited bytes both disqualify an idle connection.
        let alive = match inner.source.fill_buf() {
            Ok(_) => false,
            Err(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
        };
        let _ = self.socket.set_read_timeout(None);
        alive
    }

    /// Writes the request line and headers. The request line is built by
    /// the caller because proxies require absolute-form targets.
    pub(crate) fn write_request_headers(
        &self,
        request: &Request,
        request_line: &str,
    ) -> crate::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Idle {
            return Err(Error::new_protocol(format!(
                "unexpected request in state {:?}",
                inner.state
            )));
        }
        trace!("request line: {}", request_line.trim_end());
        let result = (|| -> io::Result<()> {
            let Inner { ref mut sink, .. } = *inner;
            sink.write_all(request_line.as_bytes())?;
            for (name, value) in request.headers() {
                sink.write_all(name.as_bytes())?;
                sink.write_all(b": ")?;
                sink.write_all(value.as_bytes())?;
                sink.write_all(b"\r\n")?;
            }
            sink.write_all(b"\r\n")?;
            Ok(())
        })();
        if let Err(e) = result {
            inner.poison();
            return Err(Error::new_io(e));
        }
        inner.state = State::OpenRequestBody;
        Ok(())
    }

    /// Returns a sink that frames the request body. `content_length` of
    /// `None` selects chunked encoding.
    pub(crate) fn create_request_body(
        self: &Arc<Self>,
        content_length: Option<u64>,
    ) -> crate::Result<Http1BodySink> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenRequestBody {
            return Err(Error::new_protocol(format!(
                "unexpected request body in state {:?}",
                inner.state
            )));
        }
        inner.encoder = Some(match content_length {
            Some(len) => Encoder::KnownLength { remaining: len },
            None => Encoder::Chunked,
        });
        inner.state = State::WritingRequestBody;
        Ok(Http1BodySink {
            codec: self.clone(),
            closed: false,
        })
    }

    /// Flushes buffered request bytes to the socket.
    pub(crate) fn flush_request(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Err(e) = inner.sink.flush() {
            inner.poison();
            return Err(Error::new_io(e));
        }
        Ok(())
    }

    /// Marks the request as fully transmitted.
    pub(crate) fn finish_request(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::OpenRequestBody {
            inner.state = State::ReadResponseHeaders;
        }
        if let Err(e) = inner.sink.flush() {
            inner.poison();
            return Err(Error::new_io(e));
        }
        Ok(())
    }

    /// Reads response heads until a non-informational one arrives.
    ///
    /// With `expect_continue`, a `100 Continue` returns `None` so the
    /// caller can begin transmitting the request body. Other 1xx heads
    /// (102 Processing, 103 Early Hints) are consumed and re-read.
    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> crate::Result<Option<ResponseHead>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::OpenRequestBody
            | State::WritingRequestBody
            | State::ReadResponseHeaders => {}
            state => {
                return Err(Error::new_protocol(format!(
                    "unexpected response read in state {:?}",
                    state
                )))
            }
        }
        if let Err(e) = inner.sink.flush() {
            inner.poison();
            return Err(Error::new_io(e));
        }

        loop {
            let head = {
                let Inner { ref mut source, .. } = *inner;
                match parse::read_response_head(source) {
                    Ok(head) => head,
                    Err(e) => {
                        inner.poison();
                        return Err(e);
                    }
                }
            };
            debug!("<- {} {}", head.code, head.message);
            match head.code {
                100 if expect_continue => {
                    inner.state = State::OpenRequestBody;
                    return Ok(None);
                }
                100 | 102 | 103 => {
                    // Informational; the real response follows.
                    continue;
                }
                _ => {
                    inner.state = State::OpenResponseBody;
                    return Ok(Some(head));
                }
            }
        }
    }

    /// Opens the response body source. `request_method_head` is true for
    /// HEAD requests, whose responses never carry a body.
    pub(crate) fn open_response_body(
        self: &Arc<Self>,
        head: &ResponseHead,
        request_method_head: bool,
    ) -> crate::Result<Http1BodyInfo> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenResponseBody {
            return Err(Error::new_protocol(format!(
                "unexpected response body in state {:?}",
                inner.state
            )));
        }

        let reported_length = head
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        let decoder = if request_method_head
            || head.code == 204
            || head.code == 304
            || (100..200).contains(&head.code)
        {
            Decoder::empty()
        } else if head
            .headers
            .contains_value("Transfer-Encoding", "chunked")
        {
            Decoder::chunked()
        } else if let Some(len) = reported_length {
            Decoder::length(len)
        } else {
            // Unknown length: read to EOF; the connection dies with it.
            inner.poisoned = true;
            Decoder::eof()
        };

        let content_length = if decoder.is_chunked() {
            None
        } else {
            reported_length
        };
        if decoder.is_done() {
            // No body bytes will follow; the codec is immediately free
            // for the next exchange.
            inner.decoder = None;
            inner.trailers = Some(Headers::new());
            inner.state = State::Idle;
        } else {
            inner.decoder = Some(decoder);
            inner.trailers = None;
            inner.state = State::ReadingResponseBody;
        }
        Ok(Http1BodyInfo {
            content_length,
            source: Box::new(Http1BodySource {
                codec: self.clone(),
            }),
        })
    }

    /// Trailers of the most recently completed chunked response body.
    pub(crate) fn trailers(&self) -> crate::Result<Headers> {
        let inner = self.inner.lock().unwrap();
        if let Some(ref trailers) = inner.trailers {
            return Ok(trailers.clone());
        }
        match inner.decoder {
            Some(ref decoder) if decoder.is_chunked() && !decoder.is_done() => Err(
                Error::new_protocol("trailers requested before response body was exhausted"),
            ),
            _ => Ok(Headers::new()),
        }
    }

    fn read_body(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::ReadingResponseBody || inner.decoder.is_none() {
            // Source outlived its exchange; behave like EOF.
            return Ok(0);
        }
        let result = {
            let Inner {
                ref mut source,
                ref mut decoder,
                ..
            } = *inner;
            let decoder = decoder.as_mut().expect("decoder present");
            match decoder.read(source, buf) {
                Ok(0) => Ok((0, true, decoder.closes_connection(), decoder.take_trailers())),
                Ok(n) => Ok((n, false, false, Headers::new())),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok((n, done, closes, trailers)) => {
                if done {
                    inner.trailers = Some(trailers);
                    inner.decoder = None;
                    if closes {
                        inner.poison();
                    } else {
                        inner.state = State::Idle;
                    }
                }
                Ok(n)
            }
            Err(e) => {
                inner.poison();
                Err(e)
            }
        }
    }

    fn write_body(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::WritingRequestBody {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "request body sink is closed",
            ));
        }
        let Inner {
            ref mut sink,
            ref mut encoder,
            ..
        } = *inner;
        let encoder = match encoder {
            Some(e) => e,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "request body sink is closed",
                ))
            }
        };
        match encoder.write(sink, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                inner.poison();
                Err(e)
            }
        }
    }

    fn finish_body(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::WritingRequestBody {
            return Ok(());
        }
        let Inner {
            ref mut sink,
            ref mut encoder,
            ..
        } = *inner;
        let result = match encoder {
            Some(e) => e.finish(sink).and_then(|()| sink.flush()),
            None => Ok(()),
        };
        inner.encoder = None;
        match result {
            Ok(()) => {
                inner.state = State::ReadResponseHeaders;
                Ok(())
            }
            Err(e) => {
                inner.poison();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Http1Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Http1Codec")
            .field("state", &inner.state)
            .field("poisoned", &inner.poisoned)
            .finish()
    }
}

/// What the codec knows about a just-opened response body.
pub(crate) struct Http1BodyInfo {
    pub(crate) content_length: Option<u64>,
    pub(crate) source: Box<dyn BodySource>,
}

/// Streams a response body off the codec.
pub(crate) struct Http1BodySource {
    codec: Arc<Http1Codec>,
}

impl Read for Http1BodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.codec.read_body(buf)
    }
}

impl BodySource for Http1BodySource {
    fn trailers(&mut self) -> crate::Result<Headers> {
        self.codec.trailers()
    }
}

/// Streams a request body onto the codec.
pub(crate) struct Http1BodySink {
    codec: Arc<Http1Codec>,
    closed: bool,
}

impl Http1BodySink {
    /// Terminates the body framing and flushes.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.codec.finish_body()
    }
}

impl Write for Http1BodySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "sink closed"));
        }
        self.codec.write_body(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.codec.flush_request().map_err(|e| e.into_io())
    }
}

impl Drop for Http1BodySink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::transport::Transport;
    use std::net::{TcpListener, TcpStream};

    /// Builds a codec over a real socket pair; the returned peer stream
    /// plays the server.
    fn socket_codec() -> (Arc<Http1Codec>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let transport = Transport::plaintext(client, Protocol::Http11).unwrap();
        (Arc::new(Http1Codec::new(transport)), server)
    }

    fn request() -> Request {
        Request::builder()
            .url("http://x.test/a")
            .unwrap()
            .header("Host", "x.test")
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn round_trip_fixed_length() {
        let (codec, mut server) = socket_codec();
        codec
            .write_request_headers(&request(), "GET /a HTTP/1.1\r\n")
            .unwrap();
        codec.finish_request().unwrap();

        // The server sees the exact request bytes.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            use std::io::Read as _;
            server.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(text.contains("Host: x.test\r\n"));

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        let head = codec.read_response_headers(false).unwrap().unwrap();
        assert_eq!(head.code, 200);
        let body = codec.open_response_body(&head, false).unwrap();
        assert_eq!(body.content_length, Some(5));
        let mut source = body.source;
        let mut out = String::new();
        source.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert!(codec.is_reusable());
    }

    #[test]
    fn chunked_response_with_trailers() {
        let (codec, mut server) = socket_codec();
        codec
            .write_request_headers(&request(), "GET /a HTTP/1.1\r\n")
            .unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: X-Sum\r\n\r\n\
                  5\r\nhello\r\n0\r\nX-Sum: 5\r\n\r\n",
            )
            .unwrap();
        let head = codec.read_response_headers(false).unwrap().unwrap();
        let body = codec.open_response_body(&head, false).unwrap();
        assert_eq!(body.content_length, None);

        let mut source = body.source;
        // Trailers are unavailable until the body is exhausted.
        assert!(source.trailers().is_err());
        let mut out = String::new();
        source.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        let trailers = source.trailers().unwrap();
        assert_eq!(trailers.get("X-Sum"), Some("5"));
        assert!(codec.is_reusable());
    }

    #[test]
    fn informational_heads_are_reread() {
        let (codec, mut server) = socket_codec();
        codec
            .write_request_headers(&request(), "GET /a HTTP/1.1\r\n")
            .unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(
                b"HTTP/1.1 103 Early Hints\r\nLink: </s.css>\r\n\r\n\
                  HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();
        let head = codec.read_response_headers(false).unwrap().unwrap();
        assert_eq!(head.code, 200);
    }

    #[test]
    fn expect_continue_returns_none_on_100() {
        let (codec, mut server) = socket_codec();
        codec
            .write_request_headers(&request(), "POST /a HTTP/1.1\r\n")
            .unwrap();
        codec.flush_request().unwrap();
        server.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        assert!(codec.read_response_headers(true).unwrap().is_none());
    }

    #[test]
    fn eof_body_poisons_carrier() {
        let (codec, mut server) = socket_codec();
        codec
            .write_request_headers(&request(), "GET /a HTTP/1.1\r\n")
            .unwrap();
        codec.finish_request().unwrap();
        server.write_all(b"HTTP/1.1 200 OK\r\n\r\nunbounded").unwrap();
        drop(server);
        let head = codec.read_response_headers(false).unwrap().unwrap();
        let mut body = codec.open_response_body(&head, false).unwrap();
        let mut out = String::new();
        body.source.read_to_string(&mut out).ok();
        assert!(!codec.is_reusable());
    }
}
