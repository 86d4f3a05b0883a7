//! A single request/response exchange carried by a connection.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::body::BodySource;
use crate::error::Error;
use crate::event::EventListenerRef;
use crate::proto::h1::{Http1BodySink, Http1Codec};
use crate::proto::h2::stream::FramingSink;
use crate::proto::h2::Http2ExchangeCodec;
use crate::proto::ResponseHead;
use crate::proxy::Proxy;
use crate::request::Request;

use super::connection::{CallMarker, Carrier, Connection};
use super::pool::ConnectionPool;

/// The protocol-specific codec driving one exchange.
pub(crate) enum ExchangeCodec {
    Http1(Arc<Http1Codec>),
    Http2(Http2ExchangeCodec),
}

/// Frames an outbound request body for either protocol.
pub(crate) enum RequestBodySink {
    Http1(Http1BodySink),
    Http2(FramingSink),
}

impl RequestBodySink {
    pub(crate) fn close(&mut self) -> io::Result<()> {
        match self {
            RequestBodySink::Http1(sink) => sink.close(),
            RequestBodySink::Http2(sink) => sink.close(),
        }
    }
}

impl Write for RequestBodySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RequestBodySink::Http1(sink) => sink.write(buf),
            RequestBodySink::Http2(sink) => sink.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RequestBodySink::Http1(sink) => sink.flush(),
            RequestBodySink::Http2(sink) => sink.flush(),
        }
    }
}

/// Carries one exchange over an acquired connection, tracking failures
/// so the connection's future is decided correctly.
pub(crate) struct Exchange {
    connection: Arc<Connection>,
    codec: ExchangeCodec,
    call: Arc<CallMarker>,
    pool: ConnectionPool,
    listener: EventListenerRef,
    /// Set once any request bytes hit the wire; gates retry decisions.
    request_sent: AtomicBool,
    released: AtomicBool,
}

impl Exchange {
    pub(crate) fn new(
        connection: Arc<Connection>,
        call: Arc<CallMarker>,
        pool: ConnectionPool,
        listener: EventListenerRef,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> crate::Result<Exchange> {
        let codec = match connection.carrier() {
            Carrier::Http1(codec) => {
                connection
                    .set_socket_timeouts(read_timeout, write_timeout)
                    .map_err(Error::new_io)?;
                ExchangeCodec::Http1(codec.clone())
            }
            Carrier::Http2(conn) => ExchangeCodec::Http2(Http2ExchangeCodec::new(
                conn.clone(),
                read_timeout,
                write_timeout,
            )),
        };
        Ok(Exchange {
            connection,
            codec,
            call,
            pool,
            listener,
            request_sent: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn write_request_headers(&self, request: &Request) -> crate::Result<()> {
        self.request_sent.store(true, Ordering::SeqCst);
        let result = match &self.codec {
            ExchangeCodec::Http1(codec) => {
                let request_line = self.request_line(request);
                codec.write_request_headers(request, &request_line)
            }
            ExchangeCodec::Http2(codec) => {
                codec.write_request_headers(request, request.body().is_some())
            }
        };
        if let Err(ref e) = result {
            self.track_failure(e);
        } else {
            self.listener.request_headers_end(&request.url().to_string());
        }
        result
    }

    /// The HTTP/1 request target: origin-form normally, absolute-form
    /// when traversing an HTTP proxy without a tunnel.
    fn request_line(&self, request: &Request) -> String {
        let url = request.url();
        let absolute_form = matches!(self.connection.route().proxy(), Proxy::Http { .. })
            && !url.is_https();
        if absolute_form {
            // Absolute-form, credentials omitted.
            format!(
                "{} {}://{}{} HTTP/1.1\r\n",
                request.method(),
                url.scheme(),
                url.host_header(),
                url.encoded_path_and_query()
            )
        } else {
            format!(
                "{} {} HTTP/1.1\r\n",
                request.method(),
                url.encoded_path_and_query()
            )
        }
    }

    pub(crate) fn create_request_body(
        &self,
        content_length: Option<u64>,
    ) -> crate::Result<RequestBodySink> {
        let result = match &self.codec {
            ExchangeCodec::Http1(codec) => codec
                .create_request_body(content_length)
                .map(RequestBodySink::Http1),
            ExchangeCodec::Http2(codec) => {
                codec.create_request_body().map(RequestBodySink::Http2)
            }
        };
        if let Err(ref e) = result {
            self.track_failure(e);
        }
        result
    }

    pub(crate) fn flush_request(&self) -> crate::Result<()> {
        match &self.codec {
            ExchangeCodec::Http1(codec) => codec.flush_request(),
            ExchangeCodec::Http2(codec) => codec.flush_request(),
        }
    }

    pub(crate) fn finish_request(&self) -> crate::Result<()> {
        let result = match &self.codec {
            ExchangeCodec::Http1(codec) => codec.finish_request(),
            ExchangeCodec::Http2(codec) => codec.finish_request(),
        };
        if let Err(ref e) = result {
            self.track_failure(e);
        }
        result
    }

    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> crate::Result<Option<ResponseHead>> {
        let result = match &self.codec {
            ExchangeCodec::Http1(codec) => codec.read_response_headers(expect_continue),
            ExchangeCodec::Http2(codec) => codec.read_response_headers(expect_continue),
        };
        match &result {
            Ok(Some(head)) => self.listener.response_headers_end(head.code),
            Ok(None) => {}
            Err(e) => self.track_failure(e),
        }
        result
    }

    pub(crate) fn open_response_body(
        &self,
        head: &ResponseHead,
        method: &Method,
    ) -> crate::Result<(Option<u64>, Box<dyn BodySource>)> {
        let result = match &self.codec {
            ExchangeCodec::Http1(codec) => codec
                .open_response_body(head, *method == Method::HEAD)
                .map(|info| (info.content_length, info.source)),
            ExchangeCodec::Http2(codec) => codec.open_response_body(head),
        };
        if let Err(ref e) = result {
            self.track_failure(e);
        }
        result
    }

    pub(crate) fn trailers(&self) -> crate::Result<crate::headers::Headers> {
        match &self.codec {
            ExchangeCodec::Http1(codec) => codec.trailers(),
            ExchangeCodec::Http2(codec) => codec.trailers(),
        }
    }

    /// Whether this exchange's failure may be retried on a different
    /// route or connection.
    pub(crate) fn is_recoverable(&self, error: &Error) -> bool {
        if error.is_stream_reset() {
            return Http2ExchangeCodec::is_retryable_error(error);
        }
        !error.is_protocol() && !error.is_tls() && !error.is_canceled()
    }

    /// Notes a mid-exchange failure on the carrying connection.
    pub(crate) fn track_failure(&self, error: &Error) {
        self.connection.track_failure(error);
        if error.is_io() || error.is_incomplete_message() {
            // A transport wobble on a multiplexed connection warrants a
            // liveness probe before new streams board it.
            if let Carrier::Http2(conn) = self.connection.carrier() {
                conn.send_degraded_ping();
            }
        }
    }

    /// Completes the exchange, releasing the connection reservation.
    pub(crate) fn release(&self, success: bool, now_nanos: u64) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if success {
            self.connection.note_success();
        }
        self.connection.release(&self.call, now_nanos);
        self.listener.connection_released(self.connection.id());
        self.pool.connection_became_idle(&self.connection);
    }

    pub(crate) fn cancel(&self) {
        match &self.codec {
            ExchangeCodec::Http1(codec) => codec.cancel(),
            ExchangeCodec::Http2(codec) => codec.cancel(),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("connection", &self.connection.id())
            .finish()
    }
}
