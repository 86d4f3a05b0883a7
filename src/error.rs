//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have courier `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP calls.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// Earlier failures folded into this one, e.g. every exhausted route.
    suppressed: Vec<Error>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// The call was canceled, or a timeout covering it expired.
    Canceled,
    /// The peer violated the protocol; fatal for the carrying connection.
    Protocol,
    /// An HTTP/2 stream was reset; other streams on the connection continue.
    StreamReset(crate::proto::h2::ErrorCode),
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// TLS handshake failure; not recoverable on the same route.
    Tls,
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// Error while reading a body from a connection.
    Body,
    /// Error while writing a body to a connection.
    BodyWrite,
    /// Too many follow-up requests (redirects and auth retries).
    TooManyFollowUps,
    /// The URL could not be parsed or is not an http/https URL.
    Url,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    TooLarge,
    Status,
}

#[derive(Debug)]
pub(crate) enum User {
    /// Configuration rejected at client construction.
    Config,
    /// A duplex request body was used over HTTP/1.
    DuplexNotSupported,
    /// The call was executed twice.
    AlreadyExecuted,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user configuration or misuse.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the peer violated the wire protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol | Kind::Parse(_))
    }

    /// Returns true if an HTTP/2 stream was reset by the peer.
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(_))
    }

    /// Returns true if this was an I/O error on the transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this was an error from connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the TLS handshake failed.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        if self.find_source::<TimedOut>().is_some() {
            return true;
        }
        self.find_source::<io::Error>()
            .map(|io| {
                matches!(
                    io.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                )
            })
            .unwrap_or(false)
    }

    /// Errors that were attached as suppressed failures, such as the other
    /// routes attempted before the call gave up.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_suppressed(mut self, other: Error) -> Error {
        self.inner.suppressed.push(other);
        self
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    pub(crate) fn h2_error_code(&self) -> crate::proto::h2::ErrorCode {
        match self.inner.kind {
            Kind::StreamReset(code) => code,
            _ => crate::proto::h2::ErrorCode::InternalError,
        }
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Canceled).with(TimedOut)
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_stream_reset(code: crate::proto::h2::ErrorCode) -> Error {
        Error::new(Kind::StreamReset(code))
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_tls<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_body<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_body_write<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_too_many_follow_ups(count: u32) -> Error {
        Error::new(Kind::TooManyFollowUps).with(format!("{} follow-ups", count))
    }

    pub(crate) fn new_url<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Url).with(cause)
    }

    pub(crate) fn new_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::User(User::Config)).with(cause)
    }

    pub(crate) fn new_duplex_not_supported() -> Error {
        Error::new(Kind::User(User::DuplexNotSupported))
    }

    pub(crate) fn new_already_executed() -> Error {
        Error::new(Kind::User(User::AlreadyExecuted))
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Canceled => "canceled",
            Kind::Protocol => "protocol error",
            Kind::StreamReset(_) => "http2 stream reset",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::Tls => "TLS handshake failed",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Body => "error reading a body from connection",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::TooManyFollowUps => "too many follow-up requests",
            Kind::Url => "unexpected url",
            Kind::User(User::Config) => "invalid client configuration",
            Kind::User(User::DuplexNotSupported) => "duplex request bodies require HTTP/2",
            Kind::User(User::AlreadyExecuted) => "call already executed",
        }
    }

    /// Translates this error to the `io::Error` surfaced by body readers.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self.inner.kind {
            Kind::Canceled => io::ErrorKind::Interrupted,
            Kind::IncompleteMessage => io::ErrorKind::UnexpectedEof,
            Kind::Parse(_) | Kind::Protocol => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("courier::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::new(Kind::IncompleteMessage).with(err)
        } else {
            Error::new_io(err)
        }
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::status::InvalidStatusCode> for Parse {
    fn from(_: http::status::InvalidStatusCode) -> Parse {
        Parse::Status
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

// ===== impl TimedOut ====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
