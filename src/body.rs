//! Request and response bodies.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::headers::Headers;

/// Produces the bytes of an outbound request body.
pub trait RequestBody: Send {
    /// The `Content-Type` to send, if any.
    fn content_type(&self) -> Option<String> {
        None
    }

    /// The exact byte count, or `None` to use chunked transfer encoding.
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// A duplex body's writes may interleave with reads of the response.
    /// Requires HTTP/2.
    fn is_duplex(&self) -> bool {
        false
    }

    /// A one-shot body can be transmitted exactly once, so its call can
    /// not be retried or redirected with the body intact.
    fn is_one_shot(&self) -> bool {
        false
    }

    /// Writes the body to `sink`. Replayable bodies may be asked to do
    /// this more than once.
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()>;
}

/// A shareable handle to a request body, reused across follow-ups.
#[derive(Clone)]
pub struct Body {
    inner: Arc<Mutex<dyn RequestBody>>,
}

impl Body {
    pub fn new<B: RequestBody + 'static>(body: B) -> Body {
        Body {
            inner: Arc::new(Mutex::new(body)),
        }
    }

    /// A replayable body backed by a byte buffer.
    pub fn bytes(content_type: Option<&str>, content: impl Into<Bytes>) -> Body {
        Body::new(BytesBody {
            content_type: content_type.map(|s| s.to_string()),
            content: content.into(),
        })
    }

    /// A one-shot body streaming from a reader that cannot be rewound.
    pub fn one_shot<R: Read + Send + 'static>(content_type: Option<&str>, reader: R) -> Body {
        Body::new(OneShotBody {
            content_type: content_type.map(|s| s.to_string()),
            reader: Some(reader),
        })
    }

    pub fn content_type(&self) -> Option<String> {
        self.inner.lock().unwrap().content_type()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.lock().unwrap().content_length()
    }

    pub fn is_duplex(&self) -> bool {
        self.inner.lock().unwrap().is_duplex()
    }

    pub fn is_one_shot(&self) -> bool {
        self.inner.lock().unwrap().is_one_shot()
    }

    pub fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        self.inner.lock().unwrap().write_to(sink)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("content_length", &self.content_length())
            .field("one_shot", &self.is_one_shot())
            .finish()
    }
}

struct BytesBody {
    content_type: Option<String>,
    content: Bytes,
}

impl RequestBody for BytesBody {
    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.content.len() as u64)
    }

    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self.content)
    }
}

struct OneShotBody<R> {
    content_type: Option<String>,
    reader: Option<R>,
}

impl<R: Read + Send> RequestBody for OneShotBody<R> {
    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }

    fn is_one_shot(&self) -> bool {
        true
    }

    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        let mut reader = self.reader.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "one-shot body already transmitted")
        })?;
        io::copy(&mut reader, sink)?;
        Ok(())
    }
}

/// A streaming source for an inbound response body. Trailers become
/// readable only after the source reports EOF.
pub(crate) trait BodySource: Read + Send {
    fn trailers(&mut self) -> crate::Result<Headers> {
        Ok(Headers::new())
    }
}

impl BodySource for io::Cursor<Bytes> {}

/// An inbound response body: a content type, an expected length, and a
/// one-owner streaming source.
pub struct ResponseBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    source: Box<dyn BodySource>,
}

impl ResponseBody {
    pub(crate) fn new(
        content_type: Option<String>,
        content_length: Option<u64>,
        source: Box<dyn BodySource>,
    ) -> ResponseBody {
        ResponseBody {
            content_type,
            content_length,
            source,
        }
    }

    pub(crate) fn empty() -> ResponseBody {
        ResponseBody::from_bytes(None, Bytes::new())
    }

    pub(crate) fn from_bytes(content_type: Option<String>, content: Bytes) -> ResponseBody {
        let content_length = Some(content.len() as u64);
        ResponseBody {
            content_type,
            content_length,
            source: Box::new(io::Cursor::new(content)),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The expected byte count, or `None` when the length is unknown.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Reads the remaining body into memory.
    pub fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = Vec::new();
        self.source
            .read_to_end(&mut buf)
            .map_err(crate::Error::new_body)?;
        Ok(Bytes::from(buf))
    }

    /// Reads the remaining body as UTF-8 text, replacing invalid bytes.
    pub fn string(self) -> crate::Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Trailing headers. Valid only after the body has been fully read.
    pub fn trailers(&mut self) -> crate::Result<Headers> {
        self.source.trailers()
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_body_replayable() {
        let body = Body::bytes(Some("text/plain"), "hello");
        let mut first = Vec::new();
        let mut second = Vec::new();
        body.write_to(&mut first).unwrap();
        body.write_to(&mut second).unwrap();
        assert_eq!(first, b"hello");
        assert_eq!(second, b"hello");
        assert_eq!(body.content_length(), Some(5));
        assert!(!body.is_one_shot());
    }

    #[test]
    fn one_shot_body_refuses_replay() {
        let body = Body::one_shot(None, io::Cursor::new(b"once".to_vec()));
        let mut out = Vec::new();
        body.write_to(&mut out).unwrap();
        assert_eq!(out, b"once");
        assert!(body.write_to(&mut out).is_err());
        assert!(body.is_one_shot());
    }

    #[test]
    fn response_body_reads() {
        let body = ResponseBody::from_bytes(Some("text/plain".into()), Bytes::from("abc"));
        assert_eq!(body.content_length(), Some(3));
        assert_eq!(body.string().unwrap(), "abc");
    }
}
