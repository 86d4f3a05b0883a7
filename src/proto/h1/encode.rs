//! Encoders for outbound HTTP/1 request bodies.

use std::io::{self, Write};

/// Frames request body bytes onto the connection's sink.
#[derive(Debug)]
pub(crate) enum Encoder {
    /// `Content-Length` framing: exactly `remaining` more bytes.
    KnownLength { remaining: u64 },
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
}

impl Encoder {
    pub(crate) fn write(&mut self, sink: &mut dyn Write, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self {
            Encoder::KnownLength { remaining } => {
                if (buf.len() as u64) > *remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "body exceeds Content-Length",
                    ));
                }
                sink.write_all(buf)?;
                *remaining -= buf.len() as u64;
                Ok(buf.len())
            }
            Encoder::Chunked => {
                write!(sink, "{:X}\r\n", buf.len())?;
                sink.write_all(buf)?;
                sink.write_all(b"\r\n")?;
                Ok(buf.len())
            }
        }
    }

    /// Terminates the body framing. Fails if a known length was not met.
    pub(crate) fn finish(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        match self {
            Encoder::KnownLength { remaining } => {
                if *remaining != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "body shorter than Content-Length",
                    ));
                }
                Ok(())
            }
            Encoder::Chunked => sink.write_all(b"0\r\n\r\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Encoder;

    #[test]
    fn known_length_passthrough() {
        let mut sink = Vec::new();
        let mut encoder = Encoder::KnownLength { remaining: 8 };
        encoder.write(&mut sink, b"hello ").unwrap();
        encoder.write(&mut sink, b"hi").unwrap();
        encoder.finish(&mut sink).unwrap();
        assert_eq!(sink, b"hello hi");
    }

    #[test]
    fn known_length_over_and_under() {
        let mut sink = Vec::new();
        let mut encoder = Encoder::KnownLength { remaining: 2 };
        assert!(encoder.write(&mut sink, b"abc").is_err());
        let mut encoder = Encoder::KnownLength { remaining: 2 };
        encoder.write(&mut sink, b"a").unwrap();
        assert!(encoder.finish(&mut sink).is_err());
    }

    #[test]
    fn chunked_framing() {
        let mut sink = Vec::new();
        let mut encoder = Encoder::Chunked;
        encoder.write(&mut sink, b"hello").unwrap();
        encoder.write(&mut sink, b" world!").unwrap();
        encoder.finish(&mut sink).unwrap();
        assert_eq!(sink, b"5\r\nhello\r\n7\r\n world!\r\n0\r\n\r\n");
    }
}
