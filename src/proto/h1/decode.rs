//! Decoders for the different HTTP/1 body framings.

use std::cmp;
use std::io::{self, BufRead};

use log::trace;

use crate::headers::Headers;

use self::Kind::{Chunked, Empty, Eof, Length};

/// Decodes one response body off the connection's buffered source.
///
/// A decoder is exhausted when [`Decoder::is_done`] reports true; only a
/// chunked decoder can then surface trailers.
#[derive(Debug)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// Reads exactly `remaining` more bytes.
    Length { remaining: u64 },
    /// Reads `Transfer-Encoding: chunked` framing.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        trailers: Option<Headers>,
    },
    /// Reads until the transport is exhausted; the connection cannot be
    /// reused afterwards.
    Eof { seen_eof: bool },
    /// No body at all (HEAD, 204, 304).
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ChunkedState {
    Size,
    Body,
    BodyCrLf,
    Trailers,
    End,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Length { remaining: len },
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Chunked {
                state: ChunkedState::Size,
                chunk_len: 0,
                trailers: None,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Eof { seen_eof: false },
        }
    }

    pub(crate) fn empty() -> Decoder {
        Decoder { kind: Empty }
    }

    pub(crate) fn is_done(&self) -> bool {
        match self.kind {
            Length { remaining } => remaining == 0,
            Chunked { state, .. } => state == ChunkedState::End,
            Eof { seen_eof } => seen_eof,
            Empty => true,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Chunked { .. })
    }

    /// True only for EOF-delimited bodies, which poison their carrier.
    pub(crate) fn closes_connection(&self) -> bool {
        matches!(self.kind, Eof { .. })
    }

    /// Trailers read after the final chunk. Empty until [`Decoder::is_done`].
    pub(crate) fn take_trailers(&mut self) -> Headers {
        match self.kind {
            Chunked { ref mut trailers, .. } => trailers.take().unwrap_or_default(),
            _ => Headers::new(),
        }
    }

    pub(crate) fn read(&mut self, source: &mut dyn BufRead, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.kind {
            Length { ref mut remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = cmp::min(buf.len() as u64, *remaining) as usize;
                let n = source.read(&mut buf[..want])?;
                if n == 0 {
                    // The peer hung up before satisfying Content-Length.
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of stream",
                    ));
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut trailers,
            } => loop {
                match *state {
                    ChunkedState::Size => {
                        *chunk_len = read_chunk_size(source)?;
                        trace!("chunk size={}", chunk_len);
                        if *chunk_len == 0 {
                            *state = ChunkedState::Trailers;
                        } else {
                            *state = ChunkedState::Body;
                        }
                    }
                    ChunkedState::Body => {
                        let want = cmp::min(buf.len() as u64, *chunk_len) as usize;
                        let n = source.read(&mut buf[..want])?;
                        if n == 0 {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "unexpected end of stream mid-chunk",
                            ));
                        }
                        *chunk_len -= n as u64;
                        if *chunk_len == 0 {
                            *state = ChunkedState::BodyCrLf;
                        }
                        return Ok(n);
                    }
                    ChunkedState::BodyCrLf => {
                        expect_crlf(source)?;
                        *state = ChunkedState::Size;
                    }
                    ChunkedState::Trailers => {
                        let block = crate::proto::h1::parse::read_trailers(source)
                            .map_err(|e| e.into_io())?;
                        if !block.is_empty() {
                            trace!("read {} trailers", block.len());
                        }
                        *trailers = Some(block);
                        *state = ChunkedState::End;
                    }
                    ChunkedState::End => return Ok(0),
                }
            },
            Eof { ref mut seen_eof } => {
                if *seen_eof {
                    return Ok(0);
                }
                let n = source.read(buf)?;
                if n == 0 {
                    *seen_eof = true;
                }
                Ok(n)
            }
            Empty => Ok(0),
        }
    }
}

/// Chunk sizes are 1*HEXDIG with optional extensions, ending in CRLF.
fn read_chunk_size(source: &mut dyn BufRead) -> io::Result<u64> {
    fn invalid(msg: &'static str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }

    let mut size: u64 = 0;
    let mut digits = 0usize;
    let mut in_extension = false;
    let mut extension_bytes = 0usize;
    loop {
        let b = read_byte(source)?;
        if in_extension {
            match b {
                b'\r' => {
                    if read_byte(source)? != b'\n' {
                        return Err(invalid("invalid chunk size line: expected LF"));
                    }
                    break;
                }
                b'\n' => break,
                _ => {
                    extension_bytes += 1;
                    if extension_bytes > 16 * 1024 {
                        return Err(invalid("chunk extensions too large"));
                    }
                }
            }
            continue;
        }
        match b {
            b @ b'0'..=b'9' => {
                size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add((b - b'0') as u64))
                    .ok_or_else(|| invalid("invalid chunk size: overflow"))?;
                digits += 1;
            }
            b @ b'a'..=b'f' => {
                size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add((b + 10 - b'a') as u64))
                    .ok_or_else(|| invalid("invalid chunk size: overflow"))?;
                digits += 1;
            }
            b @ b'A'..=b'F' => {
                size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add((b + 10 - b'A') as u64))
                    .ok_or_else(|| invalid("invalid chunk size: overflow"))?;
                digits += 1;
            }
            b';' | b' ' | b'\t' => in_extension = true,
            b'\r' => {
                if read_byte(source)? != b'\n' {
                    return Err(invalid("invalid chunk size line: expected LF"));
                }
                break;
            }
            b'\n' => break,
            _ => return Err(invalid("invalid chunk size line")),
        }
    }
    if digits == 0 {
        return Err(invalid("invalid chunk size line: missing size digit"));
    }
    Ok(size)
}

fn expect_crlf(source: &mut dyn BufRead) -> io::Result<()> {
    let b = read_byte(source)?;
    if b == b'\r' {
        if read_byte(source)? == b'\n' {
            return Ok(());
        }
    } else if b == b'\n' {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "expected CRLF after chunk",
    ))
}

fn read_byte(source: &mut dyn BufRead) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    match source.read(&mut byte)? {
        0 => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "unexpected EOF during chunked framing",
        )),
        _ => Ok(byte[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn drain(decoder: &mut Decoder, input: &[u8]) -> io::Result<(Vec<u8>, Headers)> {
        let mut source = BufReader::new(input);
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // odd size to cross chunk boundaries
        loop {
            let n = decoder.read(&mut source, &mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok((out, decoder.take_trailers()))
    }

    #[test]
    fn length_reads_exactly() {
        let mut decoder = Decoder::length(5);
        let (out, _) = drain(&mut decoder, b"helloEXTRA").unwrap();
        assert_eq!(out, b"hello");
        assert!(decoder.is_done());
    }

    #[test]
    fn length_eof_early_is_error() {
        let mut decoder = Decoder::length(10);
        let err = drain(&mut decoder, b"short").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn chunked_basic() {
        let mut decoder = Decoder::chunked();
        let (out, trailers) = drain(&mut decoder, b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert!(trailers.is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn chunked_multiple_chunks() {
        let mut decoder = Decoder::chunked();
        let (out, _) = drain(&mut decoder, b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"wikipedia");
    }

    #[test]
    fn chunked_with_extensions() {
        let mut decoder = Decoder::chunked();
        let (out, _) = drain(&mut decoder, b"5;ext=1\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn chunked_with_trailers() {
        let mut decoder = Decoder::chunked();
        let (out, trailers) =
            drain(&mut decoder, b"5\r\nhello\r\n0\r\nX-Sum: 5\r\nX-B: 2\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(trailers.get("X-Sum"), Some("5"));
        assert_eq!(trailers.len(), 2);
    }

    #[test]
    fn chunked_uppercase_hex() {
        let mut decoder = Decoder::chunked();
        let (out, _) = drain(&mut decoder, b"A\r\n0123456789\r\n0\r\n\r\n").unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn chunked_missing_digit_rejected() {
        let mut decoder = Decoder::chunked();
        let err = drain(&mut decoder, b"\r\nhello").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn chunked_overflow_rejected() {
        let mut decoder = Decoder::chunked();
        let err = drain(&mut decoder, b"FFFFFFFFFFFFFFFFF\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_reads_everything() {
        let mut decoder = Decoder::eof();
        let (out, _) = drain(&mut decoder, b"anything goes").unwrap();
        assert_eq!(out, b"anything goes");
        assert!(decoder.is_done());
        assert!(decoder.closes_connection());
    }

    #[test]
    fn empty_is_immediately_done() {
        let mut decoder = Decoder::empty();
        assert!(decoder.is_done());
        let (out, _) = drain(&mut decoder, b"ignored").unwrap();
        assert!(out.is_empty());
    }
}
