//! HTTP/1 message head parsing.

use std::io::BufRead;

use crate::error::{Error, Parse};
use crate::headers::Headers;
use crate::protocol::Protocol;
use crate::proto::ResponseHead;

/// Refuse to buffer message heads bigger than this.
const MAX_HEAD_SIZE: usize = 256 * 1024;

const MAX_HEADERS: usize = 100;

/// Reads one response head off `source`: status line, header lines, and
/// the terminating blank line.
pub(crate) fn read_response_head(source: &mut dyn BufRead) -> crate::Result<ResponseHead> {
    let raw = read_head_bytes(source)?;

    let mut header_slots = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_slots);
    match parsed.parse(&raw).map_err(Parse::from)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::new_incomplete()),
    }

    let protocol = match parsed.version {
        Some(0) | Some(1) => Protocol::Http11,
        _ => return Err(Error::from(Parse::Version)),
    };
    let code = parsed.code.ok_or(Error::from(Parse::Status))?;
    if code < 100 {
        return Err(Error::from(Parse::Status));
    }
    let message = parsed.reason.unwrap_or("").to_string();

    let mut headers = Headers::lenient_builder();
    for header in parsed.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::from(Parse::Header))?;
        headers
            .add_line(&format!("{}: {}", header.name, value))
            .map_err(|_| Error::from(Parse::Header))?;
    }

    Ok(ResponseHead {
        protocol,
        code,
        message,
        headers: headers.build(),
    })
}

/// Reads raw bytes up to and including the `\r\n\r\n` terminator.
fn read_head_bytes(source: &mut dyn BufRead) -> crate::Result<Vec<u8>> {
    let mut raw = Vec::new();
    loop {
        let before = raw.len();
        let n = source
            .read_until(b'\n', &mut raw)
            .map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_incomplete());
        }
        if raw.len() > MAX_HEAD_SIZE {
            return Err(Error::from(Parse::TooLarge));
        }
        // A bare `\r\n` (or `\n`) line ends the head.
        let line = &raw[before..];
        if line == b"\r\n" || line == b"\n" {
            // The status line alone is not a message.
            if before == 0 {
                return Err(Error::from(Parse::Status));
            }
            return Ok(raw);
        }
    }
}

/// Reads a trailer block: header lines up to a blank line.
pub(crate) fn read_trailers(source: &mut dyn BufRead) -> crate::Result<Headers> {
    let mut headers = Headers::lenient_builder();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = source.read_until(b'\n', &mut line).map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_incomplete());
        }
        if line == b"\r\n" || line == b"\n" {
            return Ok(headers.build());
        }
        if line.len() > MAX_HEAD_SIZE {
            return Err(Error::from(Parse::TooLarge));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| Error::from(Parse::Header))?
            .trim_end_matches(['\r', '\n']);
        headers.add_line(text)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Read};

    #[test]
    fn parse_ok_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: 1\r\n\r\nhello";
        let mut source = BufReader::new(&raw[..]);
        let head = read_response_head(&mut source).unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.message, "OK");
        assert_eq!(head.headers.get("content-length"), Some("5"));
        assert_eq!(head.headers.len(), 2);

        // The body remains unread.
        let mut rest = Vec::new();
        source.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"hello");
    }

    #[test]
    fn parse_empty_reason() {
        let raw = b"HTTP/1.1 503 \r\n\r\n";
        let mut source = BufReader::new(&raw[..]);
        let head = read_response_head(&mut source).unwrap();
        assert_eq!(head.code, 503);
        assert_eq!(head.message, "");
    }

    #[test]
    fn truncated_head_is_incomplete() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-";
        let mut source = BufReader::new(&raw[..]);
        assert!(read_response_head(&mut source)
            .unwrap_err()
            .is_incomplete_message());
    }

    #[test]
    fn garbage_status_line_rejected() {
        let raw = b"ICY 200 OK\r\n\r\n";
        let mut source = BufReader::new(&raw[..]);
        assert!(read_response_head(&mut source).unwrap_err().is_parse());
    }

    #[test]
    fn trailers_parse() {
        let raw = b"X-Sum: 5\r\nX-Other: y\r\n\r\n";
        let mut source = BufReader::new(&raw[..]);
        let trailers = read_trailers(&mut source).unwrap();
        assert_eq!(trailers.get("X-Sum"), Some("5"));
        assert_eq!(trailers.len(), 2);
    }
}
