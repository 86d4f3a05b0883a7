//! `permessage-deflate` negotiation and codecs (RFC 7692).

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// The flush marker every DEFLATE block ends with; stripped before
/// transmission and restored before inflating.
const EMPTY_DEFLATE_BLOCK: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The extension parameters a server agreed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WebSocketExtensions {
    pub(crate) permessage_deflate: bool,
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) server_max_window_bits: Option<u8>,
    /// The server offered something we do not understand; compression
    /// must stay off.
    pub(crate) unknown_values: bool,
}

impl WebSocketExtensions {
    /// Parses every `Sec-WebSocket-Extensions` value of a handshake
    /// response.
    pub(crate) fn parse(headers: &crate::headers::Headers) -> WebSocketExtensions {
        let mut extensions = WebSocketExtensions::default();
        for header in headers.values("Sec-WebSocket-Extensions") {
            for extension in header.split(',') {
                let mut parameters = extension.split(';');
                let name = parameters.next().unwrap_or("").trim();
                if !name.eq_ignore_ascii_case("permessage-deflate") {
                    extensions.unknown_values = true;
                    continue;
                }
                extensions.permessage_deflate = true;
                for parameter in parameters {
                    let mut kv = parameter.splitn(2, '=');
                    let key = kv.next().unwrap_or("").trim().to_ascii_lowercase();
                    let value = kv.next().map(|v| v.trim().trim_matches('"'));
                    match key.as_str() {
                        "client_no_context_takeover" => {
                            extensions.client_no_context_takeover = true
                        }
                        "server_no_context_takeover" => {
                            extensions.server_no_context_takeover = true
                        }
                        "client_max_window_bits" => {
                            extensions.client_max_window_bits =
                                value.and_then(|v| v.parse::<u8>().ok());
                            if extensions.client_max_window_bits.is_none() {
                                extensions.unknown_values = true;
                            }
                        }
                        "server_max_window_bits" => {
                            extensions.server_max_window_bits =
                                value.and_then(|v| v.parse::<u8>().ok());
                            if extensions.server_max_window_bits.is_none() {
                                extensions.unknown_values = true;
                            }
                        }
                        _ => extensions.unknown_values = true,
                    }
                }
            }
        }
        extensions
    }

    /// Whether compression may actually be used.
    pub(crate) fn compression_enabled(&self) -> bool {
        self.permessage_deflate && !self.unknown_values
    }
}

/// Compresses outbound messages. The compression context carries over
/// between messages unless `no_context_takeover` was negotiated.
pub(crate) struct MessageDeflater {
    no_context_takeover: bool,
    encoder: DeflateEncoder<Vec<u8>>,
}

impl MessageDeflater {
    pub(crate) fn new(no_context_takeover: bool) -> MessageDeflater {
        MessageDeflater {
            no_context_takeover,
            encoder: DeflateEncoder::new(Vec::new(), Compression::default()),
        }
    }

    pub(crate) fn deflate(&mut self, message: &[u8]) -> io::Result<Vec<u8>> {
        if self.no_context_takeover {
            self.encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        }
        self.encoder.write_all(message)?;
        self.encoder.flush()?;
        let buffer = self.encoder.get_mut();
        let mut deflated = std::mem::take(buffer);
        // The sync flush always terminates with an empty block.
        if deflated.ends_with(&EMPTY_DEFLATE_BLOCK) {
            deflated.truncate(deflated.len() - EMPTY_DEFLATE_BLOCK.len());
        } else {
            // Terminate with our own empty block minus the marker.
            deflated.push(0x00);
        }
        Ok(deflated)
    }
}

/// Decompresses inbound messages, restoring the stripped flush marker.
pub(crate) struct MessageInflater {
    no_context_takeover: bool,
    decoder: DeflateDecoder<SliceFeeder>,
}

/// A reader the inflater refills per message.
struct SliceFeeder {
    buffer: Vec<u8>,
    position: usize,
}

impl Read for SliceFeeder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.buffer[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

impl MessageInflater {
    pub(crate) fn new(no_context_takeover: bool) -> MessageInflater {
        MessageInflater {
            no_context_takeover,
            decoder: DeflateDecoder::new(SliceFeeder {
                buffer: Vec::new(),
                position: 0,
            }),
        }
    }

    pub(crate) fn inflate(&mut self, compressed: &[u8]) -> io::Result<Vec<u8>> {
        if self.no_context_takeover {
            self.decoder = DeflateDecoder::new(SliceFeeder {
                buffer: Vec::new(),
                position: 0,
            });
        }
        {
            let feeder = self.decoder.get_mut();
            feeder.buffer.clear();
            feeder.buffer.extend_from_slice(compressed);
            feeder.buffer.extend_from_slice(&EMPTY_DEFLATE_BLOCK);
            feeder.position = 0;
        }
        let mut message = Vec::new();
        // Drain everything this message produces; the stream stays open
        // for the next message when context carries over.
        loop {
            let before = message.len();
            message.resize(before + 4096, 0);
            match self.decoder.read(&mut message[before..]) {
                Ok(0) => {
                    message.truncate(before);
                    break;
                }
                Ok(n) => message.truncate(before + n),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    message.truncate(before);
                    break;
                }
                Err(e) => {
                    message.truncate(before);
                    return Err(e);
                }
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;

    #[test]
    fn parse_negotiated_parameters() {
        let headers = Headers::of(&[
            "Sec-WebSocket-Extensions",
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=12",
        ]);
        let ext = WebSocketExtensions::parse(&headers);
        assert!(ext.permessage_deflate);
        assert!(ext.client_no_context_takeover);
        assert!(!ext.server_no_context_takeover);
        assert_eq!(ext.server_max_window_bits, Some(12));
        assert!(ext.compression_enabled());
    }

    #[test]
    fn unknown_extension_disables_compression() {
        let headers = Headers::of(&[
            "Sec-WebSocket-Extensions",
            "permessage-deflate; weird_param=1",
        ]);
        let ext = WebSocketExtensions::parse(&headers);
        assert!(ext.permessage_deflate);
        assert!(!ext.compression_enabled());
    }

    #[test]
    fn deflate_inflate_round_trip_with_context() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        for message in ["hello deflate", "hello deflate", "another message"] {
            let compressed = deflater.deflate(message.as_bytes()).unwrap();
            assert!(!compressed.ends_with(&EMPTY_DEFLATE_BLOCK));
            let restored = inflater.inflate(&compressed).unwrap();
            assert_eq!(restored, message.as_bytes());
        }
    }

    #[test]
    fn deflate_inflate_round_trip_without_context() {
        let mut deflater = MessageDeflater::new(true);
        let mut inflater = MessageInflater::new(true);
        for message in [&b"abc"[..], &[0u8; 4000][..], b"end"] {
            let compressed = deflater.deflate(message).unwrap();
            let restored = inflater.inflate(&compressed).unwrap();
            assert_eq!(restored, message);
        }
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let mut deflater = MessageDeflater::new(false);
        let message = vec![b'a'; 8192];
        let compressed = deflater.deflate(&message).unwrap();
        assert!(compressed.len() < message.len() / 4);
    }
}
