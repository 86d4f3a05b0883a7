//! WebSocket framing (RFC 6455 section 5).
//!
//! The first byte carries FIN, three reserved bits, and the opcode; the
//! second carries the mask flag and a 7-bit length that escapes to 16-
//! or 64-bit extended forms. Client frames are masked with a random
//! 4-byte key; control frames are short and never fragmented.

use std::io::{self, Read, Write};

use bytes::Bytes;
use rand::RngCore;

use super::extensions::{MessageDeflater, MessageInflater};

pub(crate) const OPCODE_CONTINUATION: u8 = 0x0;
pub(crate) const OPCODE_TEXT: u8 = 0x1;
pub(crate) const OPCODE_BINARY: u8 = 0x2;
pub(crate) const OPCODE_CONTROL_CLOSE: u8 = 0x8;
pub(crate) const OPCODE_CONTROL_PING: u8 = 0x9;
pub(crate) const OPCODE_CONTROL_PONG: u8 = 0xa;

const FLAG_FIN: u8 = 0x80;
const FLAG_RSV1: u8 = 0x40;
const FLAG_RSV2: u8 = 0x20;
const FLAG_RSV3: u8 = 0x10;
const FLAG_MASK: u8 = 0x80;

pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;
pub(crate) const MAX_CLOSE_REASON: usize = 123;

/// Sent in a close frame when the peer gave no code.
pub(crate) const CLOSE_NO_STATUS_CODE: u16 = 1005;

const PAYLOAD_SHORT_MAX: u64 = 125;
const PAYLOAD_16BIT: u8 = 126;
const PAYLOAD_64BIT: u8 = 127;

fn protocol_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// What the reader delivers to the socket engine.
pub(crate) trait FrameCallback {
    fn on_read_message_text(&self, text: String) -> io::Result<()>;
    fn on_read_message_binary(&self, bytes: Bytes) -> io::Result<()>;
    fn on_read_ping(&self, payload: Bytes);
    fn on_read_pong(&self, payload: Bytes);
    fn on_read_close(&self, code: u16, reason: String);
}

/// Reads frames off the socket and assembles fragmented messages.
pub(crate) struct WebSocketReader<R> {
    source: R,
    /// Client readers require unmasked frames from the server.
    is_client: bool,
    inflater: Option<MessageInflater>,

    closed: bool,
    // Current frame.
    opcode: u8,
    frame_length: u64,
    is_final_frame: bool,
    is_control_frame: bool,
    compressed_message: bool,
}

impl<R: Read> WebSocketReader<R> {
    pub(crate) fn new(source: R, is_client: bool, inflater: Option<MessageInflater>) -> Self {
        WebSocketReader {
            source,
            is_client,
            inflater,
            closed: false,
            opcode: 0,
            frame_length: 0,
            is_final_frame: false,
            is_control_frame: false,
            compressed_message: false,
        }
    }

    /// Reads and dispatches one message (or control frame).
    pub(crate) fn process_next_frame(&mut self, callback: &dyn FrameCallback) -> io::Result<()> {
        self.read_header()?;
        if self.is_control_frame {
            self.read_control_frame(callback)
        } else {
            self.read_message_frame(callback)
        }
    }

    fn read_header(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(protocol_error("reader is closed".to_string()));
        }
        let b0 = self.read_byte()?;
        let b1 = self.read_byte()?;

        self.opcode = b0 & 0x0f;
        self.is_final_frame = b0 & FLAG_FIN != 0;
        self.is_control_frame = self.opcode & 0x08 != 0;

        let rsv1 = b0 & FLAG_RSV1 != 0;
        if b0 & (FLAG_RSV2 | FLAG_RSV3) != 0 {
            return Err(protocol_error(format!(
                "reserved flags are unsupported: {:#04x}",
                b0
            )));
        }
        if rsv1 {
            // RSV1 marks the first frame of a compressed message.
            if self.opcode == OPCODE_TEXT || self.opcode == OPCODE_BINARY {
                if self.inflater.is_none() {
                    return Err(protocol_error(
                        "unexpected rsv1 flag without compression".to_string(),
                    ));
                }
                self.compressed_message = true;
            } else {
                return Err(protocol_error("unexpected rsv1 flag".to_string()));
            }
        }

        let masked = b1 & FLAG_MASK != 0;
        if masked == self.is_client {
            // Clients receive unmasked; servers receive masked.
            return Err(protocol_error(if self.is_client {
                "server-sent frames must not be masked".to_string()
            } else {
                "client-sent frames must be masked".to_string()
            }));
        }

        self.frame_length = match b1 & 0x7f {
            PAYLOAD_16BIT => {
                let mut raw = [0u8; 2];
                self.source.read_exact(&mut raw)?;
                u16::from_be_bytes(raw) as u64
            }
            PAYLOAD_64BIT => {
                let mut raw = [0u8; 8];
                self.source.read_exact(&mut raw)?;
                let length = u64::from_be_bytes(raw);
                if length & (1 << 63) != 0 {
                    return Err(protocol_error(
                        "frame length exceeds the 63-bit bound".to_string(),
                    ));
                }
                length
            }
            short => short as u64,
        };

        if self.is_control_frame {
            if self.frame_length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(protocol_error(format!(
                    "control frame must be less than {} B",
                    MAX_CONTROL_PAYLOAD + 1
                )));
            }
            if !self.is_final_frame {
                return Err(protocol_error(
                    "control frames must be final".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn read_payload(&mut self) -> io::Result<Vec<u8>> {
        let mut payload = vec![0u8; self.frame_length as usize];
        self.source.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn read_control_frame(&mut self, callback: &dyn FrameCallback) -> io::Result<()> {
        let payload = self.read_payload()?;
        match self.opcode {
            OPCODE_CONTROL_PING => callback.on_read_ping(Bytes::from(payload)),
            OPCODE_CONTROL_PONG => callback.on_read_pong(Bytes::from(payload)),
            OPCODE_CONTROL_CLOSE => {
                let (code, reason) = match payload.len() {
                    0 => (CLOSE_NO_STATUS_CODE, String::new()),
                    1 => {
                        return Err(protocol_error(
                            "malformed close payload length of 1".to_string(),
                        ))
                    }
                    _ => {
                        let code = u16::from_be_bytes([payload[0], payload[1]]);
                        validate_close_code(code).map_err(protocol_error)?;
                        let reason = String::from_utf8(payload[2..].to_vec())
                            .map_err(|_| protocol_error("close reason is not UTF-8".to_string()))?;
                        (code, reason)
                    }
                };
                self.closed = true;
                callback.on_read_close(code, reason);
            }
            opcode => {
                return Err(protocol_error(format!(
                    "unknown control opcode: {:#03x}",
                    opcode
                )))
            }
        }
        Ok(())
    }

    fn read_message_frame(&mut self, callback: &dyn FrameCallback) -> io::Result<()> {
        let opcode = self.opcode;
        if opcode != OPCODE_TEXT && opcode != OPCODE_BINARY {
            return Err(protocol_error(format!("unknown opcode: {:#03x}", opcode)));
        }

        let mut message = self.read_payload()?;

        // Continuation frames extend the message until FIN; interleaved
        // control frames are dispatched as they arrive.
        while !self.is_final_frame {
            self.read_header()?;
            if self.is_control_frame {
                self.read_control_frame(callback)?;
                continue;
            }
            if self.opcode != OPCODE_CONTINUATION {
                return Err(protocol_error(format!(
                    "expected continuation opcode but was {:#03x}",
                    self.opcode
                )));
            }
            message.extend_from_slice(&self.read_payload()?);
        }

        if self.compressed_message {
            let inflater = self.inflater.as_mut().expect("checked in read_header");
            message = inflater.inflate(&message)?;
            self.compressed_message = false;
        }

        if opcode == OPCODE_TEXT {
            let text = String::from_utf8(message)
                .map_err(|_| protocol_error("text message is not UTF-8".to_string()))?;
            callback.on_read_message_text(text)?;
        } else {
            callback.on_read_message_binary(Bytes::from(message))?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.source.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Validates a close code per RFC 6455 section 7.4.
pub(crate) fn validate_close_code(code: u16) -> Result<(), String> {
    match code {
        1004 | 1005 | 1006 | 1015..=2999 => {
            Err(format!("code {} is reserved and may not be used", code))
        }
        1000..=4999 => Ok(()),
        _ => Err(format!("code must be in range [1000,5000): {}", code)),
    }
}

/// Writes frames onto the socket. One writer exists per socket and is
/// driven by the socket's writer task.
pub(crate) struct WebSocketWriter<W> {
    sink: W,
    is_client: bool,
    deflater: Option<MessageDeflater>,
    minimum_deflate_size: usize,
}

impl<W: Write> WebSocketWriter<W> {
    pub(crate) fn new(
        sink: W,
        is_client: bool,
        deflater: Option<MessageDeflater>,
        minimum_deflate_size: usize,
    ) -> Self {
        WebSocketWriter {
            sink,
            is_client,
            deflater,
            minimum_deflate_size,
        }
    }

    pub(crate) fn write_ping(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_control_frame(OPCODE_CONTROL_PING, payload)
    }

    pub(crate) fn write_pong(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_control_frame(OPCODE_CONTROL_PONG, payload)
    }

    /// A close frame carries an optional 2-byte code plus a reason of at
    /// most 123 bytes.
    pub(crate) fn write_close(&mut self, code: u16, reason: &[u8]) -> io::Result<()> {
        let mut payload = Vec::new();
        if code != CLOSE_NO_STATUS_CODE || !reason.is_empty() {
            validate_close_code(code).map_err(protocol_error)?;
            if reason.len() > MAX_CLOSE_REASON {
                return Err(protocol_error(format!(
                    "reason.size() > {}: {} bytes",
                    MAX_CLOSE_REASON,
                    reason.len()
                )));
            }
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason);
        }
        self.write_control_frame(OPCODE_CONTROL_CLOSE, &payload)
    }

    fn write_control_frame(&mut self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(protocol_error(format!(
                "payload.size() > {}: {} bytes",
                MAX_CONTROL_PAYLOAD,
                payload.len()
            )));
        }
        self.write_frame(FLAG_FIN | opcode, payload)
    }

    /// Writes one data message as a single frame, compressing it when
    /// negotiated and profitable.
    pub(crate) fn write_message(&mut self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        let mut first_byte = FLAG_FIN | opcode;
        let compressed;
        if let Some(ref mut deflater) = self.deflater {
            if payload.len() >= self.minimum_deflate_size {
                compressed = Some(deflater.deflate(payload)?);
                first_byte |= FLAG_RSV1;
            } else {
                compressed = None;
            }
        } else {
            compressed = None;
        }
        match compressed {
            Some(bytes) => self.write_frame(first_byte, &bytes),
            None => self.write_frame(first_byte, payload),
        }
    }

    fn write_frame(&mut self, first_byte: u8, payload: &[u8]) -> io::Result<()> {
        self.sink.write_all(&[first_byte])?;

        let mask_flag = if self.is_client { FLAG_MASK } else { 0 };
        let length = payload.len() as u64;
        if length <= PAYLOAD_SHORT_MAX {
            self.sink.write_all(&[mask_flag | length as u8])?;
        } else if length <= u16::MAX as u64 {
            self.sink.write_all(&[mask_flag | PAYLOAD_16BIT])?;
            self.sink.write_all(&(length as u16).to_be_bytes())?;
        } else {
            self.sink.write_all(&[mask_flag | PAYLOAD_64BIT])?;
            self.sink.write_all(&length.to_be_bytes())?;
        }

        if self.is_client {
            let mut mask_key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut mask_key);
            self.sink.write_all(&mask_key)?;
            let mut masked = payload.to_vec();
            toggle_mask(&mut masked, &mask_key);
            self.sink.write_all(&masked)?;
        } else {
            self.sink.write_all(payload)?;
        }
        self.sink.flush()
    }
}

/// XORs `buffer` with the repeating 4-byte mask key.
pub(crate) fn toggle_mask(buffer: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        texts: RefCell<Vec<String>>,
        binaries: RefCell<Vec<Bytes>>,
        pings: RefCell<Vec<Bytes>>,
        pongs: RefCell<Vec<Bytes>>,
        closes: RefCell<Vec<(u16, String)>>,
    }

    impl FrameCallback for Recorder {
        fn on_read_message_text(&self, text: String) -> io::Result<()> {
            self.texts.borrow_mut().push(text);
            Ok(())
        }
        fn on_read_message_binary(&self, bytes: Bytes) -> io::Result<()> {
            self.binaries.borrow_mut().push(bytes);
            Ok(())
        }
        fn on_read_ping(&self, payload: Bytes) {
            self.pings.borrow_mut().push(payload);
        }
        fn on_read_pong(&self, payload: Bytes) {
            self.pongs.borrow_mut().push(payload);
        }
        fn on_read_close(&self, code: u16, reason: String) {
            self.closes.borrow_mut().push((code, reason));
        }
    }

    fn server_reader(bytes: &[u8]) -> WebSocketReader<&[u8]> {
        // A "client" reader accepts the unmasked frames servers send.
        WebSocketReader::new(bytes, true, None)
    }

    #[test]
    fn reads_unmasked_text() {
        // RFC 6455 section 5.7 example: "Hello".
        let recorder = Recorder::default();
        let mut reader =
            server_reader(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
        reader.process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.texts.borrow().as_slice(), ["Hello"]);
    }

    #[test]
    fn client_writes_masked_round_trip() {
        let mut wire = Vec::new();
        {
            let mut writer = WebSocketWriter::new(&mut wire, true, None, 1024);
            writer.write_message(OPCODE_TEXT, b"Hello").unwrap();
        }
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x80 | 5);
        // Unmask to recover the payload.
        let key: [u8; 4] = wire[2..6].try_into().unwrap();
        let mut payload = wire[6..].to_vec();
        toggle_mask(&mut payload, &key);
        assert_eq!(payload, b"Hello");

        // The matching server-side reader accepts it.
        let recorder = Recorder::default();
        let mut reader = WebSocketReader::new(&wire[..], false, None);
        reader.process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.texts.borrow().as_slice(), ["Hello"]);
    }

    #[test]
    fn fragmented_message_reassembled() {
        // "Hel" + continuation "lo", with a ping interleaved.
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x01, 0x03, b'H', b'e', b'l']);
        wire.extend_from_slice(&[0x89, 0x00]);
        wire.extend_from_slice(&[0x80, 0x02, b'l', b'o']);
        let recorder = Recorder::default();
        let mut reader = server_reader(&wire);
        reader.process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.texts.borrow().as_slice(), ["Hello"]);
        assert_eq!(recorder.pings.borrow().len(), 1);
    }

    #[test]
    fn extended_lengths() {
        let medium = vec![0x42u8; 200];
        let mut wire = vec![0x82, 126];
        wire.extend_from_slice(&(200u16).to_be_bytes());
        wire.extend_from_slice(&medium);
        let recorder = Recorder::default();
        let mut reader = server_reader(&wire);
        reader.process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.binaries.borrow()[0].len(), 200);

        let large = vec![0x42u8; 70_000];
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(70_000u64).to_be_bytes());
        wire.extend_from_slice(&large);
        let recorder = Recorder::default();
        let mut reader = server_reader(&wire);
        reader.process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.binaries.borrow()[0].len(), 70_000);
    }

    #[test]
    fn close_frame_variants() {
        // Empty close.
        let recorder = Recorder::default();
        server_reader(&[0x88, 0x00]).process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.closes.borrow()[0], (CLOSE_NO_STATUS_CODE, String::new()));

        // Code only.
        let recorder = Recorder::default();
        server_reader(&[0x88, 0x02, 0x03, 0xe8])
            .process_next_frame(&recorder)
            .unwrap();
        assert_eq!(recorder.closes.borrow()[0], (1000, String::new()));

        // Code and reason.
        let mut wire = vec![0x88, 0x07, 0x03, 0xe9];
        wire.extend_from_slice(b"going");
        let recorder = Recorder::default();
        server_reader(&wire).process_next_frame(&recorder).unwrap();
        assert_eq!(recorder.closes.borrow()[0], (1001, "going".to_string()));

        // One-byte payload is malformed.
        let recorder = Recorder::default();
        assert!(server_reader(&[0x88, 0x01, 0x03])
            .process_next_frame(&recorder)
            .is_err());
    }

    #[test]
    fn oversize_control_rejected() {
        let mut wire = vec![0x89, 126];
        wire.extend_from_slice(&(126u16).to_be_bytes());
        wire.extend_from_slice(&vec![0u8; 126]);
        let recorder = Recorder::default();
        assert!(server_reader(&wire).process_next_frame(&recorder).is_err());
    }

    #[test]
    fn masked_server_frame_rejected_by_client() {
        let recorder = Recorder::default();
        let mut reader = server_reader(&[0x81, 0x85, 1, 2, 3, 4, 0, 0, 0, 0, 0]);
        assert!(reader.process_next_frame(&recorder).is_err());
    }

    #[test]
    fn close_reason_too_long_rejected_by_writer() {
        let mut wire = Vec::new();
        let mut writer = WebSocketWriter::new(&mut wire, true, None, 1024);
        let long = vec![b'x'; 124];
        assert!(writer.write_close(1000, &long).is_err());
        let ok = vec![b'x'; 123];
        assert!(writer.write_close(1000, &ok).is_ok());
    }

    #[test]
    fn close_code_validation() {
        assert!(validate_close_code(1000).is_ok());
        assert!(validate_close_code(4999).is_ok());
        assert!(validate_close_code(1005).is_err());
        assert!(validate_close_code(2500).is_err());
        assert!(validate_close_code(999).is_err());
        assert!(validate_close_code(5000).is_err());
    }
}
