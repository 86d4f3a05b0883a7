//! HTTP/2 frame vocabulary (RFC 7540 section 4).

use std::fmt;
use std::io::{self, Read, Write};

/// The client connection preface, sent before any frame.
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Every implementation must initially accept frames of this size.
pub(crate) const INITIAL_MAX_FRAME_SIZE: u32 = 16_384;

/// The largest size SETTINGS_MAX_FRAME_SIZE may advertise.
pub(crate) const ABSOLUTE_MAX_FRAME_SIZE: u32 = 16_777_215;

pub(crate) const TYPE_DATA: u8 = 0x0;
pub(crate) const TYPE_HEADERS: u8 = 0x1;
pub(crate) const TYPE_PRIORITY: u8 = 0x2;
pub(crate) const TYPE_RST_STREAM: u8 = 0x3;
pub(crate) const TYPE_SETTINGS: u8 = 0x4;
pub(crate) const TYPE_PUSH_PROMISE: u8 = 0x5;
pub(crate) const TYPE_PING: u8 = 0x6;
pub(crate) const TYPE_GOAWAY: u8 = 0x7;
pub(crate) const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub(crate) const TYPE_CONTINUATION: u8 = 0x9;

pub(crate) const FLAG_NONE: u8 = 0x0;
pub(crate) const FLAG_ACK: u8 = 0x1; // SETTINGS, PING
pub(crate) const FLAG_END_STREAM: u8 = 0x1; // DATA, HEADERS
pub(crate) const FLAG_END_HEADERS: u8 = 0x4; // HEADERS, PUSH_PROMISE, CONTINUATION
pub(crate) const FLAG_PADDED: u8 = 0x8; // DATA, HEADERS, PUSH_PROMISE
pub(crate) const FLAG_PRIORITY: u8 = 0x20; // HEADERS

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl ErrorCode {
    pub(crate) fn from_u32(code: u32) -> Option<ErrorCode> {
        Some(match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::ProtocolError,
            2 => ErrorCode::InternalError,
            3 => ErrorCode::FlowControlError,
            4 => ErrorCode::SettingsTimeout,
            5 => ErrorCode::StreamClosed,
            6 => ErrorCode::FrameSizeError,
            7 => ErrorCode::RefusedStream,
            8 => ErrorCode::Cancel,
            9 => ErrorCode::CompressionError,
            10 => ErrorCode::ConnectError,
            11 => ErrorCode::EnhanceYourCalm,
            12 => ErrorCode::InadequateSecurity,
            13 => ErrorCode::Http11Required,
            _ => return None,
        })
    }

    pub(crate) fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::ProtocolError => 1,
            ErrorCode::InternalError => 2,
            ErrorCode::FlowControlError => 3,
            ErrorCode::SettingsTimeout => 4,
            ErrorCode::StreamClosed => 5,
            ErrorCode::FrameSizeError => 6,
            ErrorCode::RefusedStream => 7,
            ErrorCode::Cancel => 8,
            ErrorCode::CompressionError => 9,
            ErrorCode::ConnectError => 10,
            ErrorCode::EnhanceYourCalm => 11,
            ErrorCode::InadequateSecurity => 12,
            ErrorCode::Http11Required => 13,
        }
    }

    /// True when a stream failed before any of its work was accepted, so
    /// the request is safe to replay elsewhere.
    pub(crate) fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::RefusedStream)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The fixed nine-byte header preceding every frame: a 24-bit length, an
/// 8-bit type, 8-bit flags, and a 31-bit stream id (reserved high bit).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) frame_type: u8,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHeader {
    pub(crate) fn read_from(source: &mut dyn Read) -> io::Result<FrameHeader> {
        let mut raw = [0u8; 9];
        source.read_exact(&mut raw)?;
        Ok(FrameHeader {
            length: u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
            frame_type: raw[3],
            flags: raw[4],
            stream_id: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7fff_ffff,
        })
    }

    pub(crate) fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        let len = self.length.to_be_bytes();
        let id = (self.stream_id & 0x7fff_ffff).to_be_bytes();
        sink.write_all(&[
            len[1], len[2], len[3], self.frame_type, self.flags, id[0], id[1], id[2], id[3],
        ])
    }

    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            length: 16_384,
            frame_type: TYPE_DATA,
            flags: FLAG_END_STREAM,
            stream_id: 3,
        };
        let mut raw = Vec::new();
        header.write_to(&mut raw).unwrap();
        assert_eq!(raw, [0x00, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03]);
        let parsed = FrameHeader::read_from(&mut &raw[..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn reserved_bit_masked() {
        let raw = [0x00, 0x00, 0x00, 0x06, 0x01, 0x80, 0x00, 0x00, 0x07];
        let parsed = FrameHeader::read_from(&mut &raw[..]).unwrap();
        assert_eq!(parsed.stream_id, 7);
        assert!(parsed.has_flag(FLAG_ACK));
    }

    #[test]
    fn error_code_round_trip() {
        for code in 0..=13u32 {
            assert_eq!(ErrorCode::from_u32(code).unwrap().as_u32(), code);
        }
        assert!(ErrorCode::from_u32(14).is_none());
    }

    #[test]
    fn preface_bytes() {
        assert_eq!(&CONNECTION_PREFACE[..9], &[0x50, 0x52, 0x49, 0x20, 0x2a, 0x20, 0x48, 0x54, 0x54]);
        assert_eq!(CONNECTION_PREFACE.len(), 24);
    }
}
