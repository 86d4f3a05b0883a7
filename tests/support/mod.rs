//! Shared scaffolding for integration tests: tiny in-process servers
//! speaking scripted HTTP/1.1, raw HTTP/2 frames, or WebSocket framing.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

use courier::{Client, Config, Protocol};

/// Starts a server thread; `handler` is invoked once per accepted
/// connection until the listener is dropped.
pub fn start_server<F>(mut handler: F) -> SocketAddr
where
    F: FnMut(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => handler(stream),
                Err(_) => break,
            }
        }
    });
    addr
}

/// Like [`start_server`], but each connection is handled on its own
/// thread so slow clients don't serialize the accept loop.
pub fn start_concurrent_server<F>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    let handler = std::sync::Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let handler = handler.clone();
                    thread::spawn(move || handler(stream));
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Reads one request head (request line + headers) off the stream.
pub fn read_request_head(reader: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let trimmed = line.trim_end().to_string();
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed);
    }
    lines
}

pub fn request_line(head: &[String]) -> &str {
    head.first().map(String::as_str).unwrap_or("")
}

pub fn header<'a>(head: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    head.iter()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .map(|line| line[prefix.len()..].trim())
}

pub fn content_length(head: &[String]) -> usize {
    header(head, "Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// A default client pointed at loopback servers.
pub fn test_client() -> Client {
    Client::new(Config::default()).expect("valid config")
}

pub fn client_with(f: impl FnOnce(&mut Config)) -> Client {
    let mut config = Config::default();
    f(&mut config);
    Client::new(config).expect("valid config")
}

// ===== raw HTTP/2 framing for the scripted h2 server =====

pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub struct H2Frame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub fn read_h2_frame(reader: &mut impl Read) -> std::io::Result<H2Frame> {
    let mut head = [0u8; 9];
    reader.read_exact(&mut head)?;
    let length = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(H2Frame {
        frame_type: head[3],
        flags: head[4],
        stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
        payload,
    })
}

pub fn write_h2_frame(
    writer: &mut impl Write,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&[len[1], len[2], len[3], frame_type, flags])?;
    writer.write_all(&stream_id.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// An h2-prior-knowledge client for the scripted server.
pub fn h2_client() -> Client {
    client_with(|config| {
        config.protocols = vec![Protocol::H2PriorKnowledge];
        config.fast_fallback = false;
    })
}

// ===== WebSocket server-side helpers =====

/// `base64(SHA-1(key || GUID))` per RFC 6455.
pub fn ws_accept(key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub struct WsFrame {
    pub opcode: u8,
    pub fin: bool,
    pub payload: Vec<u8>,
}

/// Reads one client frame, unmasking the payload.
pub fn read_ws_frame(reader: &mut impl Read) -> std::io::Result<WsFrame> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0f;
    let masked = head[1] & 0x80 != 0;
    let mut length = (head[1] & 0x7f) as u64;
    if length == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext)?;
        length = u16::from_be_bytes(ext) as u64;
    } else if length == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext)?;
        length = u64::from_be_bytes(ext);
    }
    let mut mask = [0u8; 4];
    if masked {
        reader.read_exact(&mut mask)?;
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    Ok(WsFrame {
        opcode,
        fin,
        payload,
    })
}

/// Writes one unmasked server frame.
pub fn write_ws_frame(
    writer: &mut impl Write,
    opcode: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&[0x80 | opcode])?;
    let length = payload.len();
    if length <= 125 {
        writer.write_all(&[length as u8])?;
    } else if length <= u16::MAX as usize {
        writer.write_all(&[126])?;
        writer.write_all(&(length as u16).to_be_bytes())?;
    } else {
        writer.write_all(&[127])?;
        writer.write_all(&(length as u64).to_be_bytes())?;
    }
    writer.write_all(payload)?;
    writer.flush()
}

/// A channel pair tests use to observe server-side events.
pub fn event_channel<T: Send + 'static>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel()
}
