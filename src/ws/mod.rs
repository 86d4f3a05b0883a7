//! A WebSocket client (RFC 6455) with optional `permessage-deflate`
//! compression (RFC 7692).
//!
//! After the HTTP/1.1 upgrade handshake, a dedicated reader thread
//! drives inbound frames while outbound messages queue onto a writer
//! task. Closing is a handshake of its own: after sending a close frame
//! no further data frames go out, and a peer that never answers is cut
//! off after a deadline.

pub(crate) mod extensions;
pub(crate) mod frame;

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use log::{debug, trace};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::client::Client;
use crate::error::Error;
use crate::headers::Headers;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::task::{Task, TaskQueue, DONE};
use crate::transport::Transport;

use self::extensions::{MessageDeflater, MessageInflater, WebSocketExtensions};
use self::frame::{
    FrameCallback, WebSocketReader, WebSocketWriter, CLOSE_NO_STATUS_CODE, OPCODE_BINARY,
    OPCODE_TEXT,
};

/// Fixed by RFC 6455 section 1.3.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Enqueued-but-unsent bytes beyond this tear the connection down
/// rather than buffer without bound.
const MAX_QUEUE_SIZE: u64 = 16 * 1024 * 1024;

/// How long to wait for the peer's close frame after sending ours.
const CANCEL_AFTER_CLOSE_MILLIS: u64 = 60_000;

/// Messages smaller than this are cheaper to send uncompressed.
const DEFAULT_MINIMUM_DEFLATE_SIZE: usize = 1024;

const CLOSE_CLIENT_GOING_AWAY: u16 = 1001;

/// Receives WebSocket lifecycle events. Methods default to no-ops.
#[allow(unused_variables)]
pub trait WebSocketListener: Send + Sync {
    fn on_open(&self, web_socket: &WebSocket) {}
    fn on_message_text(&self, web_socket: &WebSocket, text: String) {}
    fn on_message_binary(&self, web_socket: &WebSocket, bytes: Bytes) {}
    /// The peer initiated a close; no more inbound messages will arrive.
    fn on_closing(&self, web_socket: &WebSocket, code: u16, reason: &str) {}
    /// Both directions are done.
    fn on_closed(&self, web_socket: &WebSocket, code: u16, reason: &str) {}
    /// Terminal; reported exactly once, after which frames are ignored.
    fn on_failure(&self, web_socket: &WebSocket, error: Error) {}
}

/// A connected WebSocket.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<WsInner>,
}

struct WsInner {
    url: crate::url::HttpUrl,
    listener: Arc<dyn WebSocketListener>,
    socket: crate::transport::SocketHandle,
    writer: Mutex<Option<WebSocketWriter<BufWriter<Box<dyn Write + Send>>>>>,
    writer_queue: TaskQueue,
    timer_queue: TaskQueue,
    state: Mutex<WsState>,
}

struct WsState {
    queue: VecDeque<Queued>,
    queue_size: u64,
    enqueued_close: bool,
    sent_close: bool,
    received_close: Option<(u16, String)>,
    awaiting_pong: bool,
    failed: bool,
}

enum Queued {
    Text(String),
    Binary(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

impl Queued {
    fn size(&self) -> u64 {
        match self {
            Queued::Text(text) => text.len() as u64,
            Queued::Binary(bytes) => bytes.len() as u64,
            Queued::Pong(_) | Queued::Close { .. } => 0,
        }
    }
}

impl WebSocket {
    /// Performs the upgrade handshake for `request` and starts the
    /// socket's reader and writer.
    ///
    /// The request URL uses the `http` or `https` scheme (`ws` and `wss`
    /// URLs can be rewritten with [`web_socket_url`]).
    pub fn connect(
        client: &Client,
        request: Request,
        listener: Arc<dyn WebSocketListener>,
    ) -> crate::Result<WebSocket> {
        let inner_client = client.inner();
        let url = request.url().clone();

        let mut key_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

        // Dial directly: an upgraded connection can never be pooled.
        let addrs = inner_client
            .dns
            .lookup(url.host())
            .map_err(Error::new_io)?;
        let mut tcp = None;
        let mut first_error: Option<Error> = None;
        for ip in addrs {
            let addr = std::net::SocketAddr::new(ip, url.port());
            let attempt = match inner_client.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    let e = Error::new_connect(format!("connect to {} failed", addr)).with(e);
                    first_error = Some(match first_error {
                        Some(primary) => primary.with_suppressed(e),
                        None => e,
                    });
                }
            }
        }
        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                return Err(
                    first_error.unwrap_or_else(|| Error::new_connect("no addresses resolved"))
                )
            }
        };

        let mut transport = if url.is_https() {
            let tls = inner_client
                .tls
                .clone()
                .ok_or_else(|| Error::new_config("a wss request requires a TLS connector"))?;
            let control = tcp.try_clone().map_err(Error::new_io)?;
            let session = tls
                .connect(
                    tcp,
                    url.host(),
                    &[Protocol::Http11],
                    &inner_client.connection_specs,
                )
                .map_err(Error::new_tls)?;
            Transport::tls(control, session, Protocol::Http11).map_err(Error::new_io)?
        } else {
            Transport::plaintext(tcp, Protocol::Http11).map_err(Error::new_io)?
        };

        // The upgrade request.
        let head = {
            let mut head = format!(
                "GET {} HTTP/1.1\r\n",
                url.encoded_path_and_query()
            );
            head.push_str(&format!("Host: {}\r\n", url.host_header()));
            head.push_str("Upgrade: websocket\r\n");
            head.push_str("Connection: Upgrade\r\n");
            head.push_str(&format!("Sec-WebSocket-Key: {}\r\n", key));
            head.push_str("Sec-WebSocket-Version: 13\r\n");
            head.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
            for (name, value) in request.headers() {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
            head.push_str("\r\n");
            head
        };
        transport
            .sink
            .write_all(head.as_bytes())
            .and_then(|()| transport.sink.flush())
            .map_err(Error::new_io)?;

        let response_head = crate::proto::h1::parse::read_response_head(&mut transport.source)?;
        check_upgrade(&response_head.headers, response_head.code, &key)?;
        let negotiated = WebSocketExtensions::parse(&response_head.headers);

        let (deflater, inflater) = if negotiated.compression_enabled() {
            debug!("permessage-deflate negotiated for {}", url.redact());
            (
                Some(MessageDeflater::new(negotiated.client_no_context_takeover)),
                Some(MessageInflater::new(negotiated.server_no_context_takeover)),
            )
        } else {
            (None, None)
        };

        let task_runner = &inner_client.task_runner;
        let inner = Arc::new(WsInner {
            url,
            listener,
            socket: transport.socket,
            writer: Mutex::new(Some(WebSocketWriter::new(
                transport.sink,
                true,
                deflater,
                DEFAULT_MINIMUM_DEFLATE_SIZE,
            ))),
            writer_queue: task_runner.new_queue(),
            timer_queue: task_runner.new_queue(),
            state: Mutex::new(WsState {
                queue: VecDeque::new(),
                queue_size: 0,
                enqueued_close: false,
                sent_close: false,
                received_close: None,
                awaiting_pong: false,
                failed: false,
            }),
        });
        let web_socket = WebSocket { inner };

        web_socket.start_reader(transport.source, inflater);
        if let Some(interval) = inner_client.ping_interval {
            web_socket.schedule_pings(interval);
        }
        web_socket.inner.listener.on_open(&web_socket);
        Ok(web_socket)
    }

    /// The URL this socket was opened against.
    pub fn url(&self) -> &crate::url::HttpUrl {
        &self.inner.url
    }

    /// Bytes enqueued but not yet transmitted.
    pub fn queue_size(&self) -> u64 {
        self.inner.state.lock().unwrap().queue_size
    }

    /// Enqueues a text message. False if the socket is closing, failed,
    /// or the outbound queue is full.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Queued::Text(text.into()))
    }

    /// Enqueues a binary message.
    pub fn send_binary(&self, bytes: impl Into<Bytes>) -> bool {
        self.send(Queued::Binary(bytes.into()))
    }

    fn send(&self, message: Queued) -> bool {
        let size = message.size();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.failed || state.enqueued_close {
                return false;
            }
            if state.queue_size + size > MAX_QUEUE_SIZE {
                drop(state);
                // Unbounded buffering is worse than losing the socket.
                self.close(CLOSE_CLIENT_GOING_AWAY, "");
                return false;
            }
            state.queue_size += size;
            state.queue.push_back(message);
        }
        self.inner.schedule_writer();
        true
    }

    /// Initiates the close handshake. Data enqueued before this call is
    /// still transmitted.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if frame::validate_close_code(code).is_err() {
            return false;
        }
        if reason.len() > frame::MAX_CLOSE_REASON {
            return false;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.failed || state.enqueued_close {
                return false;
            }
            state.enqueued_close = true;
            state.queue.push_back(Queued::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.inner.schedule_writer();

        // The peer gets a bounded grace period to answer our close.
        let inner = Arc::downgrade(&self.inner);
        self.inner.timer_queue.execute(
            "websocket cancel after close",
            CANCEL_AFTER_CLOSE_MILLIS * 1_000_000,
            true,
            move || {
                if let Some(inner) = inner.upgrade() {
                    let pending = {
                        let state = inner.state.lock().unwrap();
                        state.received_close.is_none() && !state.failed
                    };
                    if pending {
                        debug!("peer never answered our close; canceling socket");
                        inner.socket.shutdown();
                    }
                }
            },
        );
        true
    }

    /// Abandons the socket immediately, discarding queued messages.
    pub fn cancel(&self) {
        self.inner.socket.shutdown();
        self.inner.writer_queue.cancel_all();
        self.inner.timer_queue.cancel_all();
    }

    fn start_reader(&self, source: BufReader<Box<dyn Read + Send>>, inflater: Option<MessageInflater>) {
        let ws = self.clone();
        thread::Builder::new()
            .name(format!("courier websocket reader {}", self.inner.url.host()))
            .spawn(move || {
                let mut reader = WebSocketReader::new(source, true, inflater);
                loop {
                    {
                        let state = ws.inner.state.lock().unwrap();
                        if state.failed || state.received_close.is_some() {
                            break;
                        }
                    }
                    if let Err(e) = reader.process_next_frame(&ws) {
                        ws.fail(Error::new_io(e));
                        break;
                    }
                }
            })
            .expect("failed to spawn websocket reader");
    }

    fn schedule_pings(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let nanos = interval.as_nanos() as u64;
        self.inner.timer_queue.schedule(
            Task::new("websocket ping", true, move || {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return DONE,
                };
                let ws = WebSocket {
                    inner: inner.clone(),
                };
                {
                    let mut state = inner.state.lock().unwrap();
                    if state.failed || state.sent_close {
                        return DONE;
                    }
                    if state.awaiting_pong {
                        drop(state);
                        // A missed pong means the transport is dead.
                        ws.fail(Error::new_timeout());
                        return DONE;
                    }
                    state.awaiting_pong = true;
                }
                let mut writer = inner.writer.lock().unwrap();
                if let Some(ref mut writer) = *writer {
                    if let Err(e) = writer.write_ping(&[]) {
                        drop(writer);
                        ws.fail(Error::new_io(e));
                        return DONE;
                    }
                }
                nanos as i64
            }),
            nanos,
        );
    }

    fn fail(&self, error: Error) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.failed {
                return;
            }
            state.failed = true;
        }
        self.inner.socket.shutdown();
        self.inner.writer_queue.cancel_all();
        self.inner.timer_queue.cancel_all();
        self.inner.listener.on_failure(self, error);
    }
}

impl WsInner {
    /// Schedules a pass of the writer task; repeated schedules collapse.
    fn schedule_writer(self: &Arc<Self>) {
        let inner = Arc::downgrade(self);
        self.writer_queue.schedule(
            Task::new("websocket writer", true, move || match inner.upgrade() {
                Some(inner) => inner.write_one_frame(),
                None => DONE,
            }),
            0,
        );
    }

    /// Writes a single queued frame. Returns 0 to run again while work
    /// remains.
    fn write_one_frame(self: &Arc<Self>) -> i64 {
        let message = {
            let mut state = self.state.lock().unwrap();
            if state.failed || state.sent_close {
                return DONE;
            }
            match state.queue.pop_front() {
                Some(message) => {
                    state.queue_size -= message.size();
                    message
                }
                None => return DONE,
            }
        };

        let mut writer_slot = self.writer.lock().unwrap();
        let writer = match *writer_slot {
            Some(ref mut writer) => writer,
            None => return DONE,
        };
        let result = match &message {
            Queued::Text(text) => writer.write_message(OPCODE_TEXT, text.as_bytes()),
            Queued::Binary(bytes) => writer.write_message(OPCODE_BINARY, bytes),
            Queued::Pong(payload) => writer.write_pong(payload),
            Queued::Close { code, reason } => writer.write_close(*code, reason.as_bytes()),
        };
        drop(writer_slot);

        match result {
            Ok(()) => {
                if let Queued::Close { code, reason } = message {
                    self.finish_close(code, reason);
                    return DONE;
                }
                0
            }
            Err(e) => {
                let ws = WebSocket {
                    inner: self.clone(),
                };
                ws.fail(Error::new_io(e));
                DONE
            }
        }
    }

    /// Our close frame is on the wire; tear down once the peer's close
    /// was also seen.
    fn finish_close(self: &Arc<Self>, _code: u16, _reason: String) {
        let received = {
            let mut state = self.state.lock().unwrap();
            state.sent_close = true;
            state.received_close.clone()
        };
        trace!("sent close frame for {}", self.url.redact());
        if let Some((peer_code, peer_reason)) = received {
            let ws = WebSocket {
                inner: self.clone(),
            };
            self.socket.shutdown();
            self.listener.on_closed(&ws, peer_code, &peer_reason);
        }
    }
}

impl FrameCallback for WebSocket {
    fn on_read_message_text(&self, text: String) -> io::Result<()> {
        self.inner.listener.on_message_text(self, text);
        Ok(())
    }

    fn on_read_message_binary(&self, bytes: Bytes) -> io::Result<()> {
        self.inner.listener.on_message_binary(self, bytes);
        Ok(())
    }

    fn on_read_ping(&self, payload: Bytes) {
        // Pongs jump the data queue cost-wise (they carry no size) but
        // keep ordering with other queued frames.
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.failed || state.sent_close {
                return;
            }
            state.queue.push_back(Queued::Pong(payload));
        }
        self.inner.schedule_writer();
    }

    fn on_read_pong(&self, _payload: Bytes) {
        let mut state = self.inner.state.lock().unwrap();
        state.awaiting_pong = false;
    }

    fn on_read_close(&self, code: u16, reason: String) {
        let sent_close = {
            let mut state = self.inner.state.lock().unwrap();
            if state.received_close.is_some() {
                return;
            }
            state.received_close = Some((code, reason.clone()));
            state.sent_close
        };
        self.inner.listener.on_closing(self, code, &reason);

        if sent_close {
            // Handshake complete in both directions.
            self.inner.socket.shutdown();
            self.inner.listener.on_closed(self, code, &reason);
        } else {
            // We must echo a close and then stop sending data.
            let echo_code = if code == CLOSE_NO_STATUS_CODE {
                CLOSE_NO_STATUS_CODE
            } else {
                code
            };
            {
                let mut state = self.inner.state.lock().unwrap();
                state.enqueued_close = true;
                state.queue.push_back(Queued::Close {
                    code: echo_code,
                    reason: String::new(),
                });
            }
            self.inner.schedule_writer();
        }
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("url", &self.inner.url)
            .finish()
    }
}

/// Verifies the server's 101 response and `Sec-WebSocket-Accept`.
fn check_upgrade(headers: &Headers, code: u16, key: &str) -> crate::Result<()> {
    if code != 101 {
        return Err(Error::new_protocol(format!(
            "expected HTTP 101 but was {}",
            code
        )));
    }
    if !headers
        .get("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::new_protocol("expected Upgrade: websocket"));
    }
    if !headers
        .comma_values("Connection")
        .iter()
        .any(|v| v == "upgrade")
    {
        return Err(Error::new_protocol("expected Connection: Upgrade"));
    }
    let expected = accept_header_value(key);
    match headers.get("Sec-WebSocket-Accept") {
        Some(actual) if actual == expected => Ok(()),
        other => Err(Error::new_protocol(format!(
            "expected Sec-WebSocket-Accept {} but was {:?}",
            expected, other
        ))),
    }
}

/// `base64(SHA-1(key || GUID))` per RFC 6455 section 4.1.
pub(crate) fn accept_header_value(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Rewrites `ws`/`wss` URLs to their `http`/`https` equivalents.
pub fn web_socket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ws:") {
        format!("http:{}", rest)
    } else if let Some(rest) = url.strip_prefix("wss:") {
        format!("https:{}", rest)
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6455 section 1.3 sample handshake.
    #[test]
    fn accept_value_matches_rfc_example() {
        assert_eq!(
            accept_header_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_checks() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let good = Headers::of(&[
            "Upgrade", "websocket",
            "Connection", "Upgrade",
            "Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        ]);
        assert!(check_upgrade(&good, 101, key).is_ok());
        assert!(check_upgrade(&good, 200, key).is_err());

        let bad_accept = Headers::of(&[
            "Upgrade", "websocket",
            "Connection", "Upgrade",
            "Sec-WebSocket-Accept", "bogus=",
        ]);
        assert!(check_upgrade(&bad_accept, 101, key).is_err());
    }

    #[test]
    fn scheme_rewrite() {
        assert_eq!(web_socket_url("ws://x.test/chat"), "http://x.test/chat");
        assert_eq!(web_socket_url("wss://x.test/chat"), "https://x.test/chat");
        assert_eq!(web_socket_url("http://x.test/"), "http://x.test/");
    }
}
