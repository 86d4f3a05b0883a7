//! An HTTP/2 connection: a socket shared by many streams.
//!
//! One dedicated reader thread drives the frame loop and dispatches to
//! streams; writers from any thread serialize through the writer lock.
//! HEADERS blocks (with their CONTINUATIONs) are emitted while holding
//! that lock, so they are never interleaved with frames of other
//! streams.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::error::Error;
use crate::transport::{SocketHandle, Transport};

use super::frame::{self, ErrorCode, FrameHeader};
use super::hpack;
use super::settings::{self, Settings};
use super::stream::Http2Stream;
use super::HeaderBlock;

/// How long a degraded connection stays unhealthy awaiting its pong.
const DEGRADED_PONG_TIMEOUT: Duration = Duration::from_secs(1);

/// Payload of interval pings; pongs echo it back.
const INTERVAL_PING_PAYLOAD: (u32, u32) = (0x4f4b, 0x6f6b);
const DEGRADED_PING_PAYLOAD: (u32, u32) = (0x4445, 0x4744);

pub(crate) struct Http2Connection {
    /// For logs: usually the route's address.
    name: String,
    socket: SocketHandle,
    writer: Mutex<Http2Writer>,
    state: Mutex<ConnState>,
    cond: Condvar,
}

struct ConnState {
    streams: HashMap<u32, Arc<Http2Stream>>,
    next_stream_id: u32,
    /// GOAWAY sent or received, or the connection failed: no new streams.
    is_shutdown: bool,
    local_settings: Settings,
    peer_settings: Settings,
    /// Copy of the peer's max frame size, readable without the writer.
    peer_max_frame_size: u32,
    /// Connection-level flow control for our writes.
    bytes_left_in_write_window: i64,
    /// Connection-level inbound accounting.
    read_bytes_total: u64,
    read_bytes_acknowledged: u64,
    /// Interval pings awaiting a pong fail the connection when missed.
    interval_pings_sent: u64,
    interval_pongs_received: u64,
    /// Set when a transport problem was observed; cleared by the pong.
    degraded_ping_sent_at: Option<Instant>,
}

impl Http2Connection {
    /// Sends the client preface and spawns the reader thread.
    pub(crate) fn start(
        transport: Transport,
        name: String,
        local_settings: Settings,
    ) -> crate::Result<Arc<Http2Connection>> {
        let Transport {
            source,
            sink,
            socket,
            ..
        } = transport;

        let mut writer = Http2Writer {
            sink,
            hpack: hpack::Encoder::new(),
            max_frame_size: frame::INITIAL_MAX_FRAME_SIZE,
        };
        writer.write_preface()?;
        writer.write_settings(&local_settings)?;
        writer.flush()?;

        let conn = Arc::new(Http2Connection {
            name,
            socket,
            writer: Mutex::new(writer),
            state: Mutex::new(ConnState {
                streams: HashMap::new(),
                next_stream_id: 3,
                is_shutdown: false,
                local_settings,
                peer_settings: Settings::new(),
                peer_max_frame_size: frame::INITIAL_MAX_FRAME_SIZE,
                bytes_left_in_write_window: settings::DEFAULT_INITIAL_WINDOW_SIZE as i64,
                read_bytes_total: 0,
                read_bytes_acknowledged: 0,
                interval_pings_sent: 0,
                interval_pongs_received: 0,
                degraded_ping_sent_at: None,
            }),
            cond: Condvar::new(),
        });

        let reader_conn = conn.clone();
        thread::Builder::new()
            .name(format!("courier http2 reader {}", reader_conn.name))
            .spawn(move || reader_conn.reader_loop(source))
            .map_err(|e| Error::new_io(io::Error::new(io::ErrorKind::Other, e)))?;

        Ok(conn)
    }

    pub(crate) fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// The peer's concurrency allowance for this connection.
    pub(crate) fn allocation_limit(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.peer_settings.max_concurrent_streams().min(u16::MAX as u32)
    }

    pub(crate) fn local_initial_window(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .local_settings
            .initial_window_size()
    }

    /// A connection is healthy if it can host new streams and is not
    /// waiting on an overdue degraded-mode pong.
    pub(crate) fn is_healthy(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.is_shutdown {
            return false;
        }
        if state.interval_pongs_received < state.interval_pings_sent {
            return false;
        }
        match state.degraded_ping_sent_at {
            Some(at) => at.elapsed() < DEGRADED_PONG_TIMEOUT,
            None => true,
        }
    }

    /// Notes a transport problem; health stays suspect until the peer
    /// answers a ping.
    pub(crate) fn send_degraded_ping(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.degraded_ping_sent_at.is_some() || state.is_shutdown {
                return;
            }
            state.degraded_ping_sent_at = Some(Instant::now());
        }
        let mut writer = self.writer.lock().unwrap();
        let (p1, p2) = DEGRADED_PING_PAYLOAD;
        if writer.write_ping(false, p1, p2).and_then(|()| writer.flush()).is_err() {
            drop(writer);
            self.fail(Error::new_io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "degraded ping write failed",
            )));
        }
    }

    /// Sends an interval keep-alive ping. Returns false if the previous
    /// one was never answered, which fails the connection.
    pub(crate) fn send_interval_ping(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return false;
            }
            if state.interval_pongs_received < state.interval_pings_sent {
                drop(state);
                warn!("{} missed interval pong; failing connection", self.name);
                self.fail(Error::new_protocol("missed http2 ping"));
                return false;
            }
            state.interval_pings_sent += 1;
        }
        let mut writer = self.writer.lock().unwrap();
        let (p1, p2) = INTERVAL_PING_PAYLOAD;
        let ok = writer
            .write_ping(false, p1, p2)
            .and_then(|()| writer.flush())
            .is_ok();
        drop(writer);
        if !ok {
            self.fail(Error::new_io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interval ping write failed",
            )));
        }
        ok
    }

    /// Opens a new locally-initiated stream and writes its HEADERS block
    /// atomically.
    pub(crate) fn new_stream(
        self: &Arc<Self>,
        headers: &HeaderBlock,
        out_finished: bool,
    ) -> crate::Result<Arc<Http2Stream>> {
        // The writer lock is held across id assignment and the HEADERS
        // write so stream ids increase monotonically on the wire.
        let mut writer = self.writer.lock().unwrap();
        let stream = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                // Nothing was sent for this stream, so the request is
                // safe to replay on another connection.
                return Err(Error::new_stream_reset(ErrorCode::RefusedStream));
            }
            let id = state.next_stream_id;
            state.next_stream_id += 2;
            let stream = Arc::new(Http2Stream::new(
                id,
                self.clone(),
                state.peer_settings.initial_window_size(),
            ));
            if out_finished {
                // No request body: the local half is already closed.
                stream.mark_write_finished();
            }
            state.streams.insert(id, stream.clone());
            stream
        };
        let result = writer
            .write_headers(stream.id, out_finished, headers)
            .and_then(|()| writer.flush());
        drop(writer);
        if let Err(e) = result {
            self.fail(Error::new_io(e));
            return Err(Error::new_stream_reset(ErrorCode::ConnectError));
        }
        trace!("{} opened stream {}", self.name, stream.id);
        Ok(stream)
    }

    /// Writes DATA frames, waiting for connection-level window.
    pub(crate) fn write_data(
        &self,
        stream_id: u32,
        end_stream: bool,
        mut data: &[u8],
    ) -> crate::Result<()> {
        loop {
            let allowance = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.is_shutdown {
                        return Err(Error::new_io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "connection shut down mid-write",
                        )));
                    }
                    if data.is_empty() || state.bytes_left_in_write_window > 0 {
                        break;
                    }
                    state = self.cond.wait(state).unwrap();
                }
                let max_frame = state.peer_max_frame_size as usize;
                let allowance = data
                    .len()
                    .min(max_frame)
                    .min(state.bytes_left_in_write_window.max(0) as usize)
                    .max(if data.is_empty() { 0 } else { 1 })
                    .min(data.len());
                state.bytes_left_in_write_window -= allowance as i64;
                allowance
            };

            let (chunk, rest) = data.split_at(allowance);
            data = rest;
            let last = data.is_empty();
            let mut writer = self.writer.lock().unwrap();
            let result = writer
                .write_data(stream_id, end_stream && last, chunk)
                .and_then(|()| if end_stream && last { writer.flush() } else { Ok(()) });
            drop(writer);
            if let Err(e) = result {
                self.fail(Error::new_io(e));
                return Err(Error::new_stream_reset(ErrorCode::ConnectError));
            }
            if last {
                return Ok(());
            }
        }
    }

    pub(crate) fn flush(&self) -> crate::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush().map_err(Error::new_io)
    }

    pub(crate) fn write_stream_window_update(&self, stream_id: u32, delta: u64) {
        let mut writer = self.writer.lock().unwrap();
        let result = writer
            .write_window_update(stream_id, delta as u32)
            .and_then(|()| writer.flush());
        if result.is_err() {
            drop(writer);
            self.fail(Error::new_io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "window update write failed",
            )));
        }
    }

    /// Sends RST_STREAM and forgets the stream.
    pub(crate) fn reset_stream(&self, stream_id: u32, code: ErrorCode) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.streams.remove(&stream_id)
        };
        if let Some(stream) = removed {
            stream.receive_rst(code);
        }
        let mut writer = self.writer.lock().unwrap();
        let _ = writer
            .write_rst_stream(stream_id, code)
            .and_then(|()| writer.flush());
    }

    /// Removes `stream` from the table once both halves are done.
    pub(crate) fn stream_finished(&self, stream: &Arc<Http2Stream>) {
        if !stream.is_closed() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.streams.remove(&stream.id);
    }

    /// Sends GOAWAY and refuses new streams. Existing streams continue.
    pub(crate) fn shutdown(&self, code: ErrorCode) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
        }
        self.cond.notify_all();
        let last_good = 0;
        let mut writer = self.writer.lock().unwrap();
        let _ = writer
            .write_goaway(last_good, code)
            .and_then(|()| writer.flush());
    }

    /// Hard-fails the connection: every stream errs, the socket closes.
    pub(crate) fn fail(&self, error: Error) {
        let streams: Vec<Arc<Http2Stream>> = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown && state.streams.is_empty() {
                return;
            }
            state.is_shutdown = true;
            state.streams.drain().map(|(_, s)| s).collect()
        };
        debug!("{} failed: {}", self.name, error);
        self.cond.notify_all();
        for stream in streams {
            stream.receive_rst(ErrorCode::ConnectError);
        }
        self.socket.shutdown();
    }

    // ===== the reader thread =====

    fn reader_loop(self: Arc<Self>, source: BufReader<Box<dyn Read + Send>>) {
        let mut reader = FrameReader {
            conn: &self,
            source,
            hpack: hpack::Decoder::new(self.local_initial_table_size()),
            seen_first_settings: false,
        };
        let result = reader.run();
        match result {
            Ok(()) => self.fail(Error::new_incomplete()),
            Err(ReadFailure::Io(e)) => self.fail(Error::new_io(e)),
            Err(ReadFailure::Protocol(code, msg)) => {
                debug!("{} protocol error: {} ({})", self.name, msg, code);
                self.shutdown(code);
                self.fail(Error::new_protocol(msg));
            }
        }
    }

    fn local_initial_table_size(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .local_settings
            .header_table_size()
    }

    /// Connection-level inbound accounting; returns the window once half
    /// of it is unacknowledged.
    fn ack_connection_data(&self, byte_count: u64) {
        let delta = {
            let mut state = self.state.lock().unwrap();
            state.read_bytes_total += byte_count;
            let unacked = state.read_bytes_total - state.read_bytes_acknowledged;
            if unacked >= settings::DEFAULT_INITIAL_WINDOW_SIZE as u64 / 2 {
                state.read_bytes_acknowledged = state.read_bytes_total;
                unacked
            } else {
                0
            }
        };
        if delta > 0 {
            let mut writer = self.writer.lock().unwrap();
            let _ = writer
                .write_window_update(0, delta as u32)
                .and_then(|()| writer.flush());
        }
    }

    fn get_stream(&self, id: u32) -> Option<Arc<Http2Stream>> {
        self.state.lock().unwrap().streams.get(&id).cloned()
    }
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("name", &self.name)
            .finish()
    }
}

enum ReadFailure {
    Io(io::Error),
    Protocol(ErrorCode, &'static str),
}

impl From<io::Error> for ReadFailure {
    fn from(e: io::Error) -> ReadFailure {
        if e.kind() == io::ErrorKind::InvalidData {
            ReadFailure::Protocol(ErrorCode::CompressionError, "malformed header block")
        } else {
            ReadFailure::Io(e)
        }
    }
}

struct FrameReader<'a> {
    conn: &'a Arc<Http2Connection>,
    source: BufReader<Box<dyn Read + Send>>,
    hpack: hpack::Decoder,
    seen_first_settings: bool,
}

impl<'a> FrameReader<'a> {
    fn run(&mut self) -> Result<(), ReadFailure> {
        loop {
            let header = match FrameHeader::read_from(&mut self.source) {
                Ok(h) => h,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(ReadFailure::Io(e)),
            };
            trace!(
                "{} <- frame type={} flags={:#x} stream={} length={}",
                self.conn.name,
                header.frame_type,
                header.flags,
                header.stream_id,
                header.length
            );
            if header.length > frame::INITIAL_MAX_FRAME_SIZE {
                return Err(ReadFailure::Protocol(
                    ErrorCode::FrameSizeError,
                    "frame exceeds SETTINGS_MAX_FRAME_SIZE",
                ));
            }
            if !self.seen_first_settings && header.frame_type != frame::TYPE_SETTINGS {
                return Err(ReadFailure::Protocol(
                    ErrorCode::ProtocolError,
                    "expected SETTINGS as the first frame",
                ));
            }
            match header.frame_type {
                frame::TYPE_DATA => self.read_data(header)?,
                frame::TYPE_HEADERS => self.read_headers(header)?,
                frame::TYPE_PRIORITY => self.skip(header.length as usize)?,
                frame::TYPE_RST_STREAM => self.read_rst_stream(header)?,
                frame::TYPE_SETTINGS => self.read_settings(header)?,
                frame::TYPE_PUSH_PROMISE => {
                    // ENABLE_PUSH=0 makes any push a connection error.
                    return Err(ReadFailure::Protocol(
                        ErrorCode::ProtocolError,
                        "push promise despite ENABLE_PUSH=0",
                    ));
                }
                frame::TYPE_PING => self.read_ping(header)?,
                frame::TYPE_GOAWAY => self.read_goaway(header)?,
                frame::TYPE_WINDOW_UPDATE => self.read_window_update(header)?,
                frame::TYPE_CONTINUATION => {
                    return Err(ReadFailure::Protocol(
                        ErrorCode::ProtocolError,
                        "continuation without headers",
                    ));
                }
                _ => self.skip(header.length as usize)?,
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadFailure> {
        self.source.read_exact(buf).map_err(ReadFailure::Io)
    }

    fn skip(&mut self, mut n: usize) -> Result<(), ReadFailure> {
        let mut scratch = [0u8; 512];
        while n > 0 {
            let take = n.min(scratch.len());
            self.read_exact(&mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32, ReadFailure> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn read_data(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.stream_id == 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "DATA on stream 0",
            ));
        }
        let mut length = header.length as usize;
        let mut pad = 0usize;
        if header.has_flag(frame::FLAG_PADDED) {
            let mut b = [0u8; 1];
            self.read_exact(&mut b)?;
            pad = b[0] as usize;
            length = length
                .checked_sub(1 + pad)
                .ok_or(ReadFailure::Protocol(
                    ErrorCode::ProtocolError,
                    "padding exceeds frame length",
                ))?;
        }
        let mut payload = vec![0u8; length];
        self.read_exact(&mut payload)?;
        self.skip(pad)?;

        // Padding consumes connection window too.
        self.conn.ack_connection_data(header.length as u64);

        let end_stream = header.has_flag(frame::FLAG_END_STREAM);
        match self.conn.get_stream(header.stream_id) {
            Some(stream) => {
                let initial = self.conn.local_initial_window();
                if let Err(code) = stream.receive_data(Bytes::from(payload), end_stream, initial)
                {
                    self.conn.reset_stream(header.stream_id, code);
                } else if end_stream {
                    self.conn.stream_finished(&stream);
                }
            }
            None => {
                // Data for a stream we no longer (or never) know.
                self.conn
                    .reset_stream(header.stream_id, ErrorCode::ProtocolError);
            }
        }
        Ok(())
    }

    fn read_headers(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.stream_id == 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "HEADERS on stream 0",
            ));
        }
        let mut length = header.length as usize;
        let mut pad = 0usize;
        if header.has_flag(frame::FLAG_PADDED) {
            let mut b = [0u8; 1];
            self.read_exact(&mut b)?;
            pad = b[0] as usize;
            length = length.checked_sub(1).ok_or(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "padding exceeds frame length",
            ))?;
        }
        if header.has_flag(frame::FLAG_PRIORITY) {
            self.skip(5)?;
            length = length.checked_sub(5).ok_or(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "priority exceeds frame length",
            ))?;
        }
        length = length.checked_sub(pad).ok_or(ReadFailure::Protocol(
            ErrorCode::ProtocolError,
            "padding exceeds frame length",
        ))?;

        let mut block = BytesMut::with_capacity(length);
        block.resize(length, 0);
        self.read_exact(&mut block)?;
        self.skip(pad)?;

        // CONTINUATION frames extend the block until END_HEADERS; no
        // other frame may interleave.
        let mut flags = header.flags;
        while flags & frame::FLAG_END_HEADERS == 0 {
            let cont = FrameHeader::read_from(&mut self.source).map_err(ReadFailure::Io)?;
            if cont.frame_type != frame::TYPE_CONTINUATION
                || cont.stream_id != header.stream_id
            {
                return Err(ReadFailure::Protocol(
                    ErrorCode::ProtocolError,
                    "expected continuation of the same stream",
                ));
            }
            let start = block.len();
            block.resize(start + cont.length as usize, 0);
            self.read_exact(&mut block[start..])?;
            flags = cont.flags;
        }

        let fields: HeaderBlock = self.hpack.decode(&block)?;
        let end_stream = header.has_flag(frame::FLAG_END_STREAM);

        if header.stream_id % 2 == 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "server-initiated stream",
            ));
        }
        match self.conn.get_stream(header.stream_id) {
            Some(stream) => {
                stream.receive_headers(fields, end_stream);
                if end_stream {
                    self.conn.stream_finished(&stream);
                }
            }
            None => {
                // Late headers for a canceled stream are ignored.
                trace!(
                    "{} discarding headers for unknown stream {}",
                    self.conn.name,
                    header.stream_id
                );
            }
        }
        Ok(())
    }

    fn read_rst_stream(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.length != 4 || header.stream_id == 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::FrameSizeError,
                "malformed RST_STREAM",
            ));
        }
        let code = ErrorCode::from_u32(self.read_u32()?).unwrap_or(ErrorCode::InternalError);
        let removed = {
            let mut state = self.conn.state.lock().unwrap();
            state.streams.remove(&header.stream_id)
        };
        if let Some(stream) = removed {
            debug!(
                "{} stream {} reset by peer: {}",
                self.conn.name, header.stream_id, code
            );
            stream.receive_rst(code);
        }
        Ok(())
    }

    fn read_settings(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.stream_id != 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "SETTINGS on a stream",
            ));
        }
        if header.has_flag(frame::FLAG_ACK) {
            if header.length != 0 {
                return Err(ReadFailure::Protocol(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ack with payload",
                ));
            }
            self.seen_first_settings = true;
            return Ok(());
        }
        if header.length % 6 != 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::FrameSizeError,
                "malformed SETTINGS",
            ));
        }
        let mut incoming = Settings::new();
        for _ in 0..header.length / 6 {
            let mut raw = [0u8; 6];
            self.read_exact(&mut raw)?;
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
            if let Some(internal) = settings::wire_to_internal(id) {
                incoming.set(internal, value);
            }
        }
        self.seen_first_settings = true;
        self.apply_peer_settings(&incoming);
        Ok(())
    }

    fn apply_peer_settings(&mut self, incoming: &Settings) {
        let (window_delta, streams, header_table_size) = {
            let mut state = self.conn.state.lock().unwrap();
            let old_window = state.peer_settings.initial_window_size() as i64;
            state.peer_settings.merge(incoming);
            state.peer_max_frame_size = state.peer_settings.max_frame_size();
            let delta = state.peer_settings.initial_window_size() as i64 - old_window;
            let streams: Vec<Arc<Http2Stream>> = state.streams.values().cloned().collect();
            let table = incoming
                .is_set(settings::HEADER_TABLE_SIZE)
                .then(|| state.peer_settings.header_table_size());
            (delta, streams, table)
        };

        if window_delta != 0 {
            for stream in &streams {
                stream.adjust_write_window(window_delta);
            }
        }

        let mut writer = self.conn.writer.lock().unwrap();
        if let Some(size) = header_table_size {
            writer.hpack.set_peer_max_table_size(size);
        }
        writer.max_frame_size = {
            let state = self.conn.state.lock().unwrap();
            state.peer_max_frame_size
        };
        let _ = writer.write_settings_ack().and_then(|()| writer.flush());
        drop(writer);

        debug!("{} peer settings applied", self.conn.name);
        self.conn.cond.notify_all();
    }

    fn read_ping(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.length != 8 || header.stream_id != 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::FrameSizeError,
                "malformed PING",
            ));
        }
        let payload1 = self.read_u32()?;
        let payload2 = self.read_u32()?;
        if header.has_flag(frame::FLAG_ACK) {
            let mut state = self.conn.state.lock().unwrap();
            if (payload1, payload2) == INTERVAL_PING_PAYLOAD {
                state.interval_pongs_received += 1;
            }
            state.degraded_ping_sent_at = None;
            drop(state);
            self.conn.cond.notify_all();
        } else {
            let mut writer = self.conn.writer.lock().unwrap();
            writer
                .write_ping(true, payload1, payload2)
                .and_then(|()| writer.flush())
                .map_err(ReadFailure::Io)?;
        }
        Ok(())
    }

    fn read_goaway(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.length < 8 || header.stream_id != 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::FrameSizeError,
                "malformed GOAWAY",
            ));
        }
        let last_good_stream_id = self.read_u32()? & 0x7fff_ffff;
        let code = ErrorCode::from_u32(self.read_u32()?).unwrap_or(ErrorCode::InternalError);
        self.skip(header.length as usize - 8)?;
        debug!(
            "{} goaway last_good={} code={}",
            self.conn.name, last_good_stream_id, code
        );

        // Streams above the cutoff were never processed: fail them as
        // retryable so calls replay on a fresh connection.
        let doomed: Vec<Arc<Http2Stream>> = {
            let mut state = self.conn.state.lock().unwrap();
            state.is_shutdown = true;
            let doomed = state
                .streams
                .iter()
                .filter(|(&id, s)| id > last_good_stream_id && s.is_locally_initiated())
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();
            state
                .streams
                .retain(|&id, s| !(id > last_good_stream_id && s.is_locally_initiated()));
            doomed
        };
        self.conn.cond.notify_all();
        for stream in doomed {
            stream.receive_rst(ErrorCode::RefusedStream);
        }
        Ok(())
    }

    fn read_window_update(&mut self, header: FrameHeader) -> Result<(), ReadFailure> {
        if header.length != 4 {
            return Err(ReadFailure::Protocol(
                ErrorCode::FrameSizeError,
                "malformed WINDOW_UPDATE",
            ));
        }
        let delta = self.read_u32()? & 0x7fff_ffff;
        if delta == 0 {
            return Err(ReadFailure::Protocol(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE of zero",
            ));
        }
        if header.stream_id == 0 {
            let mut state = self.conn.state.lock().unwrap();
            state.bytes_left_in_write_window += delta as i64;
            drop(state);
            self.conn.cond.notify_all();
        } else if let Some(stream) = self.conn.get_stream(header.stream_id) {
            stream.receive_window_update(delta);
        }
        Ok(())
    }
}

/// Serializes frames; exactly one thread writes at a time by holding the
/// connection's writer lock.
struct Http2Writer {
    sink: BufWriter<Box<dyn Write + Send>>,
    hpack: hpack::Encoder,
    max_frame_size: u32,
}

impl Http2Writer {
    fn write_preface(&mut self) -> crate::Result<()> {
        self.sink
            .write_all(frame::CONNECTION_PREFACE)
            .map_err(Error::new_io)
    }

    fn write_settings(&mut self, settings: &Settings) -> crate::Result<()> {
        let entries = settings.wire_entries();
        let header = FrameHeader {
            length: entries.len() as u32 * 6,
            frame_type: frame::TYPE_SETTINGS,
            flags: frame::FLAG_NONE,
            stream_id: 0,
        };
        (|| -> io::Result<()> {
            header.write_to(&mut self.sink)?;
            for (id, value) in entries {
                self.sink.write_all(&id.to_be_bytes())?;
                self.sink.write_all(&value.to_be_bytes())?;
            }
            Ok(())
        })()
        .map_err(Error::new_io)
    }

    fn write_settings_ack(&mut self) -> io::Result<()> {
        FrameHeader {
            length: 0,
            frame_type: frame::TYPE_SETTINGS,
            flags: frame::FLAG_ACK,
            stream_id: 0,
        }
        .write_to(&mut self.sink)
    }

    /// Emits HEADERS plus CONTINUATIONs for one block, never split by
    /// other frames (the caller holds the writer lock throughout).
    fn write_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        headers: &HeaderBlock,
    ) -> io::Result<()> {
        let mut block = BytesMut::new();
        self.hpack.encode(headers, &mut block);

        let max = self.max_frame_size as usize;
        let mut first = true;
        let mut remaining = &block[..];
        loop {
            let take = remaining.len().min(max);
            let (chunk, rest) = remaining.split_at(take);
            remaining = rest;
            let end_headers = remaining.is_empty();
            let mut flags = frame::FLAG_NONE;
            if end_headers {
                flags |= frame::FLAG_END_HEADERS;
            }
            if first && end_stream {
                flags |= frame::FLAG_END_STREAM;
            }
            FrameHeader {
                length: chunk.len() as u32,
                frame_type: if first {
                    frame::TYPE_HEADERS
                } else {
                    frame::TYPE_CONTINUATION
                },
                flags,
                stream_id,
            }
            .write_to(&mut self.sink)?;
            self.sink.write_all(chunk)?;
            first = false;
            if end_headers {
                return Ok(());
            }
        }
    }

    fn write_data(&mut self, stream_id: u32, end_stream: bool, data: &[u8]) -> io::Result<()> {
        debug_assert!(data.len() <= self.max_frame_size as usize);
        FrameHeader {
            length: data.len() as u32,
            frame_type: frame::TYPE_DATA,
            flags: if end_stream {
                frame::FLAG_END_STREAM
            } else {
                frame::FLAG_NONE
            },
            stream_id,
        }
        .write_to(&mut self.sink)?;
        self.sink.write_all(data)
    }

    fn write_rst_stream(&mut self, stream_id: u32, code: ErrorCode) -> io::Result<()> {
        FrameHeader {
            length: 4,
            frame_type: frame::TYPE_RST_STREAM,
            flags: frame::FLAG_NONE,
            stream_id,
        }
        .write_to(&mut self.sink)?;
        self.sink.write_all(&code.as_u32().to_be_bytes())
    }

    fn write_ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> io::Result<()> {
        FrameHeader {
            length: 8,
            frame_type: frame::TYPE_PING,
            flags: if ack { frame::FLAG_ACK } else { frame::FLAG_NONE },
            stream_id: 0,
        }
        .write_to(&mut self.sink)?;
        self.sink.write_all(&payload1.to_be_bytes())?;
        self.sink.write_all(&payload2.to_be_bytes())
    }

    fn write_goaway(&mut self, last_good_stream_id: u32, code: ErrorCode) -> io::Result<()> {
        FrameHeader {
            length: 8,
            frame_type: frame::TYPE_GOAWAY,
            flags: frame::FLAG_NONE,
            stream_id: 0,
        }
        .write_to(&mut self.sink)?;
        self.sink.write_all(&last_good_stream_id.to_be_bytes())?;
        self.sink.write_all(&code.as_u32().to_be_bytes())
    }

    fn write_window_update(&mut self, stream_id: u32, delta: u32) -> io::Result<()> {
        FrameHeader {
            length: 4,
            frame_type: frame::TYPE_WINDOW_UPDATE,
            flags: frame::FLAG_NONE,
            stream_id,
        }
        .write_to(&mut self.sink)?;
        self.sink.write_all(&delta.to_be_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}
