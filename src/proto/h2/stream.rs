//! A single HTTP/2 stream: state machine, header queue, and flow
//! control, shared between the connection's reader thread and the
//! exchange using the stream.
//!
//! Lock order: a stream's lock is the innermost. Code holding it must
//! not take the connection's state or writer locks; operations that need
//! both observe the stream first, release, then call into the
//! connection.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::trace;

use crate::headers::Headers;

use super::conn::Http2Connection;
use super::HeaderBlock;
use super::frame::ErrorCode;

pub(crate) struct Http2Stream {
    pub(crate) id: u32,
    pub(crate) conn: Arc<Http2Connection>,
    state: Mutex<StreamState>,
    cond: Condvar,
}

struct StreamState {
    /// One entry per HEADERS block received: the response head, then any
    /// interim heads, then trailers. Pseudo-header fields ride along as
    /// plain pairs until the exchange codec splits them out.
    headers_queue: VecDeque<HeaderBlock>,
    read_buffer: VecDeque<Bytes>,
    read_buffer_bytes: u64,
    /// Bytes handed to the application but not yet returned to the peer
    /// via WINDOW_UPDATE.
    unacknowledged_bytes: u64,
    /// END_STREAM received.
    read_finished: bool,
    /// END_STREAM sent.
    write_finished: bool,
    error: Option<ErrorCode>,
    write_bytes_total: u64,
    write_bytes_maximum: i64,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Http2Stream {
    pub(crate) fn new(
        id: u32,
        conn: Arc<Http2Connection>,
        initial_peer_window: u32,
    ) -> Http2Stream {
        Http2Stream {
            id,
            conn,
            state: Mutex::new(StreamState {
                headers_queue: VecDeque::new(),
                read_buffer: VecDeque::new(),
                read_buffer_bytes: 0,
                unacknowledged_bytes: 0,
                read_finished: false,
                write_finished: false,
                error: None,
                write_bytes_total: 0,
                write_bytes_maximum: initial_peer_window as i64,
                read_timeout: None,
                write_timeout: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Client-initiated streams have odd ids.
    pub(crate) fn is_locally_initiated(&self) -> bool {
        self.id % 2 == 1
    }

    pub(crate) fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.read_timeout = read;
        state.write_timeout = write;
    }

    pub(crate) fn error_code(&self) -> Option<ErrorCode> {
        self.state.lock().unwrap().error
    }

    /// True once both directions are done or the stream erred; closed
    /// streams leave the connection's table.
    pub(crate) fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.error.is_some() || (state.read_finished && state.write_finished)
    }

    // ===== reader-thread entry points =====

    pub(crate) fn receive_headers(&self, headers: HeaderBlock, end_stream: bool) {
        let mut state = self.state.lock().unwrap();
        trace!("stream {} received {} headers", self.id, headers.len());
        state.headers_queue.push_back(headers);
        if end_stream {
            state.read_finished = true;
        }
        self.cond.notify_all();
    }

    /// Buffers inbound DATA. Errors with FLOW_CONTROL_ERROR if the peer
    /// overruns `initial_window`.
    pub(crate) fn receive_data(
        &self,
        data: Bytes,
        end_stream: bool,
        initial_window: u32,
    ) -> Result<(), ErrorCode> {
        let mut state = self.state.lock().unwrap();
        let in_window = state.unacknowledged_bytes + state.read_buffer_bytes + data.len() as u64;
        if in_window > initial_window as u64 {
            return Err(ErrorCode::FlowControlError);
        }
        state.read_buffer_bytes += data.len() as u64;
        if !data.is_empty() {
            state.read_buffer.push_back(data);
        }
        if end_stream {
            state.read_finished = true;
        }
        self.cond.notify_all();
        Ok(())
    }

    pub(crate) fn receive_rst(&self, code: ErrorCode) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(code);
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_window_update(&self, delta: u32) {
        let mut state = self.state.lock().unwrap();
        state.write_bytes_maximum += delta as i64;
        self.cond.notify_all();
    }

    /// Applies a SETTINGS_INITIAL_WINDOW_SIZE delta; may go negative.
    pub(crate) fn adjust_write_window(&self, delta: i64) {
        let mut state = self.state.lock().unwrap();
        state.write_bytes_maximum += delta;
        if delta > 0 {
            self.cond.notify_all();
        }
    }

    // ===== exchange-side operations =====

    /// Blocks until a HEADERS block is available and pops it.
    pub(crate) fn take_headers(&self) -> crate::Result<HeaderBlock> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.read_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(headers) = state.headers_queue.pop_front() {
                return Ok(headers);
            }
            if let Some(code) = state.error {
                return Err(crate::Error::new_stream_reset(code));
            }
            if state.read_finished {
                return Err(crate::Error::new_protocol(
                    "stream finished without response headers",
                ));
            }
            state = self.wait(state, deadline)?;
        }
    }

    /// Trailers: whatever HEADERS block remains after the body's EOF.
    pub(crate) fn take_trailers(&self) -> crate::Result<Headers> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.error {
            return Err(crate::Error::new_stream_reset(code));
        }
        if !(state.read_finished && state.read_buffer_bytes == 0) {
            return Err(crate::Error::new_protocol(
                "trailers requested before response body was exhausted",
            ));
        }
        let block = state.headers_queue.pop_front().unwrap_or_default();
        super::headers_from_block(&block, false)
    }

    /// Reads buffered body bytes, blocking until data, EOF, or reset.
    /// Returns `(n, window_update_to_send)`.
    fn read_into(&self, buf: &mut [u8]) -> io::Result<(usize, u64)> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.read_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(code) = state.error {
                return Err(crate::Error::new_stream_reset(code).into_io());
            }
            if state.read_buffer_bytes > 0 {
                let mut copied = 0;
                while copied < buf.len() {
                    let mut chunk = match state.read_buffer.pop_front() {
                        Some(c) => c,
                        None => break,
                    };
                    let n = chunk.len().min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&chunk[..n]);
                    copied += n;
                    if n < chunk.len() {
                        let _ = chunk.split_to(n);
                        state.read_buffer.push_front(chunk);
                    }
                }
                state.read_buffer_bytes -= copied as u64;
                state.unacknowledged_bytes += copied as u64;
                let mut ack = 0;
                if state.unacknowledged_bytes >= self.conn.local_initial_window() as u64 / 2 {
                    ack = state.unacknowledged_bytes;
                    state.unacknowledged_bytes = 0;
                }
                return Ok((copied, ack));
            }
            if state.read_finished {
                return Ok((0, 0));
            }
            state = self
                .wait(state, deadline)
                .map_err(|e| e.into_io())?;
        }
    }

    /// Reserves up to `want` bytes of the peer's stream window, blocking
    /// while it is exhausted.
    fn reserve_write_window(&self, want: usize) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.write_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(code) = state.error {
                return Err(crate::Error::new_stream_reset(code).into_io());
            }
            if state.write_finished {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "stream write side closed",
                ));
            }
            let available = state.write_bytes_maximum - state.write_bytes_total as i64;
            if available > 0 {
                let n = (available as u64).min(want as u64) as usize;
                state.write_bytes_total += n as u64;
                return Ok(n);
            }
            state = self
                .wait(state, deadline)
                .map_err(|e| e.into_io())?;
        }
    }

    fn wait<'a>(
        &self,
        state: std::sync::MutexGuard<'a, StreamState>,
        deadline: Option<Instant>,
    ) -> crate::Result<std::sync::MutexGuard<'a, StreamState>> {
        // Callers loop: after a timed-out wait the deadline check above
        // the next wait surfaces the timeout if nothing became available.
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(crate::Error::new_timeout());
                }
                let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                Ok(guard)
            }
            None => Ok(self.cond.wait(state).unwrap()),
        }
    }

    pub(crate) fn mark_write_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_finished = true;
    }
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream").field("id", &self.id).finish()
    }
}

/// Streams a response body off a stream.
pub(crate) struct FramingSource {
    pub(crate) stream: Arc<Http2Stream>,
}

impl Read for FramingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (n, ack) = self.stream.read_into(buf)?;
        if ack > 0 {
            self.stream
                .conn
                .write_stream_window_update(self.stream.id, ack);
        }
        if n == 0 {
            self.stream.conn.stream_finished(&self.stream);
        }
        Ok(n)
    }
}

impl crate::body::BodySource for FramingSource {
    fn trailers(&mut self) -> crate::Result<Headers> {
        self.stream.take_trailers()
    }
}

/// Streams a request body onto a stream.
pub(crate) struct FramingSink {
    pub(crate) stream: Arc<Http2Stream>,
    pub(crate) finished: bool,
}

impl FramingSink {
    /// Sends the final empty DATA frame with END_STREAM.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.stream.mark_write_finished();
        self.stream
            .conn
            .write_data(self.stream.id, true, &[])
            .map_err(|e| e.into_io())?;
        self.stream.conn.stream_finished(&self.stream);
        Ok(())
    }
}

impl Write for FramingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::Other, "sink closed"));
        }
        let mut written = 0;
        while written < buf.len() {
            let n = self.stream.reserve_write_window(buf.len() - written)?;
            self.stream
                .conn
                .write_data(self.stream.id, false, &buf[written..written + n])
                .map_err(|e| e.into_io())?;
            written += n;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.conn.flush().map_err(|e| e.into_io())
    }
}

impl Drop for FramingSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
