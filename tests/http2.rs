//! HTTP/2 end-to-end behavior against a scripted frame-level server.

mod support;

use std::io::{BufReader, Read};
use std::net::TcpStream;

use courier::{Protocol, Request};

use support::*;

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_RST_STREAM: u8 = 0x3;
const TYPE_SETTINGS: u8 = 0x4;
const TYPE_PING: u8 = 0x6;
const TYPE_WINDOW_UPDATE: u8 = 0x8;
const TYPE_CONTINUATION: u8 = 0x9;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// Consumes the connection preface and the client's SETTINGS, sending
/// ours plus the ack. Returns once the client may open streams.
fn h2_handshake(reader: &mut BufReader<TcpStream>, writer: &mut TcpStream) {
    let mut preface = [0u8; 24];
    reader.read_exact(&mut preface).unwrap();
    assert_eq!(&preface[..], H2_PREFACE);

    // Servers speak SETTINGS first.
    write_h2_frame(writer, TYPE_SETTINGS, 0, 0, &[]).unwrap();

    let client_settings = read_h2_frame(reader).unwrap();
    assert_eq!(client_settings.frame_type, TYPE_SETTINGS);
    write_h2_frame(writer, TYPE_SETTINGS, FLAG_ACK, 0, &[]).unwrap();
}

/// Reads frames until the request's HEADERS block completes; answers
/// pings and ignores acks along the way. Returns the stream id.
fn read_request_headers(reader: &mut BufReader<TcpStream>, writer: &mut TcpStream) -> u32 {
    loop {
        let frame = read_h2_frame(reader).unwrap();
        match frame.frame_type {
            TYPE_HEADERS | TYPE_CONTINUATION => {
                if frame.flags & FLAG_END_HEADERS != 0 {
                    return frame.stream_id;
                }
            }
            TYPE_PING if frame.flags & FLAG_ACK == 0 => {
                write_h2_frame(writer, TYPE_PING, FLAG_ACK, 0, &frame.payload).unwrap();
            }
            TYPE_SETTINGS | TYPE_WINDOW_UPDATE => {}
            other => panic!("unexpected frame type before request end: {}", other),
        }
    }
}

#[test]
fn get_over_prior_knowledge() {
    let addr = start_server(|stream| {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        h2_handshake(&mut reader, &mut writer);
        let stream_id = read_request_headers(&mut reader, &mut writer);
        assert_eq!(stream_id % 2, 1, "client streams are odd");

        // `0x88` is the static-table entry for `:status: 200`.
        write_h2_frame(&mut writer, TYPE_HEADERS, FLAG_END_HEADERS, stream_id, &[0x88]).unwrap();
        write_h2_frame(&mut writer, TYPE_DATA, FLAG_END_STREAM, stream_id, b"hello").unwrap();
        // Hold the socket open so the connection can be pooled.
        let mut scratch = [0u8; 64];
        while reader.read(&mut scratch).unwrap_or(0) > 0 {}
    });

    let client = h2_client();
    let request = Request::get(&format!("http://{}/h2", addr)).unwrap();
    let response = client.new_call(request).execute().unwrap();

    assert_eq!(response.code(), 200);
    assert_eq!(response.protocol(), Protocol::H2);
    assert_eq!(response.into_body().string().unwrap(), "hello");
}

#[test]
fn zero_length_data_with_end_stream() {
    let addr = start_server(|stream| {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        h2_handshake(&mut reader, &mut writer);
        let stream_id = read_request_headers(&mut reader, &mut writer);
        write_h2_frame(&mut writer, TYPE_HEADERS, FLAG_END_HEADERS, stream_id, &[0x88]).unwrap();
        write_h2_frame(&mut writer, TYPE_DATA, FLAG_END_STREAM, stream_id, &[]).unwrap();
        let mut scratch = [0u8; 64];
        while reader.read(&mut scratch).unwrap_or(0) > 0 {}
    });

    let client = h2_client();
    let request = Request::get(&format!("http://{}/empty", addr)).unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.into_body().string().unwrap(), "");
}

#[test]
fn headers_split_across_continuation() {
    let addr = start_server(|stream| {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        h2_handshake(&mut reader, &mut writer);
        let stream_id = read_request_headers(&mut reader, &mut writer);

        // :status 200 in HEADERS, a literal x-split: yes continued.
        // Literal header with incremental indexing, raw strings.
        let mut block = vec![0x88];
        block.push(0x40); // literal with indexing, new name
        block.push(0x07);
        block.extend_from_slice(b"x-split");
        block.push(0x03);
        block.extend_from_slice(b"yes");
        let (first, rest) = block.split_at(3);
        write_h2_frame(&mut writer, TYPE_HEADERS, 0, stream_id, first).unwrap();
        write_h2_frame(&mut writer, TYPE_CONTINUATION, FLAG_END_HEADERS, stream_id, rest)
            .unwrap();
        write_h2_frame(&mut writer, TYPE_DATA, FLAG_END_STREAM, stream_id, b"ok").unwrap();
        let mut scratch = [0u8; 64];
        while reader.read(&mut scratch).unwrap_or(0) > 0 {}
    });

    let client = h2_client();
    let request = Request::get(&format!("http://{}/cont", addr)).unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.header("x-split"), Some("yes"));
    assert_eq!(response.into_body().string().unwrap(), "ok");
}

#[test]
fn rst_stream_fails_only_that_call() {
    let addr = start_server(|stream| {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        h2_handshake(&mut reader, &mut writer);

        // First request: reset with CANCEL (0x8).
        let first = read_request_headers(&mut reader, &mut writer);
        write_h2_frame(&mut writer, TYPE_RST_STREAM, 0, first, &8u32.to_be_bytes()).unwrap();

        // Second request on the same connection succeeds.
        let second = read_request_headers(&mut reader, &mut writer);
        assert!(second > first);
        write_h2_frame(&mut writer, TYPE_HEADERS, FLAG_END_HEADERS, second, &[0x88]).unwrap();
        write_h2_frame(&mut writer, TYPE_DATA, FLAG_END_STREAM, second, b"again").unwrap();
        let mut scratch = [0u8; 64];
        while reader.read(&mut scratch).unwrap_or(0) > 0 {}
    });

    let client = h2_client();
    let error = client
        .new_call(Request::get(&format!("http://{}/reset", addr)).unwrap())
        .execute()
        .unwrap_err();
    assert!(error.is_stream_reset(), "{:?}", error);

    let response = client
        .new_call(Request::get(&format!("http://{}/again", addr)).unwrap())
        .execute()
        .unwrap();
    assert_eq!(response.into_body().string().unwrap(), "again");
    // Both calls shared one multiplexed connection.
    assert_eq!(client.connection_count(), 1);
}

#[test]
fn request_body_flows_in_data_frames() {
    let addr = start_server(|stream| {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        h2_handshake(&mut reader, &mut writer);
        let stream_id = read_request_headers(&mut reader, &mut writer);

        // Collect DATA until END_STREAM.
        let mut body = Vec::new();
        loop {
            let frame = read_h2_frame(&mut reader).unwrap();
            match frame.frame_type {
                TYPE_DATA => {
                    body.extend_from_slice(&frame.payload);
                    if frame.flags & FLAG_END_STREAM != 0 {
                        break;
                    }
                }
                TYPE_WINDOW_UPDATE | TYPE_SETTINGS => {}
                other => panic!("unexpected frame during body: {}", other),
            }
        }
        assert_eq!(body, b"posted bytes");

        write_h2_frame(&mut writer, TYPE_HEADERS, FLAG_END_HEADERS, stream_id, &[0x88]).unwrap();
        write_h2_frame(&mut writer, TYPE_DATA, FLAG_END_STREAM, stream_id, b"got it").unwrap();
        let mut scratch = [0u8; 64];
        while reader.read(&mut scratch).unwrap_or(0) > 0 {}
    });

    let client = h2_client();
    let request = Request::builder()
        .url(&format!("http://{}/post", addr))
        .unwrap()
        .post(courier::Body::bytes(Some("text/plain"), "posted bytes"))
        .unwrap()
        .build()
        .unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.into_body().string().unwrap(), "got it");
}
