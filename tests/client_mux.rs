//! Request multiplexer behaviour against a scripted mock world model.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use grail_client::wire::client as codec;
use grail_client::wire::client::{AliasedAttribute, AliasedWorldData};
use grail_client::{ClientWorldConnection, Endpoint, MuxConfig, RequestError};

fn endpoint_of(addr: SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port())
}

fn echo_handshake(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).expect("read handshake");
    stream.write_all(&buf).expect("echo handshake");
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("read frame header");
    let len = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("read frame body");
    body
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) {
    let mut buf = (body.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(body);
    stream.write_all(&buf).expect("write frame");
}

fn accept_client(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().expect("accept client");
    echo_handshake(&mut stream);
    stream
}

fn world_data(uri: &str, name_alias: u32, origin_alias: u32) -> AliasedWorldData {
    AliasedWorldData {
        object_uri: uri.into(),
        attributes: vec![AliasedAttribute {
            name_alias,
            creation_date: 10,
            expiration_date: 0,
            origin_alias,
            data: Bytes::from_static(b"\x01\x02"),
        }],
    }
}

#[test]
fn snapshot_accumulates_until_request_complete() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        let frame = read_frame(&mut stream);
        let (request, ticket) = codec::decode_snapshot_request(&frame).unwrap();
        assert_eq!(request.object_uri, "room/.*");
        assert_eq!(ticket, 0);

        write_frame(
            &mut stream,
            &codec::encode_attribute_alias(&[(1, "location".into())]),
        );
        write_frame(
            &mut stream,
            &codec::encode_origin_alias(&[(1, "solver/a".into())]),
        );
        write_frame(
            &mut stream,
            &codec::encode_data_response(&world_data("room/1", 1, 1), ticket),
        );
        write_frame(
            &mut stream,
            &codec::encode_data_response(&world_data("room/2", 1, 1), ticket),
        );
        write_frame(&mut stream, &codec::encode_request_complete(ticket));

        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    let response = connection.current_snapshot("room/.*".into(), vec!["location".into()]);
    let state = response.get().expect("snapshot result");

    assert_eq!(state.len(), 2);
    let attrs = &state["room/1"];
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].name, "location");
    assert_eq!(attrs[0].origin, "solver/a");

    drop(connection);
    server.join().unwrap();
}

#[test]
fn interleaved_streams_demultiplex_by_ticket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);

        let (_, t0) = codec::decode_stream_request(&read_frame(&mut stream)).unwrap();
        let (_, t1) = codec::decode_stream_request(&read_frame(&mut stream)).unwrap();
        assert_eq!((t0, t1), (0, 1));

        write_frame(
            &mut stream,
            &codec::encode_attribute_alias(&[(1, "location".into())]),
        );
        write_frame(
            &mut stream,
            &codec::encode_origin_alias(&[(1, "solver/a".into())]),
        );

        // T0, T1, T0, T1, complete(T0), T1, complete(T1)
        write_frame(&mut stream, &codec::encode_data_response(&world_data("a/1", 1, 1), t0));
        write_frame(&mut stream, &codec::encode_data_response(&world_data("b/1", 1, 1), t1));
        write_frame(&mut stream, &codec::encode_data_response(&world_data("a/2", 1, 1), t0));
        write_frame(&mut stream, &codec::encode_data_response(&world_data("b/2", 1, 1), t1));
        write_frame(&mut stream, &codec::encode_request_complete(t0));
        write_frame(&mut stream, &codec::encode_data_response(&world_data("b/3", 1, 1), t1));
        write_frame(&mut stream, &codec::encode_request_complete(t1));

        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    let mut s0 = connection.stream("a/.*".into(), vec!["location".into()], 100);
    let mut s1 = connection.stream("b/.*".into(), vec!["location".into()], 100);

    let first = s0.next().unwrap();
    assert!(first.contains_key("a/1"));
    let second = s0.next().unwrap();
    assert!(second.contains_key("a/2"));
    let end = s0.next().unwrap();
    assert!(end.is_empty());
    assert!(s0.is_complete());
    assert!(matches!(s0.next(), Err(RequestError::Exhausted)));

    for expected in ["b/1", "b/2", "b/3"] {
        let state = s1.next().unwrap();
        assert!(state.contains_key(expected), "missing {expected}");
    }
    assert!(s1.next().unwrap().is_empty());
    assert!(s1.is_complete());

    drop(s0);
    drop(s1);
    drop(connection);
    server.join().unwrap();
}

#[test]
fn unannounced_aliases_resolve_to_empty_names() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        let (_, ticket) = codec::decode_snapshot_request(&read_frame(&mut stream)).unwrap();
        write_frame(
            &mut stream,
            &codec::encode_data_response(&world_data("room/1", 99, 98), ticket),
        );
        write_frame(&mut stream, &codec::encode_request_complete(ticket));
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    let state = connection
        .current_snapshot("room/.*".into(), vec![])
        .get()
        .unwrap();

    let attrs = &state["room/1"];
    assert_eq!(attrs[0].name, "");
    assert_eq!(attrs[0].origin, "");

    drop(connection);
    server.join().unwrap();
}

#[test]
fn peer_close_fails_every_live_ticket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        for _ in 0..3 {
            let _ = read_frame(&mut stream);
        }
        drop(stream);
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    let mut s0 = connection.stream("a".into(), vec![], 100);
    let mut s1 = connection.stream("b".into(), vec![], 100);
    let mut s2 = connection.stream("c".into(), vec![], 100);
    server.join().unwrap();

    for handle in [&mut s0, &mut s1, &mut s2] {
        assert_eq!(handle.next(), Err(RequestError::ConnectionClosed));
        assert!(handle.is_error());
    }
}

#[test]
fn tickets_increase_and_slots_release_on_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        let mut tickets = Vec::new();
        for _ in 0..2 {
            let (_, ticket) = codec::decode_snapshot_request(&read_frame(&mut stream)).unwrap();
            tickets.push(ticket);
        }
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
        tickets
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));

    let first = connection.current_snapshot("a".into(), vec![]);
    assert_eq!(connection.pending_requests(), 1);
    drop(first);
    assert_eq!(connection.pending_requests(), 0);

    // The released ticket is never reused.
    let second = connection.current_snapshot("b".into(), vec![]);
    assert_eq!(connection.pending_requests(), 1);
    drop(second);

    drop(connection);
    assert_eq!(server.join().unwrap(), vec![0, 1]);
}

#[test]
fn request_timeout_bounds_get() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        // Read the request, then never answer it.
        let _ = read_frame(&mut stream);
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let config = MuxConfig {
        request_timeout_ms: Some(200),
        ..MuxConfig::default()
    };
    let connection = ClientWorldConnection::with_config(endpoint_of(addr), config);
    let response = connection.current_snapshot("a".into(), vec![]);
    assert_eq!(response.get(), Err(RequestError::Timeout));

    drop(connection);
    server.join().unwrap();
}

#[test]
fn unreachable_world_model_yields_sticky_not_connected() {
    // Reserve an address, then free it so connects are refused.
    let placeholder = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    assert!(!connection.connected());

    let response = connection.current_snapshot("a".into(), vec![]);
    assert!(response.is_error());
    assert_eq!(response.get(), Err(RequestError::NotConnected));
}

#[test]
fn dropping_the_connection_poisons_outstanding_handles() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_client(&listener);
        let _ = read_frame(&mut stream);
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let connection = ClientWorldConnection::new(endpoint_of(addr));
    let mut pending = connection.stream("a".into(), vec![], 100);
    drop(connection);
    server.join().unwrap();

    assert_eq!(pending.next(), Err(RequestError::Destroyed));
}
