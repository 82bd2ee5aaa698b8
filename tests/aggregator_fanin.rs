//! Fan-in behaviour against scripted mock aggregators.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use grail_client::wire::aggregator as codec;
use grail_client::{AggregatorConfig, Endpoint, Sample, SolverAggregator, Subscription, SubscriptionRule, Transmitter};

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

fn subscription(interval: u64) -> Subscription {
    Subscription {
        physical_layer: 1,
        rules: vec![SubscriptionRule {
            transmitters: vec![Transmitter {
                base_id: 7,
                mask: u64::MAX,
            }],
            update_interval: interval,
        }],
    }
}

fn sample(tx_id: u64, valid: bool) -> Sample {
    Sample {
        physical_layer: 1,
        tx_id,
        rx_id: 100,
        rx_timestamp: 1_700_000_000_000,
        rss: -60.0,
        valid,
        sense_data: Bytes::from_static(b"\x01"),
    }
}

#[test]
fn valid_samples_reach_the_callback_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        echo_handshake(&mut stream);

        let sub_frame = read_frame(&mut stream);
        let sub = codec::decode_subscription_request(&sub_frame).expect("decode subscription");
        write_frame(&mut stream, &codec::encode_subscription_response(&sub));
        write_frame(&mut stream, &codec::encode_sample(&sample(42, true)));
        write_frame(&mut stream, &codec::encode_sample(&sample(43, false)));

        // Hold the connection until the client disconnects.
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let (tx, rx) = mpsc::channel();
    let mut aggregator = SolverAggregator::new(vec![endpoint_of(addr)], move |sample| {
        tx.send(sample).unwrap();
    });
    aggregator.add_rules(subscription(100));

    let got = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert_eq!(got.tx_id, 42);
    assert!(got.valid);

    // The invalid sample is never surfaced.
    assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());

    aggregator.disconnect();
    server.join().unwrap();
}

#[test]
fn handshake_mismatch_kills_the_worker_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&[0u8; 16]).unwrap();
        drop(stream);

        // A retrying worker would reconnect after roughly a second; a dead
        // one never comes back.
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let deadline = Instant::now() + Duration::from_millis(1_800);
        while Instant::now() < deadline {
            match listener.accept() {
                Ok(_) => panic!("worker reconnected after handshake mismatch"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
    });

    let (tx, rx) = mpsc::channel();
    let mut aggregator = SolverAggregator::new(vec![endpoint_of(addr)], move |sample| {
        tx.send(sample).unwrap();
    });
    aggregator.add_rules(subscription(100));

    server.join().unwrap();
    assert!(rx.try_recv().is_err(), "no callback after failed handshake");

    let start = Instant::now();
    aggregator.disconnect();
    assert!(start.elapsed() < Duration::from_secs(2), "disconnect hung");
}

#[test]
fn appended_rules_are_sent_to_a_live_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        echo_handshake(&mut stream);
        for _ in 0..2 {
            let frame = read_frame(&mut stream);
            let sub = codec::decode_subscription_request(&frame).unwrap();
            seen_tx.send(sub).unwrap();
        }
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let mut aggregator = SolverAggregator::new(vec![endpoint_of(addr)], |_| {});
    aggregator.add_rules(subscription(100));

    let first = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.rules[0].update_interval, 100);

    aggregator.add_rules(subscription(200));
    let second = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.rules[0].update_interval, 200);

    aggregator.disconnect();
    server.join().unwrap();
}

#[test]
fn update_rules_reconnects_with_only_the_new_list() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        // First connection sees the original rule.
        {
            let (mut stream, _) = listener.accept().unwrap();
            echo_handshake(&mut stream);
            let frame = read_frame(&mut stream);
            seen_tx
                .send(codec::decode_subscription_request(&frame).unwrap())
                .unwrap();
            // Wait for the client to drop the connection.
            let mut scratch = [0u8; 16];
            let _ = stream.read(&mut scratch);
        }
        // Second connection sees only the replacement.
        let (mut stream, _) = listener.accept().unwrap();
        echo_handshake(&mut stream);
        let frame = read_frame(&mut stream);
        seen_tx
            .send(codec::decode_subscription_request(&frame).unwrap())
            .unwrap();
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let mut aggregator = SolverAggregator::new(vec![endpoint_of(addr)], |_| {});
    aggregator.add_rules(subscription(100));
    assert_eq!(
        seen_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .rules[0]
            .update_interval,
        100
    );

    aggregator.update_rules(subscription(300));
    assert_eq!(
        seen_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .rules[0]
            .update_interval,
        300
    );
    assert!(seen_rx.try_recv().is_err(), "old rule was replayed");

    aggregator.disconnect();
    server.join().unwrap();
}

#[test]
fn transport_failure_reconnects_and_replays_every_rule() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        // First session is dropped right after the subscription arrives.
        {
            let (mut stream, _) = listener.accept().unwrap();
            echo_handshake(&mut stream);
            let _ = read_frame(&mut stream);
        }
        // The worker reconnects and replays from the start of the list.
        let (mut stream, _) = listener.accept().unwrap();
        echo_handshake(&mut stream);
        let frame = read_frame(&mut stream);
        seen_tx
            .send(codec::decode_subscription_request(&frame).unwrap())
            .unwrap();
        let mut scratch = [0u8; 16];
        let _ = stream.read(&mut scratch);
    });

    let config = AggregatorConfig {
        reconnect_delay_ms: 200,
        ..AggregatorConfig::default()
    };
    let mut aggregator =
        SolverAggregator::with_config(vec![endpoint_of(addr)], |_| {}, config);
    aggregator.add_rules(subscription(100));

    let replayed = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(replayed.rules[0].update_interval, 100);

    aggregator.disconnect();
    server.join().unwrap();
}
