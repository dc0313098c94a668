//! End-to-end test with a single client and a single server connection, covering the
//! "hello" scenario: connect, exchange a custom packet in both directions, then
//! disconnect gracefully and observe the exit/disconnect sequence on both sides.

mod support;

use gne::packet::CustomPacket;
use gne::{Connection, ConnectionParams, ConnectionState, GameInfo, ServerListener};

use std::net::Ipv4Addr;
use std::time::Duration;

use support::{recv_within, Event, RecordingFactory, RecordingListener};

const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn single_client_connects_exchanges_packets_and_disconnects_gracefully() {
    let game = GameInfo::new("single-client-test", 1);

    let (factory, success_rx, _failure_rx, listener_rx) = RecordingFactory::new();
    let server = ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), game.clone(), false, Box::new(factory))
        .expect("server failed to bind");

    let (client_listener, client_rx) = RecordingListener::channel();
    let client = Connection::connect(server.local_addr(), &game, ConnectionParams::new(client_listener))
        .expect("client failed to connect");
    assert_eq!(client.state(), ConnectionState::Connected);

    let server_conn = success_rx.recv_timeout(TIMEOUT).expect("server never accepted the connection");
    let server_rx = listener_rx.recv_timeout(TIMEOUT).expect("server never handed back a listener channel");
    assert_eq!(server_conn.state(), ConnectionState::Connected);

    client
        .send_reliable(Box::new(CustomPacket::new(vec![0xDE, 0xAD, 0xBE, 0xEF])))
        .expect("client send failed");

    match recv_within(&server_rx, TIMEOUT) {
        Event::Receive(payloads) => assert_eq!(payloads, vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]),
        other => panic!("expected a Receive event, got {other:?}"),
    }

    server_conn
        .send_reliable(Box::new(CustomPacket::new(vec![0xCA, 0xFE])))
        .expect("server send failed");

    match recv_within(&client_rx, TIMEOUT) {
        Event::Receive(payloads) => assert_eq!(payloads, vec![vec![0xCA, 0xFE]]),
        other => panic!("expected a Receive event, got {other:?}"),
    }

    client.disconnect();

    assert!(matches!(recv_within(&client_rx, TIMEOUT), Event::Exit));
    assert!(matches!(recv_within(&client_rx, TIMEOUT), Event::Disconnect));
    assert!(matches!(recv_within(&server_rx, TIMEOUT), Event::Exit));
    assert!(matches!(recv_within(&server_rx, TIMEOUT), Event::Disconnect));

    server.shutdown();
}
