//! Rate cap (S3): a connection with a capped outbound rate delivers roughly that many
//! bytes per second to its peer, never the unbounded line rate.

mod support;

use gne::packet::CustomPacket;
use gne::{Connection, ConnectionParams, GameInfo, ServerListener};

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use support::{Event, RecordingFactory, RecordingListener};

const TIMEOUT: Duration = Duration::from_secs(2);
const TARGET_RATE: u64 = 10_000;
const PACKET_BYTES: usize = 400;
const WINDOW: Duration = Duration::from_secs(5);

#[test]
fn capped_outbound_rate_limits_bytes_delivered_over_a_window() {
    let game = GameInfo::new("rate-cap-test", 1);

    let (mut factory, success_rx, _failure_rx, listener_rx) = RecordingFactory::new();
    factory.out_rate = TARGET_RATE;
    let server = ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), game.clone(), false, Box::new(factory))
        .expect("server failed to bind");

    let (client_listener, client_rx) = RecordingListener::channel();
    let client = Connection::connect(server.local_addr(), &game, ConnectionParams::new(client_listener))
        .expect("client failed to connect");

    let server_conn = success_rx.recv_timeout(TIMEOUT).expect("server never accepted the connection");
    let _server_rx = listener_rx.recv_timeout(TIMEOUT).expect("server never handed back a listener channel");
    assert_eq!(server_conn.effective_out_rate(), TARGET_RATE);

    let deadline = Instant::now() + WINDOW;
    while Instant::now() < deadline {
        let _ = server_conn.send_reliable(Box::new(CustomPacket::new(vec![0u8; PACKET_BYTES])));
    }

    let mut received_bytes: u64 = 0;
    loop {
        match client_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Event::Receive(payloads)) => {
                for payload in payloads {
                    received_bytes += payload.len() as u64;
                }
            }
            _ => break,
        }
    }

    assert!(
        received_bytes >= 45_000 && received_bytes <= 55_000,
        "expected roughly 45kB-55kB over a 5s window capped at {TARGET_RATE} B/s, got {received_bytes}"
    );

    client.disconnect();
    server.shutdown();
}
