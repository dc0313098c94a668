//! Handshake-refusal scenarios (S2 in the design notes): a version mismatch must be
//! reported to the *client* in the direction that actually matches who is behind, not
//! just "refused", and the server's one-directional minor-version compatibility check
//! (accept anything <= its own minor, refuse only a newer peer) must hold in both
//! directions of mismatch.

mod support;

use gne::connection::ProtocolVersion;
use gne::{Connection, ConnectionParams, ErrorKind, GameInfo, ServerListener};

use std::net::Ipv4Addr;
use std::time::Duration;

use support::RecordingFactory;

const TIMEOUT: Duration = Duration::from_secs(2);

fn protocol(minor: u8) -> ProtocolVersion {
    let mut p = ProtocolVersion::CURRENT;
    p.minor = minor;
    p
}

fn protocol_major(major: u8) -> ProtocolVersion {
    let mut p = ProtocolVersion::CURRENT;
    p.major = major;
    p
}

#[test]
fn client_newer_than_server_sees_peer_as_behind() {
    let server_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol(0));
    let (factory, _success_rx, failure_rx, _listener_rx) = RecordingFactory::new();
    let server =
        ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), server_game, false, Box::new(factory)).unwrap();

    let client_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol(5));
    let (client_listener, _client_rx) = support::RecordingListener::channel();
    let result = Connection::connect(server.local_addr(), &client_game, ConnectionParams::new(client_listener));

    let error = result.expect_err("connect should have been refused on version mismatch");
    assert_eq!(error.kind(), ErrorKind::GNETheirVersionLow);

    let (server_error, _from) =
        failure_rx.recv_timeout(TIMEOUT).expect("server never reported the failed handshake");
    assert_eq!(server_error.kind(), ErrorKind::GNETheirVersionHigh);
    server.shutdown();
}

#[test]
fn client_with_an_older_minor_is_accepted() {
    // The server tolerates any peer minor <= its own (backward compatibility); only a
    // peer *newer* than the server is refused. A lower client minor is not a mismatch.
    let server_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol(5));
    let (factory, success_rx, _failure_rx, _listener_rx) = RecordingFactory::new();
    let server =
        ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), server_game, false, Box::new(factory)).unwrap();

    let client_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol(0));
    let (client_listener, _client_rx) = support::RecordingListener::channel();
    let client = Connection::connect(server.local_addr(), &client_game, ConnectionParams::new(client_listener))
        .expect("an older minor version should be accepted");

    success_rx.recv_timeout(TIMEOUT).expect("server never accepted the connection");
    client.disconnect();
    server.shutdown();
}

#[test]
fn mismatched_major_version_refuses_regardless_of_direction() {
    let server_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol_major(2));
    let (factory, _success_rx, failure_rx, _listener_rx) = RecordingFactory::new();
    let server =
        ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), server_game, false, Box::new(factory)).unwrap();

    let client_game = GameInfo::new("version-mismatch-test", 1).with_protocol(protocol_major(1));
    let (client_listener, _client_rx) = support::RecordingListener::channel();
    let result = Connection::connect(server.local_addr(), &client_game, ConnectionParams::new(client_listener));

    let error = result.expect_err("connect should have been refused on major version mismatch");
    assert_eq!(error.kind(), ErrorKind::GNETheirVersionHigh);

    let (server_error, _from) =
        failure_rx.recv_timeout(TIMEOUT).expect("server never reported the failed handshake");
    assert_eq!(server_error.kind(), ErrorKind::GNETheirVersionLow);
    server.shutdown();
}

#[test]
fn mismatched_game_name_is_refused_with_wrong_game() {
    let server_game = GameInfo::new("real-game", 1);
    let (factory, _success_rx, failure_rx, _listener_rx) = RecordingFactory::new();
    let server =
        ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), server_game, false, Box::new(factory)).unwrap();

    let client_game = GameInfo::new("wrong-game", 1);
    let (client_listener, _client_rx) = support::RecordingListener::channel();
    let result = Connection::connect(server.local_addr(), &client_game, ConnectionParams::new(client_listener));

    let error = result.expect_err("connect should have been refused on game name mismatch");
    assert_eq!(error.kind(), ErrorKind::WrongGame);

    failure_rx.recv_timeout(TIMEOUT).expect("server never reported the failed handshake");
    server.shutdown();
}

#[test]
fn mismatched_user_version_is_refused_with_user_version_mismatch() {
    let server_game = GameInfo::new("user-version-test", 1);
    let (factory, _success_rx, failure_rx, _listener_rx) = RecordingFactory::new();
    let server =
        ServerListener::bind((Ipv4Addr::LOCALHOST, 0).into(), server_game, false, Box::new(factory)).unwrap();

    let client_game = GameInfo::new("user-version-test", 2);
    let (client_listener, _client_rx) = support::RecordingListener::channel();
    let result = Connection::connect(server.local_addr(), &client_game, ConnectionParams::new(client_listener));

    let error = result.expect_err("connect should have been refused on user version mismatch");
    assert_eq!(error.kind(), ErrorKind::UserVersionMismatch);

    failure_rx.recv_timeout(TIMEOUT).expect("server never reported the failed handshake");
    server.shutdown();
}
