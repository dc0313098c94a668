//! Shared black-box test harness: a [`gne::Listener`] that forwards every callback
//! over a channel so a test can assert on ordering without racing the event thread.

#![allow(dead_code)]

use gne::error::Error;
use gne::{Connection, ConnectionFactory, ConnectionParams, Feeder, Listener};

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum Event {
    Connect,
    NewConn,
    ConnectFailure(Error),
    Receive(Vec<Vec<u8>>),
    Error(Error),
    Failure(Error),
    Exit,
    Timeout,
    Disconnect,
    DoneWriting,
}

/// Drains every `CustomPacket` currently queued on `conn` into raw byte vectors.
fn drain_custom_payloads(conn: &Arc<Connection>) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    while let Some(received) = conn.receive() {
        if let Some(custom) = received.packet.as_any().downcast_ref::<gne::packet::CustomPacket>() {
            payloads.push(custom.payload.0.clone());
        }
    }
    payloads
}

/// A [`Listener`] that reports every callback it receives on an `mpsc` channel, for
/// tests to assert on ordering and payloads from outside the event thread.
pub struct RecordingListener {
    tx: Sender<Event>,
}

impl RecordingListener {
    pub fn channel() -> (Box<dyn Listener>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(RecordingListener { tx }), rx)
    }
}

impl Listener for RecordingListener {
    fn on_connect(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::Connect);
    }
    fn on_new_conn(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::NewConn);
    }
    fn on_connect_failure(&mut self, error: &Error) {
        let _ = self.tx.send(Event::ConnectFailure(error.clone()));
    }
    fn on_receive(&mut self, conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::Receive(drain_custom_payloads(conn)));
    }
    fn on_error(&mut self, _conn: &Arc<Connection>, error: &Error) {
        let _ = self.tx.send(Event::Error(error.clone()));
    }
    fn on_failure(&mut self, _conn: &Arc<Connection>, error: &Error) {
        let _ = self.tx.send(Event::Failure(error.clone()));
    }
    fn on_exit(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::Exit);
    }
    fn on_timeout(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::Timeout);
    }
    fn on_disconnect(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::Disconnect);
    }
    fn on_done_writing(&mut self, _conn: &Arc<Connection>) {
        let _ = self.tx.send(Event::DoneWriting);
    }
}

pub fn recv_within(rx: &Receiver<Event>, timeout: Duration) -> Event {
    rx.recv_timeout(timeout).expect("expected event never arrived")
}

/// A [`ConnectionFactory`] that always hands out the same listener/rate template and
/// forwards `on_listen_success`/`on_listen_failure` over a channel.
///
/// `feeder_factory`, if set, is called once per accepted connection to produce a
/// `(feeder, low_packet_threshold)` pair installed on that connection's
/// `ConnectionParams` before the handshake runs — a feeder can only be wired in at
/// construction time, not bolted on afterwards with a meaningful threshold.
pub struct RecordingFactory {
    pub out_rate: u64,
    pub in_rate: u64,
    pub low_packet_threshold: usize,
    pub success_tx: Sender<Arc<Connection>>,
    pub failure_tx: Sender<(Error, SocketAddr)>,
    pub listener_tx: Sender<Receiver<Event>>,
    pub feeder_factory: Option<Box<dyn FnMut() -> (Box<dyn Feeder>, usize) + Send>>,
}

impl RecordingFactory {
    pub fn new() -> (Self, Receiver<Arc<Connection>>, Receiver<(Error, SocketAddr)>, Receiver<Receiver<Event>>) {
        let (success_tx, success_rx) = mpsc::channel();
        let (failure_tx, failure_rx) = mpsc::channel();
        let (listener_tx, listener_rx) = mpsc::channel();
        (
            Self {
                out_rate: 0,
                in_rate: 0,
                low_packet_threshold: 0,
                success_tx,
                failure_tx,
                listener_tx,
                feeder_factory: None,
            },
            success_rx,
            failure_rx,
            listener_rx,
        )
    }
}

impl ConnectionFactory for RecordingFactory {
    fn get_new_connection_params(&mut self, _from: SocketAddr) -> ConnectionParams {
        let (listener, rx) = RecordingListener::channel();
        let _ = self.listener_tx.send(rx);
        let mut params = ConnectionParams::new(listener).with_rates(self.out_rate, self.in_rate);
        params.low_packet_threshold = self.low_packet_threshold;
        match &mut self.feeder_factory {
            Some(make_feeder) => {
                let (feeder, threshold) = make_feeder();
                params.with_feeder(feeder, threshold)
            }
            None => params,
        }
    }
    fn on_listen_success(&mut self, conn: &Arc<Connection>) {
        let _ = self.success_tx.send(conn.clone());
    }
    fn on_listen_failure(&mut self, error: &Error, from: SocketAddr) {
        let _ = self.failure_tx.send((error.clone(), from));
    }
}
