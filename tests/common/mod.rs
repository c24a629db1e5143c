//! Shared helpers for the integration tests: loopback connection pairs and
//! a configuration tuned for fast test runs.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use secure_channel::{Connection, ConnectionConfig, ConnectionRole, InlineExecutor};

/// Fast handshakes (smaller modulus), snappy reader ticks, and a key age
/// long enough that no rekey fires unless a test asks for one.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::default_with_overrides(|c| {
        c.rsa_bits = 1536;
        c.read_timeout = Duration::from_millis(50);
        c.write_timeout = Duration::from_millis(500);
        c.max_key_age = Duration::from_secs(600);
        c.max_age_skew = Duration::from_secs(60);
    })
}

/// A connected pair of channels over loopback TCP.
pub fn pair(config: ConnectionConfig) -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let server_config = config.clone();
    let server = thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        Connection::wrap_with(
            socket,
            ConnectionRole::Responder,
            server_config,
            Arc::new(InlineExecutor),
        )
        .expect("responder wrap")
    });

    let client = Connection::connect_to_with(addr, config, Arc::new(InlineExecutor))
        .expect("initiator connect");
    (client, server.join().expect("responder thread"))
}

/// An accept handle plus the address to dial, for fake-peer tests.
pub fn raw_listener() -> (thread::JoinHandle<TcpStream>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let accept = thread::spawn(move || listener.accept().expect("accept").0);
    (accept, addr)
}

/// Poll until `predicate` holds or the deadline passes.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
