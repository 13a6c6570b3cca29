//! Shared helpers for the transport integration tests.

#![allow(dead_code)]

use netmgr_transport::{NetConfig, NetManager, TlsClientCtx, TlsServerCtx};
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

pub const CA: &[u8] = include_bytes!("../certs/ca.pem");
pub const OTHER_CA: &[u8] = include_bytes!("../certs/other-ca.pem");
pub const CERT: &[u8] = include_bytes!("../certs/server.pem");
pub const KEY: &[u8] = include_bytes!("../certs/server-key.pem");

/// Upper bound for anything that is expected to happen
pub const WAIT: Duration = Duration::from_secs(10);

/// How long to watch for something that must not happen
pub const QUIET: Duration = Duration::from_millis(300);

pub fn manager(workers: usize) -> NetManager {
    NetManager::new(NetConfig::default().with_workers(workers)).unwrap()
}

/// Manager with one `SO_REUSEPORT` listener socket per worker
pub fn balanced_manager(workers: usize) -> NetManager {
    let mut config = NetConfig::default().with_workers(workers);
    config.load_balance_sockets = true;
    NetManager::new(config).unwrap()
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Address nothing listens on
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn server_ctx() -> TlsServerCtx {
    TlsServerCtx::from_pem(CERT, KEY).unwrap()
}

pub fn client_ctx(dot: bool) -> TlsClientCtx {
    TlsClientCtx::from_pem(CA, dot).unwrap()
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(WAIT).expect("timed out waiting for callback")
}

/// Assert nothing arrives for a while; a dropped sender counts as quiet
pub fn assert_quiet<T: std::fmt::Debug>(rx: &Receiver<T>) {
    match rx.recv_timeout(QUIET) {
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}

/// Poll `cond` until it holds
pub fn eventually(mut cond: impl FnMut() -> bool) {
    let started = Instant::now();
    while !cond() {
        assert!(started.elapsed() < WAIT, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
