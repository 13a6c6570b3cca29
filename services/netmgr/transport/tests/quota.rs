mod common;

use common::*;
use netmgr_transport::Quota;
use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Mutex;

#[test]
fn test_accept_deferred_until_release() {
    let mgr = manager(1);
    let quota = Quota::new(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            |_, _| {},
            move |handle, _| {
                let _ = tx.lock().unwrap().send(handle.peer_addr());
                Ok(())
            },
            10,
            Some(quota.clone()),
        )
        .unwrap();

    let first = TcpStream::connect(listener.local_addr()).unwrap();
    assert_eq!(recv(&rx), first.local_addr().unwrap());
    assert_eq!(quota.in_use(), 1);

    // Sits in the backlog while the only slot is taken
    let second = TcpStream::connect(listener.local_addr()).unwrap();
    assert_quiet(&rx);
    assert!(mgr.stats().quota_deferred >= 1);

    // Closing the first connection hands its slot to the deferred accept
    drop(first);
    assert_eq!(recv(&rx), second.local_addr().unwrap());
    assert_eq!(quota.in_use(), 1);
    assert_eq!(mgr.stats().accepted, 2);
}

#[test]
fn test_stopped_listener_cancels_deferred() {
    let mgr = manager(1);
    let quota = Quota::new(1);
    let listener = mgr
        .listen_tcpdns(localhost(), |_, _| {}, |_, _| Ok(()), 10, Some(quota.clone()))
        .unwrap();

    let first = TcpStream::connect(listener.local_addr()).unwrap();
    eventually(|| quota.in_use() == 1);
    let mut second = TcpStream::connect(listener.local_addr()).unwrap();
    eventually(|| quota.waiting() == 1);

    listener.stop();
    eventually(|| listener.is_closed());
    // The connection keeps its slot; the deferred one is dropped unaccepted
    assert_eq!(quota.in_use(), 1);
    second.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));

    // The abandoned waiter passes the released slot on instead of keeping it
    drop(first);
    eventually(|| quota.in_use() == 0);
    assert_eq!(mgr.stats().accepted, 1);
}

#[test]
fn test_quota_across_balanced_workers() {
    let mgr = balanced_manager(2);
    let quota = Quota::new(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            |_, _| {},
            move |handle, _| {
                let _ = tx.lock().unwrap().send(handle.peer_addr());
                Ok(())
            },
            10,
            Some(quota.clone()),
        )
        .unwrap();

    // Whichever worker the kernel picks, every connection gets through
    for _ in 0..10 {
        let client = TcpStream::connect(listener.local_addr()).unwrap();
        assert_eq!(recv(&rx), client.local_addr().unwrap());
        assert_eq!(quota.in_use(), 1);
        drop(client);
        eventually(|| quota.in_use() == 0);
    }

    // With both workers listening, the second client still waits for the first
    let first = TcpStream::connect(listener.local_addr()).unwrap();
    assert_eq!(recv(&rx), first.local_addr().unwrap());
    let second = TcpStream::connect(listener.local_addr()).unwrap();
    assert_quiet(&rx);
    drop(first);
    assert_eq!(recv(&rx), second.local_addr().unwrap());
    assert_eq!(mgr.stats().accepted, 12);
}
