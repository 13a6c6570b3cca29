mod common;

use common::*;
use netmgr_transport::{NetError, NmHandle};
use rand::Rng;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn test_hello_ok() {
    let mgr = manager(2);
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            |handle, msg| {
                if msg == Ok(&b"hello"[..]) {
                    handle.send(&b"ok"[..], |_, _| {});
                }
            },
            |_, _| Ok(()),
            10,
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    mgr.connect_tcpdns(
        None,
        listener.local_addr(),
        move |res| {
            let handle = res.unwrap();
            handle.read(move |_, msg| {
                let _ = tx.send(msg.map(|m| m.to_vec()));
            });
            handle.send(&b"hello"[..], |_, _| {});
        },
        WAIT,
    );

    assert_eq!(recv(&rx), Ok(b"ok".to_vec()));
    // One message per read on the client side
    assert_quiet(&rx);
}

#[test]
fn test_split_message_delivered_once() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            move |_, msg| {
                let _ = tx.send(msg.map(|m| m.to_vec()));
            },
            |_, _| Ok(()),
            10,
            None,
        )
        .unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.set_nodelay(true).unwrap();
    for chunk in [&[0x00][..], &[0x05, b'h', b'e'][..], &b"llo"[..]] {
        client.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(recv(&rx), Ok(b"hello".to_vec()));
    assert_quiet(&rx);
}

#[test]
fn test_truncated_message_is_eof() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            move |_, msg| {
                let _ = tx.send(msg.map(|m| m.len()));
            },
            |_, _| Ok(()),
            10,
            None,
        )
        .unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.write_all(&[0xFF, 0xFF]).unwrap();
    client.write_all(&[0u8; 10]).unwrap();
    drop(client);

    let err = recv(&rx).unwrap_err();
    assert!(err.is_eof_class(), "unexpected error {:?}", err);
}

#[test]
fn test_pipelined_messages_in_order() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            move |handle, msg| {
                if let Ok(msg) = msg {
                    let _ = tx.send(msg.to_vec());
                    handle.send(msg.to_vec(), |_, _| {});
                }
            },
            |_, _| Ok(()),
            10,
            None,
        )
        .unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client
        .write_all(&[0, 1, b'a', 0, 2, b'b', b'b', 0, 0, 0, 1, b'c'])
        .unwrap();

    assert_eq!(recv(&rx), b"a");
    assert_eq!(recv(&rx), b"bb");
    assert_eq!(recv(&rx), b"");
    assert_eq!(recv(&rx), b"c");

    // Replies come back framed, in order
    let mut reply = [0u8; 12];
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0, 1, b'a', 0, 2, b'b', b'b', 0, 0, 0, 1, b'c']);
}

#[test]
fn test_sequential_waits_for_handle_release() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let held: Arc<Mutex<Vec<NmHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let store = held.clone();
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            move |handle, msg| {
                if let Ok(msg) = msg {
                    store.lock().unwrap().push(handle.clone());
                    let _ = tx.send(msg.to_vec());
                }
            },
            |handle, _| {
                handle.sequential();
                Ok(())
            },
            10,
            None,
        )
        .unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.write_all(&[0, 3, b'o', b'n', b'e', 0, 3, b't', b'w', b'o']).unwrap();

    assert_eq!(recv(&rx), b"one");
    assert_quiet(&rx);

    held.lock().unwrap().clear();
    assert_eq!(recv(&rx), b"two");
}

#[test]
fn test_zone_transfer_not_permitted() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            |_, _| {},
            move |handle, _| {
                let _ = tx.lock().unwrap().send(handle.xfr_check_perm());
                Ok(())
            },
            10,
            None,
        )
        .unwrap();

    let _client = TcpStream::connect(listener.local_addr()).unwrap();
    assert_eq!(recv(&rx), Err(NetError::NoPermission));
}

#[test]
fn test_rejected_by_accept_callback() {
    let mgr = manager(1);
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            |_, _| {},
            |_, _| Err(NetError::NoPermission),
            10,
            None,
        )
        .unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    // Closed by the server without a reply
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    eventually(|| mgr.stats().accepted == 1);
}

#[test]
fn test_random_read_boundaries() {
    let mgr = manager(1);
    let (tx, rx) = mpsc::channel();
    let listener = mgr
        .listen_tcpdns(
            localhost(),
            move |_, msg| {
                if let Ok(msg) = msg {
                    let _ = tx.send(msg.to_vec());
                }
            },
            |_, _| Ok(()),
            10,
            None,
        )
        .unwrap();

    let mut rng = rand::thread_rng();
    let messages: Vec<Vec<u8>> = (0..20)
        .map(|i| (0..rng.gen_range(0..600)).map(|j| (i + j) as u8).collect())
        .collect();
    let mut stream = Vec::new();
    for msg in &messages {
        stream.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        stream.extend_from_slice(msg);
    }

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.set_nodelay(true).unwrap();
    let mut rest = &stream[..];
    while !rest.is_empty() {
        let n = rng.gen_range(1..=rest.len().min(97));
        client.write_all(&rest[..n]).unwrap();
        rest = &rest[n..];
        if rng.gen_bool(0.2) {
            thread::sleep(Duration::from_millis(2));
        }
    }

    for msg in &messages {
        assert_eq!(&recv(&rx), msg);
    }
    assert_quiet(&rx);
}
