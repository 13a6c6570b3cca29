mod common;

use common::*;
use netmgr_transport::{NetError, SocketType, TlsClientCtx};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// TLSDNS server answering "hello" with "ok" and reporting each message's
/// zone transfer permission
fn dot_server(
    mgr: &netmgr_transport::NetManager,
) -> (
    netmgr_transport::Listener,
    mpsc::Receiver<netmgr_transport::NetResult<()>>,
) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = mgr
        .listen_tlsdns(
            localhost(),
            move |handle, msg| {
                if msg == Ok(&b"hello"[..]) {
                    let _ = tx.lock().unwrap().send(handle.xfr_check_perm());
                    handle.send(&b"ok"[..], |_, _| {});
                }
            },
            |_, _| Ok(()),
            10,
            None,
            &server_ctx(),
        )
        .unwrap();
    (listener, rx)
}

fn ask(
    mgr: &netmgr_transport::NetManager,
    addr: std::net::SocketAddr,
    ctx: &TlsClientCtx,
) -> mpsc::Receiver<netmgr_transport::NetResult<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    mgr.connect_tlsdns(
        None,
        addr,
        move |res| match res {
            Ok(handle) => {
                assert!(handle.is_tlsdns());
                handle.read(move |_, msg| {
                    let _ = tx.send(msg.map(|m| m.to_vec()));
                });
                handle.send(&b"hello"[..], |_, _| {});
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        },
        WAIT,
        ctx,
    );
    rx
}

#[test]
fn test_tlsdns_hello_ok() {
    let mgr = manager(2);
    let (listener, perm) = dot_server(&mgr);
    assert_eq!(listener.socket_type(), SocketType::TlsDnsListener);

    let rx = ask(&mgr, listener.local_addr(), &client_ctx(true));
    assert_eq!(recv(&rx), Ok(b"ok".to_vec()));
    assert_eq!(recv(&perm), Ok(()));
}

#[test]
fn test_tlsdns_without_alpn() {
    let mgr = manager(1);
    let (listener, perm) = dot_server(&mgr);

    // Messages still flow, zone transfers are refused
    let rx = ask(&mgr, listener.local_addr(), &client_ctx(false));
    assert_eq!(recv(&rx), Ok(b"ok".to_vec()));
    assert_eq!(recv(&perm), Err(NetError::DotAlpnError));
}

#[test]
fn test_tlsdns_untrusted_server() {
    let mgr = manager(1);
    let (listener, perm) = dot_server(&mgr);

    let ctx = TlsClientCtx::from_pem(OTHER_CA, true).unwrap();
    let rx = ask(&mgr, listener.local_addr(), &ctx);
    assert_eq!(recv(&rx), Err(NetError::TlsBadPeerCertificate));
    assert_quiet(&perm);
}

#[test]
fn test_tlsdns_session_resumption() {
    let mgr = manager(1);
    let (listener, perm) = dot_server(&mgr);
    let ctx = client_ctx(true);

    // The second connection reuses the cached session
    for _ in 0..2 {
        let rx = ask(&mgr, listener.local_addr(), &ctx);
        assert_eq!(recv(&rx), Ok(b"ok".to_vec()));
        assert_eq!(recv(&perm), Ok(()));
    }
}

#[test]
fn test_tls_echo() {
    let mgr = manager(2);
    let listener = mgr
        .listen_tls(
            localhost(),
            |handle, res| {
                res?;
                handle.read(|h, data| {
                    if let Ok(data) = data {
                        h.send(data.to_vec(), |_, _| {});
                    }
                });
                Ok(())
            },
            10,
            None,
            &server_ctx(),
        )
        .unwrap();
    assert_eq!(listener.socket_type(), SocketType::TlsListener);

    let (tx, rx) = mpsc::channel();
    let received = Arc::new(Mutex::new(Vec::new()));
    mgr.connect_tls(
        None,
        listener.local_addr(),
        move |res| {
            let handle = res.unwrap();
            handle.read(move |h, data| {
                let Ok(data) = data else { return };
                let mut buf = received.lock().unwrap();
                buf.extend_from_slice(data);
                if buf.len() >= 4 {
                    let _ = tx.send((buf.clone(), h.alpn_negotiated()));
                }
            });
            handle.send(&b"ping"[..], |_, _| {});
        },
        WAIT,
        &client_ctx(true),
    );

    let (data, alpn) = recv(&rx);
    assert_eq!(data, b"ping");
    assert!(alpn);
}

#[test]
fn test_tls_untrusted_server() {
    let mgr = manager(1);
    let listener = mgr
        .listen_tls(localhost(), |_, res| res, 10, None, &server_ctx())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    mgr.connect_tls(
        None,
        listener.local_addr(),
        move |res| {
            let _ = tx.send(res.map(|_| ()));
        },
        WAIT,
        &TlsClientCtx::from_pem(OTHER_CA, false).unwrap(),
    );
    assert_eq!(recv(&rx), Err(NetError::TlsBadPeerCertificate));
}

#[test]
fn test_tls_close_after_peer_gone() {
    let server = manager(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = server
        .listen_tls(
            localhost(),
            move |handle, res| {
                res?;
                let _ = tx.lock().unwrap().send(handle.clone());
                Ok(())
            },
            10,
            None,
            &server_ctx(),
        )
        .unwrap();

    let client = manager(1);
    let (ctx_tx, ctx_rx) = mpsc::channel();
    client.connect_tls(
        None,
        listener.local_addr(),
        move |res| {
            let _ = ctx_tx.send(res.map(|_| ()));
        },
        WAIT,
        &client_ctx(false),
    );
    assert_eq!(recv(&ctx_rx), Ok(()));
    let handle = recv(&rx);
    client.destroy();

    // The goodbye write may fail against the departed peer; the close still completes
    handle.shutdown();
    eventually(|| !handle.is_active());

    let (sent_tx, sent_rx) = mpsc::channel();
    handle.send(&b"late"[..], move |_, res| {
        let _ = sent_tx.send(res);
    });
    assert!(recv(&sent_rx).is_err());
}
