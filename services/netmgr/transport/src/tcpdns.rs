//! DNS message framing over TCP.
//!
//! Bytes read from the stream accumulate in the socket's [`FrameBuffer`];
//! each complete `u16be length || payload` frame is handed to the read
//! callback on its own short-lived handle. Servers keep reading after every
//! message, clients stop after one message per `read` call.

use crate::error::NetError;
use crate::handle::NmHandle;
use crate::request::SendRequest;
use crate::socket::{failed_read, Socket};
use crate::tcp;
use netmgr_wire::{encode_frame, FrameBuffer};
use std::sync::Arc;
use tracing::trace;

/// Outcome of one [`process_buffer`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Processed {
    /// One message went to the read callback
    Delivered,
    /// No complete message buffered
    NoMore,
    /// Nobody is reading
    Canceled,
}

/// Deliver at most one buffered message
pub(crate) fn process_buffer(sock: &Arc<Socket>) -> Processed {
    let (cb, payload, peer, local, done) = {
        let mut st = sock.state();
        assert!(
            !st.processing,
            "socket {} dispatched a message while the previous one is held",
            sock.id()
        );

        let Some(cb) = st.recv_cb.clone() else {
            return Processed::Canceled;
        };
        let (Some(peer), Some(local)) = (st.peer, st.local) else {
            return Processed::Canceled;
        };
        let Some(payload) = st.frames.as_mut().and_then(FrameBuffer::next_frame) else {
            return Processed::NoMore;
        };

        let mut done = None;
        if sock.is_client() {
            // One message per read on the client side
            st.reading = false;
            st.read_timer.stop();
            done = st.recv_handle.take();
        } else {
            if !st.timeout_fixed {
                let t = sock.mgr().timeouts();
                let timeout = if st.keepalive { t.keepalive } else { t.idle };
                st.read_timer.set_timeout(Some(timeout));
            }
            if st.sequential {
                st.processing = true;
                st.read_timer.stop();
            } else {
                st.read_timer.restart();
            }
        }
        (cb, payload, peer, local, done)
    };

    trace!("Socket {} dispatching {} byte message", sock.id(), payload.len());
    let handle = NmHandle::new(sock, peer, local, true);
    cb(&handle, Ok(&payload[..]));
    drop(done);
    Processed::Delivered
}

/// Deliver buffered messages while the socket is willing to take them
pub(crate) fn process_sock_buffer(sock: &Arc<Socket>) {
    loop {
        {
            let st = sock.state();
            if !sock.is_active() || !st.reading || st.read_paused || st.processing {
                break;
            }
        }

        match process_buffer(sock) {
            Processed::Delivered => {}
            Processed::NoMore => {
                let mut st = sock.state();
                if st.reading && !st.read_paused {
                    st.read_timer.start();
                }
                drop(st);
                sock.wake();
                break;
            }
            Processed::Canceled => {
                sock.state().reading = false;
                break;
            }
        }
    }
}

/// Append bytes read from the stream, then dispatch what completed
pub(crate) fn on_data(sock: &Arc<Socket>, data: &[u8]) {
    let res = match sock.state().frames.as_mut() {
        Some(frames) => frames.extend(data),
        None => return,
    };
    match res {
        Ok(()) => process_sock_buffer(sock),
        Err(err) => failed_read(sock, NetError::from(err)),
    }
}

/// Frame `req` and write it
pub(crate) fn send(sock: &Arc<Socket>, mut req: Box<SendRequest>) {
    match encode_frame(&req.data) {
        Ok(framed) => {
            req.data = framed;
            tcp::send_direct(sock, req);
        }
        Err(err) => sock.mgr().complete_send(req, Err(NetError::from(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::manager::NetManager;
    use crate::socket::SocketType;

    fn framed_socket(mgr: &NetManager) -> Arc<Socket> {
        Socket::new(mgr.inner(), SocketType::TcpDnsSocket, 0, false, None)
    }

    #[test]
    #[should_panic(expected = "while the previous one is held")]
    fn test_dispatch_while_processing_panics() {
        let mgr = NetManager::new(NetConfig::default().with_workers(1)).unwrap();
        let sock = framed_socket(&mgr);
        sock.state().processing = true;
        process_buffer(&sock);
    }

    #[test]
    fn test_no_reader_is_canceled() {
        let mgr = NetManager::new(NetConfig::default().with_workers(1)).unwrap();
        let sock = framed_socket(&mgr);
        assert!(sock.state().recv_cb.is_none());
        assert_eq!(process_buffer(&sock), Processed::Canceled);
    }
}
