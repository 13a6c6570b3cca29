//! DNS-over-TLS on a single socket.
//!
//! The socket's own stream carries the TLS records. Decrypted plaintext
//! feeds the frame buffer directly and each outgoing message is framed and
//! encrypted in one TLS write. At most one ciphertext buffer is in flight;
//! further messages wait in FIFO order until it has been written.

use crate::error::{NetError, NetResult};
use crate::handle::NmHandle;
use crate::map_io_err;
use crate::request::SendRequest;
use crate::socket::{close_socket, failed_read, inactive_reason, Socket, SocketState};
use crate::stats::StatId;
use crate::tcpdns::{self, Processed};
use crate::timer::SocketTimer;
use crate::worker::with_recv_buffer;
use crate::tls::{TlsSession, TlsState};
use netmgr_wire::{encode_frame, FrameBuffer};
use rustls::pki_types::ServerName;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Stop reading from the network while this much ciphertext is unprocessed
const MAX_PENDING_INPUT: usize = 64 * 1024;

struct CipherOut {
    data: Vec<u8>,
    offset: usize,
    req: Option<Box<SendRequest>>,
    deadline: Option<Instant>,
}

/// TLS state of a `TlsDnsSocket`
pub(crate) struct TlsStream {
    session: TlsSession,
    out: Option<CipherOut>,
    queue: VecDeque<Box<SendRequest>>,
    cycle: bool,
    accepted: bool,
}

impl TlsStream {
    fn new(session: TlsSession) -> Self {
        Self {
            session,
            out: None,
            queue: VecDeque::new(),
            cycle: false,
            accepted: false,
        }
    }

    /// Every send not yet completed
    pub(crate) fn take_requests(&mut self) -> Vec<Box<SendRequest>> {
        let mut reqs: Vec<_> = self.out.take().and_then(|out| out.req).into_iter().collect();
        reqs.extend(self.queue.drain(..));
        reqs
    }

    /// close_notify ciphertext, empty after a failure
    pub(crate) fn close_notify(&mut self) -> Vec<u8> {
        self.session.close_notify()
    }

    pub(crate) fn out_expired(&self, now: Instant) -> bool {
        self.out
            .as_ref()
            .and_then(|out| out.deadline)
            .is_some_and(|d| d <= now)
    }
}

/// Read interest, write interest and write deadline for the I/O loop
pub(crate) fn interest(st: &SocketState) -> (bool, bool, Option<Instant>) {
    let Some(tls) = st.tls.as_ref() else {
        return (false, false, None);
    };
    if tls.session.error().is_some() {
        return (false, false, None);
    }
    let wants_input = match tls.session.state() {
        TlsState::Io => st.reading && !st.read_paused && !st.processing,
        _ => true,
    };
    let read = wants_input && tls.session.pending_input() < MAX_PENDING_INPUT;
    let write = tls.out.is_some();
    (read, write, tls.out.as_ref().and_then(|out| out.deadline))
}

/// Whether the handshake completed and the application was told
pub(crate) fn is_established(sock: &Socket) -> bool {
    sock.state().tls.as_ref().is_some_and(|tls| tls.accepted)
}

/// Start the server handshake on an accepted connection
pub(crate) fn accept(sock: &Arc<Socket>, config: Arc<rustls::ServerConfig>) -> NetResult<()> {
    let session = TlsSession::server(config)?;
    {
        let mut st = sock.state();
        st.tls = Some(TlsStream::new(session));
        // The init timeout bounds the handshake
        st.read_timer.start();
    }
    cycle(sock);
    Ok(())
}

/// Start the client handshake on a connected stream
pub(crate) fn connect(
    sock: &Arc<Socket>,
    config: Arc<rustls::ClientConfig>,
    name: ServerName<'static>,
) -> NetResult<()> {
    let session = TlsSession::client(config, name)?;
    sock.state().tls = Some(TlsStream::new(session));
    cycle(sock);
    Ok(())
}

/// Ciphertext arrived from the network
pub(crate) fn on_data(sock: &Arc<Socket>, data: &[u8]) {
    if let Some(tls) = sock.state().tls.as_mut() {
        tls.session.feed(data);
    }
    cycle(sock);
}

pub(crate) fn on_writable(sock: &Arc<Socket>, _stream: &tokio::net::TcpStream) {
    cycle(sock);
}

/// Frame `req` and queue it for encryption
pub(crate) fn send(sock: &Arc<Socket>, mut req: Box<SendRequest>) {
    if !sock.is_active() {
        sock.mgr().complete_send(req, Err(inactive_reason(sock)));
        return;
    }
    match encode_frame(&req.data) {
        Ok(framed) => req.data = framed,
        Err(err) => {
            sock.mgr().complete_send(req, Err(NetError::from(err)));
            return;
        }
    }
    let rejected = match sock.state().tls.as_mut() {
        Some(tls) => {
            tls.queue.push_back(req);
            None
        }
        None => Some(req),
    };
    match rejected {
        Some(req) => sock.mgr().complete_send(req, Err(NetError::NotConnected)),
        None => cycle(sock),
    }
}

/// Run the TLS state machine until it stops making progress
pub(crate) fn cycle(sock: &Arc<Socket>) {
    {
        let mut st = sock.state();
        let Some(tls) = st.tls.as_mut() else {
            return;
        };
        if tls.cycle || tls.session.error().is_some() {
            return;
        }
        tls.cycle = true;
    }

    let res = run_cycle(sock);

    if let Some(tls) = sock.state().tls.as_mut() {
        tls.cycle = false;
    }
    match res {
        Ok(()) => sock.wake(),
        Err(err) => fail(sock, err),
    }
}

fn run_cycle(sock: &Arc<Socket>) -> NetResult<()> {
    loop {
        if !sock.is_active() {
            return Ok(());
        }
        let input = cycle_input(sock)?;
        let output = flush_output(sock)?;
        if !input && !output {
            return Ok(());
        }
    }
}

/// Input phase; true if anything happened
fn cycle_input(sock: &Arc<Socket>) -> NetResult<bool> {
    let handshake = {
        let mut st = sock.state();
        let Some(tls) = st.tls.as_mut() else {
            return Ok(false);
        };
        tls.session.ingest()?;
        (!tls.accepted).then(|| tls.session.advance_handshake())
    };
    match handshake {
        Some(true) => return handshake_done(sock).map(|()| true),
        Some(false) => return Ok(false),
        None => {}
    }

    let has_frame = {
        let st = sock.state();
        if !st.reading || st.read_paused || st.processing {
            return Ok(false);
        }
        st.frames.as_ref().is_some_and(FrameBuffer::has_frame)
    };
    if has_frame {
        return match tcpdns::process_buffer(sock) {
            Processed::Delivered => Ok(true),
            Processed::NoMore => Ok(false),
            Processed::Canceled => {
                sock.state().reading = false;
                Ok(false)
            }
        };
    }

    let chunk = sock.mgr().config().recv_chunk_size;
    let mut st = sock.state();
    let st = &mut *st;
    let (Some(tls), Some(frames)) = (st.tls.as_mut(), st.frames.as_mut()) else {
        return Ok(false);
    };
    let room = frames.remaining().min(chunk);
    if room == 0 {
        return Err(NetError::NoResources);
    }
    let read = with_recv_buffer(room, |buf| -> NetResult<bool> {
        match tls.session.read_plaintext(buf)? {
            Some(n) => {
                frames.extend(&buf[..n])?;
                Ok(true)
            }
            None => Ok(false),
        }
    })?;
    if !read {
        st.read_timer.start();
    }
    Ok(read)
}

fn handshake_done(sock: &Arc<Socket>) -> NetResult<()> {
    let (connect_cb, accept_cb, peer, local, alpn) = {
        let mut st = sock.state();
        let st = &mut *st;
        let Some(tls) = st.tls.as_mut() else {
            return Err(NetError::Canceled);
        };
        tls.accepted = true;
        let alpn = tls.session.alpn_dot();
        st.connect_timer.stop();
        if sock.is_client() {
            st.read_timer = SocketTimer::new(Some(sock.mgr().timeouts().idle));
        }
        (
            st.connect_cb.take(),
            st.accept_cb.clone(),
            st.peer,
            st.local,
            alpn,
        )
    };
    let (Some(peer), Some(local)) = (peer, local) else {
        return Err(NetError::Unexpected);
    };
    sock.set_alpn_dot(alpn);
    debug!("DNS-over-TLS handshake with {} complete (dot ALPN: {})", peer, alpn);

    let handle = NmHandle::new(sock, peer, local, false);
    if sock.is_client() {
        sock.mgr().stats.incr(StatId::Connected);
        if let Some(cb) = connect_cb {
            cb(Ok(handle));
        }
        return Ok(());
    }

    if let Some(cb) = accept_cb {
        cb(&handle, Ok(()))?;
    }
    let mut st = sock.state();
    st.recv_handle = Some(handle);
    st.reading = true;
    st.read_timer.start();
    Ok(())
}

fn write_deadline(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Output phase: keep one ciphertext buffer in flight; true if anything was written
fn flush_output(sock: &Arc<Socket>) -> NetResult<bool> {
    let mut progress = false;
    loop {
        let mut st = sock.state();
        let Some(stream) = st.stream.clone() else {
            return Ok(progress);
        };
        let write_timeout = st.write_timeout;
        let Some(tls) = st.tls.as_mut() else {
            return Ok(progress);
        };

        if tls.out.is_none() {
            let req = if tls.accepted && !tls.session.wants_write() {
                tls.queue.pop_front()
            } else {
                None
            };
            let written = match &req {
                Some(req) => tls.session.write_plaintext(&req.data),
                None => Ok(()),
            };
            let data = match written.and_then(|()| tls.session.take_ciphertext()) {
                Ok(data) => data,
                Err(err) => {
                    // Failed along with the rest of the queue by the close
                    if let Some(req) = req {
                        tls.queue.push_front(req);
                    }
                    return Err(err);
                }
            };
            if data.is_empty() {
                drop(st);
                match req {
                    // Empty plaintext encrypts to nothing
                    Some(req) => {
                        sock.mgr().complete_send(req, Ok(()));
                        progress = true;
                        continue;
                    }
                    None => return Ok(progress),
                }
            }
            tls.out = Some(CipherOut {
                data,
                offset: 0,
                req,
                deadline: write_deadline(write_timeout),
            });
        }

        let Some(out) = tls.out.as_mut() else {
            return Ok(progress);
        };
        match stream.try_write(&out.data[out.offset..]) {
            Ok(n) => {
                out.offset += n;
                if out.offset < out.data.len() {
                    if n == 0 {
                        return Ok(progress);
                    }
                    continue;
                }
                progress = true;
                let done = tls.out.take().and_then(|out| out.req);
                drop(st);
                if let Some(req) = done {
                    sock.mgr().complete_send(req, Ok(()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
            Err(e) => return Err(map_io_err!(e)),
        }
    }
}

/// Fail the connection; before the handshake completed the server's accept
/// callback hears about it
pub(crate) fn fail(sock: &Arc<Socket>, err: NetError) {
    if !sock.is_active() {
        return;
    }
    let (established, accept_cb, peer, local) = {
        let mut st = sock.state();
        let established = match st.tls.as_mut() {
            Some(tls) => {
                tls.session.latch(err);
                tls.accepted
            }
            None => false,
        };
        (established, st.accept_cb.clone(), st.peer, st.local)
    };

    if established {
        failed_read(sock, err);
        return;
    }

    debug!("DNS-over-TLS handshake failed: {}", err);
    if !sock.is_client() {
        if let (Some(cb), Some(peer), Some(local)) = (accept_cb, peer, local) {
            let handle = NmHandle::new(sock, peer, local, false);
            let _ = cb(&handle, Err(err));
        }
    }
    close_socket(sock, err);
}
