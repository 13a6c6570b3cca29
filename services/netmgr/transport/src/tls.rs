//! TLS session core and the generic TLS transport.
//!
//! [`TlsSession`] drives a rustls connection without touching a socket:
//! ciphertext read from the network is fed in, ciphertext to send is taken
//! out. Both TLS transports build on it. The generic TLS socket here layers
//! it over an inner TCP handle and delivers raw plaintext chunks; the
//! DNS-over-TLS socket in `tlsdns` drives it directly on its own stream.

use crate::error::{NetError, NetResult};
use crate::event::{NetEvent, SocketOption};
use crate::handle::{AcceptCb, ConnectCb, NmHandle, RecvCb};
use crate::manager::ManagerInner;
use crate::map_io_err;
use crate::quota::Quota;
use crate::request::SendRequest;
use crate::socket::{close_socket, finish_close, inactive_reason, Listener, Socket, SocketType};
use crate::stats::StatId;
use crate::tcp;
use crate::tlsctx::{TlsClientCtx, TlsServerCtx, DOT_ALPN};
use crate::worker::with_recv_buffer;
use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Lifecycle of a TLS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsState {
    None,
    Handshake,
    Io,
    Error,
}

enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(rd),
            TlsConnection::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(wr),
            TlsConnection::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsConnection::Server(conn) => conn.alpn_protocol(),
            TlsConnection::Client(conn) => conn.alpn_protocol(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn set_buffer_limit(&mut self, limit: Option<usize>) {
        match self {
            TlsConnection::Server(conn) => conn.set_buffer_limit(limit),
            TlsConnection::Client(conn) => conn.set_buffer_limit(limit),
        }
    }
}

/// Socket-free TLS connection with a latched error
pub(crate) struct TlsSession {
    conn: TlsConnection,
    state: TlsState,
    error: Option<NetError>,
    incoming: BytesMut,
    alpn_dot: bool,
}

impl TlsSession {
    fn new(mut conn: TlsConnection) -> Self {
        // Output is bounded by the send queues, not by rustls
        conn.set_buffer_limit(None);
        Self {
            conn,
            state: TlsState::None,
            error: None,
            incoming: BytesMut::new(),
            alpn_dot: false,
        }
    }

    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> NetResult<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(|e| NetError::from_tls(&e))?;
        Ok(Self::new(TlsConnection::Server(conn)))
    }

    pub(crate) fn client(
        config: Arc<rustls::ClientConfig>,
        name: ServerName<'static>,
    ) -> NetResult<Self> {
        let conn =
            rustls::ClientConnection::new(config, name).map_err(|e| NetError::from_tls(&e))?;
        Ok(Self::new(TlsConnection::Client(conn)))
    }

    pub(crate) fn state(&self) -> TlsState {
        self.state
    }

    pub(crate) fn error(&self) -> Option<NetError> {
        self.error
    }

    pub(crate) fn alpn_dot(&self) -> bool {
        self.alpn_dot
    }

    /// Record a terminal error; the first one sticks
    pub(crate) fn latch(&mut self, err: NetError) -> NetError {
        self.state = TlsState::Error;
        *self.error.get_or_insert(err)
    }

    /// Queue ciphertext received from the network
    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Ciphertext received but not yet consumed by rustls
    pub(crate) fn pending_input(&self) -> usize {
        self.incoming.len()
    }

    /// Move queued ciphertext into rustls and process it
    pub(crate) fn ingest(&mut self) -> NetResult<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        while !self.incoming.is_empty() {
            let mut rd = &self.incoming[..];
            match self.conn.read_tls(&mut rd) {
                Ok(0) => break,
                Ok(n) => self.incoming.advance(n),
                // rustls buffers are full until plaintext is drained
                Err(_) => break,
            }
            if let Err(e) = self.conn.process_new_packets() {
                debug!("TLS error: {}", e);
                return Err(self.latch(NetError::from_tls(&e)));
            }
        }
        Ok(())
    }

    /// Step the handshake state; true exactly once, when it completes
    pub(crate) fn advance_handshake(&mut self) -> bool {
        if self.state == TlsState::None {
            self.state = TlsState::Handshake;
        }
        if self.state != TlsState::Handshake || self.conn.is_handshaking() {
            return false;
        }
        self.state = TlsState::Io;
        self.alpn_dot = self.conn.alpn_protocol() == Some(DOT_ALPN);
        true
    }

    /// Read decrypted bytes; `None` when nothing is buffered
    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> NetResult<Option<usize>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.conn.reader().read(buf) {
            // Orderly close_notify from the peer
            Ok(0) => Err(NetError::Eof),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(NetError::Eof),
            Err(e) => Err(self.latch(map_io_err!(e))),
        }
    }

    /// Encrypt `data` as one write
    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> NetResult<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| self.latch(map_io_err!(e)))
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Drain ciphertext waiting to be sent
    pub(crate) fn take_ciphertext(&mut self) -> NetResult<Vec<u8>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            if let Err(e) = self.conn.write_tls(&mut out) {
                return Err(self.latch(map_io_err!(e)));
            }
        }
        Ok(out)
    }

    /// Queue close_notify and return everything left to send
    pub(crate) fn close_notify(&mut self) -> Vec<u8> {
        if self.error.is_some() {
            return Vec::new();
        }
        self.conn.send_close_notify();
        self.take_ciphertext().unwrap_or_default()
    }
}

/// Generic TLS state of a `TlsSocket`
pub(crate) struct TlsLayer {
    session: TlsSession,
    inner: Option<NmHandle>,
    pending: VecDeque<Box<SendRequest>>,
    cycle: bool,
    accepted: bool,
}

impl TlsLayer {
    fn new(session: TlsSession, inner: NmHandle) -> Self {
        Self {
            session,
            inner: Some(inner),
            pending: VecDeque::new(),
            cycle: false,
            accepted: false,
        }
    }
}

/// Listen for TLS: a plain TCP listener whose connections get wrapped
pub(crate) fn listen(
    mgr: &Arc<ManagerInner>,
    addr: SocketAddr,
    accept_cb: AcceptCb,
    backlog: u32,
    quota: Option<Quota>,
    ctx: &TlsServerCtx,
) -> NetResult<Listener> {
    if mgr.is_closing() {
        return Err(NetError::ShuttingDown);
    }

    let parent = Socket::new(mgr, SocketType::TlsListener, 0, false, None);
    parent.state().accept_cb = Some(accept_cb);

    let config = ctx.config();
    let weak = Arc::downgrade(&parent);
    let inner_accept: AcceptCb = Arc::new(move |handle: &NmHandle, res: NetResult<()>| {
        res?;
        let parent = weak.upgrade().ok_or(NetError::Canceled)?;
        if !parent.is_active() {
            return Err(NetError::Canceled);
        }
        wrap_server(&parent, handle, config.clone())
    });

    let inner = match tcp::listen(
        mgr,
        SocketType::TcpListener,
        addr,
        None,
        inner_accept,
        backlog,
        quota,
        None,
    ) {
        Ok(inner) => inner,
        Err(err) => {
            finish_close(&parent);
            return Err(err);
        }
    };

    let local = inner.local_addr();
    {
        let mut st = parent.state();
        st.local = Some(local);
        st.inner_listener = Some(inner);
    }
    parent.listening.store(true, Ordering::Release);
    Ok(Listener::new(parent, local))
}

fn wrap_server(
    parent: &Arc<Socket>,
    inner: &NmHandle,
    config: Arc<rustls::ServerConfig>,
) -> NetResult<()> {
    let session = TlsSession::server(config)?;
    let accept_cb = parent.state().accept_cb.clone();
    let sock = Socket::new(
        parent.mgr(),
        SocketType::TlsSocket,
        inner.socket().tid(),
        false,
        None,
    );
    {
        let mut st = sock.state();
        st.peer = Some(inner.peer_addr());
        st.local = Some(inner.local_addr());
        st.accept_cb = accept_cb;
        st.layer = Some(TlsLayer::new(session, inner.clone()));
    }
    sock.register();
    start_inner_read(&sock, inner);
    cycle(&sock);
    Ok(())
}

/// Connect over TCP, then run the client handshake on the same worker
pub(crate) fn connect(
    mgr: &Arc<ManagerInner>,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    cb: ConnectCb,
    timeout: Duration,
    ctx: &TlsClientCtx,
) {
    let config = ctx.config();
    let name = ctx.server_name_for(peer);
    let weak_mgr = Arc::downgrade(mgr);
    let tid = mgr.pick_worker();

    let on_tcp: ConnectCb = Box::new(move |res: NetResult<NmHandle>| {
        let inner = match res {
            Ok(inner) => inner,
            Err(err) => return cb(Err(err)),
        };
        let Some(mgr) = weak_mgr.upgrade() else {
            inner.shutdown();
            return cb(Err(NetError::ShuttingDown));
        };
        wrap_client(&mgr, inner, config, name, cb, timeout);
    });
    tcp::connect(
        mgr,
        SocketType::TcpSocket,
        local,
        peer,
        on_tcp,
        timeout,
        None,
        Some(tid),
    );
}

fn wrap_client(
    mgr: &Arc<ManagerInner>,
    inner: NmHandle,
    config: Arc<rustls::ClientConfig>,
    name: ServerName<'static>,
    cb: ConnectCb,
    timeout: Duration,
) {
    let session = match TlsSession::client(config, name) {
        Ok(session) => session,
        Err(err) => {
            inner.shutdown();
            return cb(Err(err));
        }
    };

    let sock = Socket::new(mgr, SocketType::TlsSocket, inner.socket().tid(), true, None);
    {
        let mut st = sock.state();
        st.peer = Some(inner.peer_addr());
        st.local = Some(inner.local_addr());
        st.connect_cb = Some(cb);
        st.layer = Some(TlsLayer::new(session, inner.clone()));
    }
    sock.register();

    // The inner read timeout bounds the handshake
    inner.set_timeout(timeout);
    start_inner_read(&sock, &inner);
    cycle(&sock);
}

fn start_inner_read(sock: &Arc<Socket>, inner: &NmHandle) {
    let weak: Weak<Socket> = Arc::downgrade(sock);
    inner.read(move |_, res| {
        if let Some(sock) = weak.upgrade() {
            on_inner_read(&sock, res);
        }
    });
}

fn on_inner_read(sock: &Arc<Socket>, res: NetResult<&[u8]>) {
    match res {
        Ok(data) => {
            if let Some(layer) = sock.state().layer.as_mut() {
                layer.session.feed(data);
            }
            cycle(sock);
        }
        Err(err) => fail(sock, err),
    }
}

/// Run the TLS state machine until it stops making progress
pub(crate) fn cycle(sock: &Arc<Socket>) {
    {
        let mut st = sock.state();
        let Some(layer) = st.layer.as_mut() else {
            return;
        };
        if layer.cycle || layer.session.error().is_some() {
            return;
        }
        layer.cycle = true;
    }

    let res = run_cycle(sock);

    if let Some(layer) = sock.state().layer.as_mut() {
        layer.cycle = false;
    }
    if let Err(err) = res {
        fail(sock, err);
    }
}

fn run_cycle(sock: &Arc<Socket>) -> NetResult<()> {
    loop {
        let mut progress = false;

        let established = {
            let mut st = sock.state();
            let Some(layer) = st.layer.as_mut() else {
                return Ok(());
            };
            layer.session.ingest()?;
            !layer.accepted && layer.session.advance_handshake()
        };
        if established {
            handshake_done(sock)?;
            progress = true;
        }

        if deliver_plaintext(sock)? {
            progress = true;
        }
        if flush(sock)? {
            progress = true;
        }

        if !progress || !sock.is_active() {
            return Ok(());
        }
    }
}

fn handshake_done(sock: &Arc<Socket>) -> NetResult<()> {
    let (connect_cb, accept_cb, peer, local, alpn, inner) = {
        let mut st = sock.state();
        let st = &mut *st;
        let Some(layer) = st.layer.as_mut() else {
            return Err(NetError::Canceled);
        };
        layer.accepted = true;
        (
            st.connect_cb.take(),
            st.accept_cb.clone(),
            st.peer,
            st.local,
            layer.session.alpn_dot(),
            layer.inner.clone(),
        )
    };
    let (Some(peer), Some(local)) = (peer, local) else {
        return Err(NetError::Unexpected);
    };
    sock.set_alpn_dot(alpn);
    debug!("TLS handshake with {} complete", peer);

    let handle = NmHandle::new(sock, peer, local, false);
    if sock.is_client() {
        if let Some(inner) = inner {
            inner.set_timeout(sock.mgr().timeouts().idle);
        }
        sock.mgr().stats.incr(StatId::Connected);
        if let Some(cb) = connect_cb {
            cb(Ok(handle));
        }
        return Ok(());
    }

    match accept_cb {
        Some(cb) => cb(&handle, Ok(())),
        None => Ok(()),
    }
}

fn deliver_plaintext(sock: &Arc<Socket>) -> NetResult<bool> {
    let read = {
        let st = sock.state();
        let accepted = st.layer.as_ref().is_some_and(|l| l.accepted);
        if !accepted || !st.reading || st.read_paused {
            return Ok(false);
        }
        match (&st.recv_cb, &st.recv_handle) {
            (Some(cb), Some(handle)) => (cb.clone(), handle.clone()),
            _ => return Ok(false),
        }
    };
    let (cb, handle) = read;

    let chunk = sock.mgr().config().recv_chunk_size;
    with_recv_buffer(chunk, |buf| {
        let res = match sock.state().layer.as_mut() {
            Some(layer) => layer.session.read_plaintext(buf)?,
            None => None,
        };
        match res {
            Some(n) => {
                cb(&handle, Ok(&buf[..n]));
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// Encrypt pending sends and hand ciphertext to the inner handle
fn flush(sock: &Arc<Socket>) -> NetResult<bool> {
    let mut progress = false;
    loop {
        let (inner, ciphertext, req) = {
            let mut st = sock.state();
            let Some(layer) = st.layer.as_mut() else {
                return Ok(progress);
            };
            let Some(inner) = layer.inner.clone() else {
                return Ok(progress);
            };

            let req = if layer.accepted {
                layer.pending.pop_front()
            } else {
                None
            };
            let written = match &req {
                Some(req) => layer.session.write_plaintext(&req.data),
                None => Ok(()),
            };
            let ciphertext = written.and_then(|()| layer.session.take_ciphertext());
            match ciphertext {
                Ok(ciphertext) => (inner, ciphertext, req),
                Err(err) => {
                    if let Some(req) = req {
                        layer.pending.push_front(req);
                    }
                    return Err(err);
                }
            }
        };

        if ciphertext.is_empty() && req.is_none() {
            return Ok(progress);
        }
        progress = true;

        let owner = sock.clone();
        inner.send(ciphertext, move |_, res| {
            if let Some(req) = req {
                owner.mgr().complete_send(req, res);
            }
            if let Err(err) = res {
                fail(&owner, err);
            }
        });
    }
}

/// Latch `err` and tear the connection down
pub(crate) fn fail(sock: &Arc<Socket>, err: NetError) {
    if !sock.is_active() {
        return;
    }
    let (accepted, read, accept_cb, peer, local) = {
        let mut st = sock.state();
        let accepted = match st.layer.as_mut() {
            Some(layer) => {
                layer.session.latch(err);
                layer.accepted
            }
            None => false,
        };
        let read = if accepted {
            st.reading = false;
            match st.recv_handle.take() {
                Some(handle) => st.recv_cb.clone().map(|cb| (cb, handle)),
                None => None,
            }
        } else {
            None
        };
        (accepted, read, st.accept_cb.clone(), st.peer, st.local)
    };

    if let Some((cb, handle)) = read {
        cb(&handle, Err(err));
    } else if !accepted && !sock.is_client() {
        if let (Some(cb), Some(peer), Some(local)) = (accept_cb, peer, local) {
            let handle = NmHandle::new(sock, peer, local, false);
            let _ = cb(&handle, Err(err));
        }
    }
    close_socket(sock, err);
}

/// Close a TLS socket: fail what is pending, say goodbye, drop the inner handle
pub(crate) fn close(sock: &Arc<Socket>, reason: NetError) {
    let (connect_cb, read, sends, inner, goodbye) = {
        let mut st = sock.state();
        let connect_cb = st.connect_cb.take();
        st.reading = false;
        let read = match st.recv_handle.take() {
            Some(handle) => st.recv_cb.clone().map(|cb| (cb, handle)),
            None => None,
        };
        let (sends, inner, goodbye) = match st.layer.as_mut() {
            Some(layer) => (
                layer.pending.drain(..).collect::<Vec<_>>(),
                layer.inner.take(),
                layer.session.close_notify(),
            ),
            None => (Vec::new(), None, Vec::new()),
        };
        (connect_cb, read, sends, inner, goodbye)
    };

    let mgr = sock.mgr();
    if let Some(cb) = connect_cb {
        mgr.stats.incr(StatId::ConnectFailed);
        cb(Err(reason));
    }
    if let Some((cb, handle)) = read {
        cb(&handle, Err(reason));
    }
    for req in sends {
        mgr.complete_send(req, Err(reason));
    }

    if let Some(inner) = inner {
        if goodbye.is_empty() {
            inner.shutdown();
        } else {
            inner.send(goodbye, |h, _| h.shutdown());
        }
    }
    finish_close(sock);
}

pub(crate) fn start_read(sock: &Arc<Socket>, handle: NmHandle, cb: RecvCb) {
    if !sock.is_active() {
        cb(&handle, Err(inactive_reason(sock)));
        return;
    }
    let inner = {
        let mut st = sock.state();
        st.recv_cb = Some(cb);
        st.recv_handle = Some(handle);
        st.reading = true;
        st.read_paused = false;
        st.layer.as_ref().and_then(|l| l.inner.clone())
    };
    if let Some(inner) = inner {
        inner.resume_read();
    }
    // Plaintext may already be buffered; deliver it from the queue
    sock.mgr().enqueue(sock.tid(), NetEvent::Process(sock.clone()));
}

fn inner_handle(sock: &Socket) -> Option<NmHandle> {
    sock.state().layer.as_ref().and_then(|l| l.inner.clone())
}

pub(crate) fn pause_read(sock: &Arc<Socket>) {
    sock.state().read_paused = true;
    if let Some(inner) = inner_handle(sock) {
        inner.pause_read();
    }
}

pub(crate) fn resume_read(sock: &Arc<Socket>) {
    sock.state().read_paused = false;
    if let Some(inner) = inner_handle(sock) {
        inner.resume_read();
    }
    sock.mgr().enqueue(sock.tid(), NetEvent::Process(sock.clone()));
}

/// Queue `req` for encryption
pub(crate) fn send(sock: &Arc<Socket>, req: Box<SendRequest>) {
    if !sock.is_active() {
        sock.mgr().complete_send(req, Err(inactive_reason(sock)));
        return;
    }
    let rejected = match sock.state().layer.as_mut() {
        Some(layer) => {
            layer.pending.push_back(req);
            None
        }
        None => Some(req),
    };
    match rejected {
        Some(req) => sock.mgr().complete_send(req, Err(NetError::NotConnected)),
        None => cycle(sock),
    }
}

/// Timeouts live on the inner TCP socket
pub(crate) fn configure(sock: &Arc<Socket>, option: SocketOption) {
    let Some(inner) = inner_handle(sock) else {
        return;
    };
    match option {
        SocketOption::ReadTimeout(Some(timeout)) => inner.set_timeout(timeout),
        SocketOption::ReadTimeout(None) => inner.clear_timeout(),
        SocketOption::Keepalive(enabled) => inner.keepalive(enabled),
        SocketOption::WriteTimeout(timeout) => inner.set_write_timeout(timeout),
        SocketOption::Sequential => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlsctx::{TlsClientCtx, TlsServerCtx};

    const CA: &[u8] = include_bytes!("../tests/certs/ca.pem");
    const OTHER_CA: &[u8] = include_bytes!("../tests/certs/other-ca.pem");
    const CERT: &[u8] = include_bytes!("../tests/certs/server.pem");
    const KEY: &[u8] = include_bytes!("../tests/certs/server-key.pem");

    fn pair(ca: &[u8], dot: bool) -> (TlsSession, TlsSession) {
        let server = TlsServerCtx::from_pem(CERT, KEY).unwrap();
        let client = TlsClientCtx::from_pem(ca, dot).unwrap();
        let peer: SocketAddr = "127.0.0.1:853".parse().unwrap();
        (
            TlsSession::server(server.config()).unwrap(),
            TlsSession::client(client.config(), client.server_name_for(peer)).unwrap(),
        )
    }

    /// Shuttle ciphertext both ways until neither side has output
    fn pump(a: &mut TlsSession, b: &mut TlsSession) -> NetResult<()> {
        for _ in 0..16 {
            let ab = a.take_ciphertext()?;
            let ba = b.take_ciphertext()?;
            if ab.is_empty() && ba.is_empty() {
                break;
            }
            b.feed(&ab);
            a.feed(&ba);
            b.ingest()?;
            a.ingest()?;
            a.advance_handshake();
            b.advance_handshake();
        }
        Ok(())
    }

    #[test]
    fn test_handshake_and_data() {
        let (mut server, mut client) = pair(CA, true);
        client.advance_handshake();
        server.advance_handshake();
        assert_eq!(client.state(), TlsState::Handshake);

        pump(&mut client, &mut server).unwrap();
        assert_eq!(client.state(), TlsState::Io);
        assert_eq!(server.state(), TlsState::Io);
        assert!(client.alpn_dot());
        assert!(server.alpn_dot());

        // One write carries prefix and payload together
        let framed = netmgr_wire::encode_frame(b"hello").unwrap();
        client.write_plaintext(&framed).unwrap();
        pump(&mut client, &mut server).unwrap();

        let mut buf = [0u8; 64];
        let n = server.read_plaintext(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &framed[..]);
        assert_eq!(server.read_plaintext(&mut buf).unwrap(), None);

        let goodbye = client.close_notify();
        server.feed(&goodbye);
        server.ingest().unwrap();
        assert_eq!(server.read_plaintext(&mut buf), Err(NetError::Eof));
    }

    #[test]
    fn test_no_alpn() {
        let (mut server, mut client) = pair(CA, false);
        client.advance_handshake();
        pump(&mut client, &mut server).unwrap();
        assert_eq!(client.state(), TlsState::Io);
        assert!(!client.alpn_dot());
    }

    #[test]
    fn test_untrusted_server_latches() {
        let (mut server, mut client) = pair(OTHER_CA, true);
        client.advance_handshake();
        let err = pump(&mut client, &mut server).unwrap_err();
        assert_eq!(err, NetError::TlsBadPeerCertificate);
        assert_eq!(client.state(), TlsState::Error);
        // The first error sticks
        assert_eq!(client.latch(NetError::TimedOut), NetError::TlsBadPeerCertificate);
        assert_eq!(client.ingest(), Err(NetError::TlsBadPeerCertificate));
    }
}
