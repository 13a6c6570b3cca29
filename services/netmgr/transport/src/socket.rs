//! Sockets and their lifecycle.
//!
//! A socket moves one way through active, closing and closed. Flags that
//! other threads inspect are atomics; everything else lives in
//! [`SocketState`] and is only changed by the worker owning the socket.
//! Callbacks are always invoked with the state lock released.

use crate::error::NetError;
use crate::event::{NetEvent, SocketOption};
use crate::handle::{AcceptCb, ConnectCb, NmHandle, RecvCb};
use crate::manager::ManagerInner;
use crate::map_io_err;
use crate::quota::QuotaPermit;
use crate::request::SendRequest;
use crate::stats::StatId;
use crate::timer::{earliest, SocketTimer};
use crate::tls::TlsLayer;
use crate::tlsdns::TlsStream;
use crate::worker::with_recv_buffer;
use crate::{tcp, tcpdns, tls, tlsdns};
use netmgr_wire::FrameBuffer;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Transport and role of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Plain TCP listener
    TcpListener,
    /// Plain TCP connection
    TcpSocket,
    /// DNS-over-TCP listener
    TcpDnsListener,
    /// DNS-over-TCP connection
    TcpDnsSocket,
    /// TLS listener
    TlsListener,
    /// TLS connection
    TlsSocket,
    /// DNS-over-TLS listener
    TlsDnsListener,
    /// DNS-over-TLS connection
    TlsDnsSocket,
}

impl SocketType {
    /// Whether this is a listener type
    pub fn is_listener(self) -> bool {
        matches!(
            self,
            SocketType::TcpListener
                | SocketType::TcpDnsListener
                | SocketType::TlsListener
                | SocketType::TlsDnsListener
        )
    }

    /// Whether messages carry the 2-byte length prefix
    pub fn is_framed(self) -> bool {
        matches!(
            self,
            SocketType::TcpDnsListener
                | SocketType::TcpDnsSocket
                | SocketType::TlsDnsListener
                | SocketType::TlsDnsSocket
        )
    }

    /// Connection type produced by a listener type
    pub fn stream_type(self) -> SocketType {
        match self {
            SocketType::TcpListener => SocketType::TcpSocket,
            SocketType::TcpDnsListener => SocketType::TcpDnsSocket,
            SocketType::TlsListener => SocketType::TlsSocket,
            SocketType::TlsDnsListener => SocketType::TlsDnsSocket,
            other => other,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketType::TcpListener => "tcp-listener",
            SocketType::TcpSocket => "tcp",
            SocketType::TcpDnsListener => "tcpdns-listener",
            SocketType::TcpDnsSocket => "tcpdns",
            SocketType::TlsListener => "tls-listener",
            SocketType::TlsSocket => "tls",
            SocketType::TlsDnsListener => "tlsdns-listener",
            SocketType::TlsDnsSocket => "tlsdns",
        };
        f.write_str(name)
    }
}

/// Mutable per-socket state, owned by the socket's worker
pub(crate) struct SocketState {
    pub(crate) stream: Option<Arc<TcpStream>>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,

    // Listener parent: one child per worker
    pub(crate) children: Vec<Arc<Socket>>,
    pub(crate) listen: Option<tcp::ListenParams>,
    pub(crate) inner_listener: Option<Listener>,

    pub(crate) recv_cb: Option<RecvCb>,
    pub(crate) accept_cb: Option<AcceptCb>,
    pub(crate) connect_cb: Option<ConnectCb>,
    pub(crate) recv_handle: Option<NmHandle>,

    pub(crate) reading: bool,
    pub(crate) read_paused: bool,
    pub(crate) sequential: bool,
    pub(crate) processing: bool,
    pub(crate) keepalive: bool,
    pub(crate) timeout_fixed: bool,

    pub(crate) read_timer: SocketTimer,
    pub(crate) connect_timer: SocketTimer,
    pub(crate) write_timeout: Duration,

    pub(crate) frames: Option<FrameBuffer>,
    pub(crate) sends: VecDeque<Box<SendRequest>>,
    pub(crate) tls: Option<TlsStream>,
    pub(crate) layer: Option<TlsLayer>,

    pub(crate) quota: Option<QuotaPermit>,
    pub(crate) io_task: bool,
}

impl SocketState {
    fn new(kind: SocketType, mgr: &ManagerInner) -> Self {
        let config = mgr.config();
        Self {
            stream: None,
            peer: None,
            local: None,
            children: Vec::new(),
            listen: None,
            inner_listener: None,
            recv_cb: None,
            accept_cb: None,
            connect_cb: None,
            recv_handle: None,
            reading: false,
            read_paused: false,
            sequential: false,
            processing: false,
            keepalive: false,
            timeout_fixed: false,
            read_timer: SocketTimer::default(),
            connect_timer: SocketTimer::default(),
            write_timeout: config.write_timeout,
            frames: match kind {
                SocketType::TcpDnsSocket | SocketType::TlsDnsSocket => {
                    Some(FrameBuffer::with_chunk(config.recv_chunk_size))
                }
                _ => None,
            },
            sends: VecDeque::new(),
            tls: None,
            layer: None,
            quota: None,
            io_task: false,
        }
    }
}

/// Reference-counted listener or stream socket
pub(crate) struct Socket {
    id: u64,
    kind: SocketType,
    tid: usize,
    client: bool,
    mgr: Arc<ManagerInner>,
    parent: Option<Arc<Socket>>,

    active: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    registered: AtomicBool,
    pub(crate) listening: AtomicBool,
    alpn_dot: AtomicBool,
    handles: AtomicUsize,
    next_slot: AtomicU64,
    pub(crate) live_children: AtomicUsize,

    wake: Notify,
    state: Mutex<SocketState>,
}

impl Socket {
    pub(crate) fn new(
        mgr: &Arc<ManagerInner>,
        kind: SocketType,
        tid: usize,
        client: bool,
        parent: Option<Arc<Socket>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: mgr.next_socket_id(),
            kind,
            tid,
            client,
            mgr: mgr.clone(),
            parent,
            active: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            alpn_dot: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
            next_slot: AtomicU64::new(0),
            live_children: AtomicUsize::new(0),
            wake: Notify::new(),
            state: Mutex::new(SocketState::new(kind, mgr)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> SocketType {
        self.kind
    }

    pub(crate) fn tid(&self) -> usize {
        self.tid
    }

    pub(crate) fn mgr(&self) -> &Arc<ManagerInner> {
        &self.mgr
    }

    pub(crate) fn parent(&self) -> Option<&Arc<Socket>> {
        self.parent.as_ref()
    }

    pub(crate) fn is_client(&self) -> bool {
        self.client
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn alpn_dot(&self) -> bool {
        self.alpn_dot.load(Ordering::Acquire)
    }

    pub(crate) fn set_alpn_dot(&self, dot: bool) {
        self.alpn_dot.store(dot, Ordering::Release);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Nudge the socket's I/O task to re-evaluate its interest
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Resolves once the socket was deactivated
    pub(crate) async fn wait_inactive(&self) {
        while self.is_active() {
            self.wake.notified().await;
        }
    }

    pub(crate) fn stream(&self) -> Option<Arc<TcpStream>> {
        self.state().stream.clone()
    }

    /// Account one more handle, returning its slot
    pub(crate) fn attach_handle(&self) -> u64 {
        self.handles.fetch_add(1, Ordering::AcqRel);
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    fn detach_handle(&self) -> usize {
        let prev = self.handles.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "handle count underflow");
        prev.saturating_sub(1)
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Track the socket in its worker's table
    pub(crate) fn register(self: &Arc<Self>) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.mgr.worker(self.tid).register(self);
            self.mgr.stats.incr(StatId::SocketsOpened);
        }
    }

    /// active -> closing; false if already inactive
    fn deactivate(&self) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.closing.store(true, Ordering::Release);
        self.wake();
        true
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tid", &self.tid)
            .field("active", &self.is_active())
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// A listening endpoint; stops listening when dropped
pub struct Listener {
    sock: Arc<Socket>,
    local: SocketAddr,
}

impl Listener {
    pub(crate) fn new(sock: Arc<Socket>, local: SocketAddr) -> Self {
        Self { sock, local }
    }

    /// Bound address, with the real port when listening on port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transport of the listener
    pub fn socket_type(&self) -> SocketType {
        self.sock.kind()
    }

    /// Whether the listener has not been stopped
    pub fn is_listening(&self) -> bool {
        self.sock.is_active()
    }

    /// Whether every per-worker socket finished closing
    pub fn is_closed(&self) -> bool {
        self.sock.is_closed()
    }

    /// Stop accepting; idempotent. Accepted connections stay open.
    pub fn stop(&self) {
        close_socket(&self.sock, NetError::Canceled);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("type", &self.sock.kind())
            .field("local", &self.local)
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Begin closing `sock`; a no-op when already inactive
pub(crate) fn close_socket(sock: &Arc<Socket>, reason: NetError) {
    let reason = if sock.mgr().is_closing() {
        NetError::ShuttingDown
    } else {
        reason
    };
    if !sock.deactivate() {
        return;
    }
    debug!("Closing {} socket {}: {}", sock.kind(), sock.id(), reason);

    match sock.kind() {
        kind if kind.is_listener() => close_listener(sock),
        SocketType::TlsSocket => tls::close(sock, reason),
        _ => close_stream(sock, reason),
    }
}

fn close_listener(sock: &Arc<Socket>) {
    sock.listening.store(false, Ordering::Release);

    if sock.parent().is_some() {
        // Per-worker child: its accept task notices and finishes the close
        let io_task = sock.state().io_task;
        if !io_task {
            finish_close(sock);
        }
        return;
    }

    let (children, inner) = {
        let mut st = sock.state();
        (st.children.clone(), st.inner_listener.take())
    };
    for child in &children {
        sock.mgr()
            .enqueue(child.tid(), NetEvent::StopListening(child.clone()));
    }
    drop(inner);
    if children.is_empty() {
        finish_close(sock);
    }
}

fn close_stream(sock: &Arc<Socket>, reason: NetError) {
    let mut st = sock.state();
    let connect_cb = st.connect_cb.take();
    let read = match st.recv_handle.take() {
        Some(handle) => st.recv_cb.clone().map(|cb| (cb, handle)),
        None => None,
    };
    st.reading = false;
    st.read_timer.stop();
    st.connect_timer.stop();
    let mut sends: Vec<_> = st.sends.drain(..).collect();
    let mut goodbye = Vec::new();
    if let Some(tls) = st.tls.as_mut() {
        sends.extend(tls.take_requests());
        goodbye = tls.close_notify();
    }
    let stream = st.stream.take();
    let quota = st.quota.take();
    let io_task = st.io_task;
    drop(st);

    if let Some(stream) = &stream {
        if !goodbye.is_empty() {
            if let Err(e) = stream.try_write(&goodbye) {
                debug!("Socket {} close_notify not sent: {}", sock.id(), e);
            }
        }
    }
    drop(stream);
    drop(quota);

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

    if io_task {
        sock.wake();
    } else {
        finish_close(sock);
    }
}

/// Mark the descriptor closed and release the worker's reference
pub(crate) fn finish_close(sock: &Arc<Socket>) {
    if sock.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    sock.active.store(false, Ordering::Release);
    sock.closing.store(false, Ordering::Release);
    trace!("Socket {} closed", sock.id());

    {
        let mut st = sock.state();
        st.stream = None;
        st.children.clear();
        st.listen = None;
        st.accept_cb = None;
        st.recv_cb = None;
        st.tls = None;
        st.layer = None;
        st.frames = None;
    }

    if sock.registered.swap(false, Ordering::AcqRel) {
        sock.mgr().unregister_socket(sock.tid(), sock.id());
        sock.mgr().stats.incr(StatId::SocketsClosed);
    }

    if let Some(parent) = sock.parent() {
        if parent.live_children.fetch_sub(1, Ordering::AcqRel) == 1 {
            finish_close(parent);
        }
    }
}

struct Interest {
    read: bool,
    write: bool,
    deadline: Option<Instant>,
}

fn io_interest(sock: &Socket) -> Interest {
    let st = sock.state();
    let mut deadline = earliest(st.read_timer.deadline(), st.connect_timer.deadline());
    deadline = earliest(deadline, st.sends.front().and_then(|req| req.deadline));

    let (read, write) = match sock.kind() {
        SocketType::TlsDnsSocket => {
            let (read, write, out) = tlsdns::interest(&st);
            deadline = earliest(deadline, out);
            (read, write)
        }
        _ => (
            st.reading && !st.read_paused && !st.processing,
            !st.sends.is_empty(),
        ),
    };
    Interest {
        read,
        write,
        deadline,
    }
}

/// Drive one connected stream socket until it closes
pub(crate) async fn stream_io_loop(sock: Arc<Socket>) {
    let mut paused = sock.mgr().worker(sock.tid()).subscribe_paused();

    loop {
        if !wait_unpaused(&sock, &mut paused).await {
            break;
        }
        let Some(stream) = sock.stream() else {
            break;
        };

        let interest = io_interest(&sock);
        let sleep_until = interest.deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            _ = sock.woken() => {}
            res = stream.readable(), if interest.read => match res {
                Ok(()) => on_readable(&sock, &stream),
                Err(e) => failed_read(&sock, map_io_err!(e)),
            },
            res = stream.writable(), if interest.write => match res {
                Ok(()) => on_writable(&sock, &stream),
                Err(e) => close_socket(&sock, map_io_err!(e)),
            },
            _ = tokio::time::sleep_until(sleep_until), if interest.deadline.is_some() => {
                on_deadline(&sock);
            }
            _ = paused.changed() => {}
        }
    }

    // Close any path that left the loop without deactivating
    close_socket(&sock, NetError::Canceled);
    finish_close(&sock);
}

/// Wait while the worker is paused; false once the socket is inactive
pub(crate) async fn wait_unpaused(sock: &Socket, paused: &mut watch::Receiver<bool>) -> bool {
    loop {
        let is_paused = *paused.borrow_and_update();
        if !sock.is_active() {
            return false;
        }
        if !is_paused {
            return true;
        }
        tokio::select! {
            res = paused.changed() => {
                if res.is_err() {
                    return false;
                }
            }
            _ = sock.woken() => {}
        }
    }
}

fn on_readable(sock: &Arc<Socket>, stream: &TcpStream) {
    let chunk = sock.mgr().config().recv_chunk_size;
    with_recv_buffer(chunk, |buf| match stream.try_read(buf) {
        Ok(0) => failed_read(sock, NetError::Eof),
        Ok(n) => on_data(sock, &buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => failed_read(sock, map_io_err!(e)),
    });
}

fn on_data(sock: &Arc<Socket>, data: &[u8]) {
    trace!("Socket {} read {} bytes", sock.id(), data.len());
    match sock.kind() {
        SocketType::TcpSocket => tcp::on_data(sock, data),
        SocketType::TcpDnsSocket => tcpdns::on_data(sock, data),
        SocketType::TlsDnsSocket => tlsdns::on_data(sock, data),
        _ => {}
    }
}

fn on_writable(sock: &Arc<Socket>, stream: &TcpStream) {
    match sock.kind() {
        SocketType::TlsDnsSocket => tlsdns::on_writable(sock, stream),
        _ => tcp::flush_sends(sock, stream),
    }
}

fn on_deadline(sock: &Arc<Socket>) {
    let now = Instant::now();
    let (connect, read, write) = {
        let st = sock.state();
        let write = st.sends.front().and_then(|req| req.deadline).is_some_and(|d| d <= now)
            || st.tls.as_ref().is_some_and(|tls| tls.out_expired(now));
        (
            st.connect_timer.expired(now),
            st.read_timer.expired(now),
            write,
        )
    };

    if connect {
        match sock.kind() {
            SocketType::TlsDnsSocket => tlsdns::fail(sock, NetError::TimedOut),
            _ => close_socket(sock, NetError::TimedOut),
        }
    } else if write {
        close_socket(sock, NetError::TimedOut);
    } else if read {
        failed_read(sock, NetError::TimedOut);
    }
}

/// Fail the pending read; closes the socket unless a client re-armed it on timeout
pub(crate) fn failed_read(sock: &Arc<Socket>, err: NetError) {
    if sock.kind() == SocketType::TlsDnsSocket && !tlsdns::is_established(sock) {
        tlsdns::fail(sock, err);
        return;
    }

    let read = {
        let mut st = sock.state();
        st.read_timer.stop();
        st.reading = false;
        match st.recv_handle.take() {
            Some(handle) => st.recv_cb.clone().map(|cb| (cb, handle)),
            None => None,
        }
    };

    if !err.is_eof_class() && !matches!(err, NetError::TimedOut | NetError::Canceled) {
        sock.mgr().stats.incr(StatId::RecvFailed);
    }
    if let Some((cb, handle)) = read {
        cb(&handle, Err(err));
    }

    // A client may retry after a timeout by reading again from the callback
    if err == NetError::TimedOut && sock.is_client() && sock.state().reading {
        return;
    }
    close_socket(sock, err);
}

/// Arm `cb` as the read callback of `handle`'s socket
pub(crate) fn start_read(handle: NmHandle, cb: RecvCb) {
    let sock = handle.socket().clone();
    if sock.kind() == SocketType::TlsSocket {
        tls::start_read(&sock, handle, cb);
        return;
    }
    if !sock.is_active() {
        cb(&handle, Err(inactive_reason(&sock)));
        return;
    }

    {
        let mut st = sock.state();
        st.recv_cb = Some(cb);
        st.recv_handle = Some(handle);
        st.reading = true;
        st.read_paused = false;
        if !st.processing {
            st.read_timer.start();
        }
    }

    if sock.kind().is_framed() {
        // Buffered messages are delivered from the queue, never inline
        sock.mgr().enqueue(sock.tid(), NetEvent::Process(sock.clone()));
    }
    sock.wake();
}

pub(crate) fn pause_read(sock: &Arc<Socket>) {
    if sock.kind() == SocketType::TlsSocket {
        tls::pause_read(sock);
        return;
    }
    let mut st = sock.state();
    st.read_paused = true;
    st.read_timer.stop();
    drop(st);
    sock.wake();
}

pub(crate) fn resume_read(sock: &Arc<Socket>) {
    if sock.kind() == SocketType::TlsSocket {
        tls::resume_read(sock);
        return;
    }
    let reading = {
        let mut st = sock.state();
        st.read_paused = false;
        if st.reading && !st.processing {
            st.read_timer.start();
        }
        st.reading
    };
    if reading && sock.kind().is_framed() {
        sock.mgr().enqueue(sock.tid(), NetEvent::Process(sock.clone()));
    }
    sock.wake();
}

/// Fail the current read with EOF, leaving the connection open
pub(crate) fn cancel_read(sock: &Arc<Socket>) {
    if sock.kind() == SocketType::TlsSocket {
        tls::pause_read(sock);
    }
    let read = {
        let mut st = sock.state();
        st.read_timer.stop();
        st.reading = false;
        match st.recv_handle.take() {
            Some(handle) => st.recv_cb.clone().map(|cb| (cb, handle)),
            None => None,
        }
    };
    if let Some((cb, handle)) = read {
        cb(&handle, Err(NetError::Eof));
    }
    sock.wake();
}

pub(crate) fn send(req: Box<SendRequest>) {
    let Some(sock) = req.handle.as_ref().map(|h| h.socket().clone()) else {
        return;
    };
    match sock.kind() {
        SocketType::TcpSocket => tcp::send_direct(&sock, req),
        SocketType::TcpDnsSocket => tcpdns::send(&sock, req),
        SocketType::TlsDnsSocket => tlsdns::send(&sock, req),
        SocketType::TlsSocket => tls::send(&sock, req),
        _ => sock.mgr().complete_send(req, Err(NetError::NotConnected)),
    }
}

/// Resume message delivery after a state change
pub(crate) fn process(sock: &Arc<Socket>) {
    if !sock.is_active() {
        return;
    }
    match sock.kind() {
        SocketType::TcpDnsSocket => tcpdns::process_sock_buffer(sock),
        SocketType::TlsDnsSocket => tlsdns::cycle(sock),
        SocketType::TlsSocket => tls::cycle(sock),
        _ => {}
    }
}

/// The last clone of one handle went away
pub(crate) fn handle_detached(sock: &Arc<Socket>, message: bool) {
    let remaining = sock.detach_handle();

    if message {
        let resume = {
            let mut st = sock.state();
            std::mem::replace(&mut st.processing, false)
        };
        if resume {
            process(sock);
            sock.wake();
        }
    }

    if remaining == 0 && sock.is_active() && !sock.kind().is_listener() {
        close_socket(sock, NetError::Canceled);
    }
}

pub(crate) fn configure(sock: &Arc<Socket>, option: SocketOption) {
    if sock.kind() == SocketType::TlsSocket {
        tls::configure(sock, option);
        return;
    }

    let mut st = sock.state();
    match option {
        SocketOption::ReadTimeout(timeout) => {
            st.read_timer.set_timeout(timeout);
            st.timeout_fixed = true;
        }
        SocketOption::Keepalive(enabled) => {
            st.keepalive = enabled;
            if !st.timeout_fixed {
                let t = sock.mgr().timeouts();
                st.read_timer
                    .set_timeout(Some(if enabled { t.keepalive } else { t.idle }));
            }
        }
        SocketOption::WriteTimeout(timeout) => st.write_timeout = timeout,
        SocketOption::Sequential => st.sequential = true,
    }
    drop(st);
    sock.wake();
}

/// Error reported to operations on a socket that is no longer active
pub(crate) fn inactive_reason(sock: &Socket) -> NetError {
    if sock.mgr().is_closing() {
        NetError::ShuttingDown
    } else {
        NetError::Canceled
    }
}
