//! TCP listen, accept, connect and send.
//!
//! Listening creates one child socket per worker. With load-balanced
//! sockets every child binds its own `SO_REUSEPORT` socket, otherwise the
//! first child binds and the others accept on duplicates of its descriptor.
//! The first child always binds alone so that port 0 resolves once and the
//! remaining children reuse the real port.

use crate::error::{LogLimiter, NetError, NetResult};
use crate::event::{ConnectRequest, NetEvent};
use crate::handle::{AcceptCb, ConnectCb, NmHandle, RecvCb};
use crate::manager::ManagerInner;
use crate::map_io_err;
use crate::quota::{Quota, QuotaPermit};
use crate::request::SendRequest;
use crate::socket::{
    self, close_socket, finish_close, inactive_reason, Listener, Socket, SocketType,
};
use crate::stats::StatId;
use crate::timer::SocketTimer;
use crate::tlsdns;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

static QUOTA_LOG: LogLimiter = LogLimiter::new();
static ACCEPT_LOG: LogLimiter = LogLimiter::new();

/// How a listener child obtains its descriptor
pub(crate) enum BindMode {
    /// Bind a fresh `SO_REUSEPORT` socket
    Own,
    /// Bind and hand a duplicate to the other children
    Export,
    /// Accept on a duplicate of the first child's descriptor
    Shared(std::net::TcpListener),
}

/// Parameters handed to a child listener by `StartListening`
pub(crate) struct ListenParams {
    addr: SocketAddr,
    backlog: u32,
    mode: BindMode,
    barrier: Arc<ListenBarrier>,
    quota: Option<Quota>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

struct BarrierState {
    remaining: usize,
    error: Option<NetError>,
    bound: Option<SocketAddr>,
    exported: Option<std::net::TcpListener>,
}

/// Blocks the listening thread until every started child reported
pub(crate) struct ListenBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl ListenBarrier {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BarrierState {
                remaining: count,
                error: None,
                bound: None,
                exported: None,
            }),
            cv: Condvar::new(),
        })
    }

    fn report(&self, result: NetResult<SocketAddr>, exported: Option<std::net::TcpListener>) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(addr) => {
                st.bound.get_or_insert(addr);
            }
            // Only the first failure is reported
            Err(err) => {
                st.error.get_or_insert(err);
            }
        }
        if exported.is_some() {
            st.exported = exported;
        }
        st.remaining = st.remaining.saturating_sub(1);
        self.cv.notify_all();
    }

    fn wait(&self) -> NetResult<(SocketAddr, Option<std::net::TcpListener>)> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut st = self
            .cv
            .wait_while(guard, |st| st.remaining > 0)
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = st.error {
            return Err(err);
        }
        let bound = st.bound.ok_or(NetError::Unexpected)?;
        Ok((bound, st.exported.take()))
    }
}

/// Start listening on every worker; all or nothing
#[allow(clippy::too_many_arguments)]
pub(crate) fn listen(
    mgr: &Arc<ManagerInner>,
    kind: SocketType,
    addr: SocketAddr,
    recv_cb: Option<RecvCb>,
    accept_cb: AcceptCb,
    backlog: u32,
    quota: Option<Quota>,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> NetResult<Listener> {
    if mgr.is_closing() {
        return Err(NetError::ShuttingDown);
    }
    // The barrier would block the worker that has to run the first child
    if mgr.current_tid().is_some() {
        return Err(NetError::Unexpected);
    }

    let nworkers = mgr.nworkers();
    let parent = Socket::new(mgr, kind, 0, false, None);
    parent.live_children.store(nworkers, Ordering::Release);

    let children: Vec<_> = (0..nworkers)
        .map(|tid| {
            let child = Socket::new(mgr, kind, tid, false, Some(parent.clone()));
            {
                let mut st = child.state();
                st.recv_cb = recv_cb.clone();
                st.accept_cb = Some(accept_cb.clone());
            }
            child
        })
        .collect();
    parent.state().children = children.clone();

    let load_balance = mgr.config().load_balance_sockets && cfg!(unix);
    let params = |addr, mode, barrier: &Arc<ListenBarrier>| ListenParams {
        addr,
        backlog,
        mode,
        barrier: barrier.clone(),
        quota: quota.clone(),
        tls: tls.clone(),
    };

    // First child alone: resolves the address and, unless load balancing,
    // exports the descriptor the others will share
    let first = ListenBarrier::new(1);
    let mode = if load_balance {
        BindMode::Own
    } else {
        BindMode::Export
    };
    children[0].state().listen = Some(params(addr, mode, &first));
    mgr.enqueue(0, NetEvent::StartListening(children[0].clone()));

    let (bound, shared) = match first.wait() {
        Ok(res) => res,
        Err(err) => {
            close_socket(&parent, NetError::Canceled);
            return Err(err);
        }
    };

    if nworkers > 1 {
        let rest = ListenBarrier::new(nworkers - 1);
        for child in &children[1..] {
            let mode = match &shared {
                None => BindMode::Own,
                Some(listener) => match listener.try_clone() {
                    Ok(dup) => BindMode::Shared(dup),
                    Err(e) => {
                        rest.report(Err(map_io_err!(e)), None);
                        continue;
                    }
                },
            };
            child.state().listen = Some(params(bound, mode, &rest));
            mgr.enqueue(child.tid(), NetEvent::StartListening(child.clone()));
        }
        drop(shared);

        if let Err(err) = rest.wait() {
            close_socket(&parent, NetError::Canceled);
            return Err(err);
        }
    }

    parent.listening.store(true, Ordering::Release);
    parent.state().local = Some(bound);
    info!("Listening for {} on {}", kind.stream_type(), bound);
    Ok(Listener::new(parent, bound))
}

fn bind(addr: SocketAddr, backlog: u32, mode: BindMode) -> io::Result<(TcpListener, Option<std::net::TcpListener>)> {
    let (own, export) = match mode {
        BindMode::Shared(std) => {
            std.set_nonblocking(true)?;
            return Ok((TcpListener::from_std(std)?, None));
        }
        BindMode::Own => (true, false),
        BindMode::Export => (false, true),
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    if own {
        socket.set_reuseport(true)?;
    }
    #[cfg(not(unix))]
    let _ = own;
    socket.bind(addr)?;
    let listener = socket.listen(backlog)?;

    if !export {
        return Ok((listener, None));
    }
    let std = listener.into_std()?;
    let dup = std.try_clone()?;
    std.set_nonblocking(true)?;
    Ok((TcpListener::from_std(std)?, Some(dup)))
}

/// Bind one listener child on its worker and start its accept task
pub(crate) fn start_listening(sock: &Arc<Socket>) {
    let Some(params) = sock.state().listen.take() else {
        return;
    };
    let ListenParams {
        addr,
        backlog,
        mode,
        barrier,
        quota,
        tls,
    } = params;

    if !sock.is_active() {
        barrier.report(Err(inactive_reason(sock)), None);
        finish_close(sock);
        return;
    }

    let bound = bind(addr, backlog, mode).and_then(|(listener, dup)| {
        let local = listener.local_addr()?;
        Ok((listener, dup, local))
    });
    let (listener, dup, local) = match bound {
        Ok(res) => res,
        Err(e) => {
            let err = map_io_err!(e);
            warn!("Worker {} failed to listen on {}: {}", sock.tid(), addr, err);
            barrier.report(Err(err), None);
            finish_close(sock);
            return;
        }
    };

    sock.listening.store(true, Ordering::Release);
    sock.register();
    {
        let mut st = sock.state();
        st.local = Some(local);
        st.io_task = true;
    }
    debug!("Worker {} listening on {}", sock.tid(), local);
    barrier.report(Ok(local), dup);

    tokio::spawn(accept_loop(sock.clone(), listener, quota, tls));
}

/// Wait for a quota slot; `None` once the listener is closing
async fn wait_for_quota(sock: &Arc<Socket>, quota: &Quota) -> Option<QuotaPermit> {
    sock.mgr().stats.incr(StatId::QuotaDeferred);
    if QUOTA_LOG.allow(Duration::from_secs(1)) {
        warn!(
            "Connection quota reached ({} in use), deferring accepts",
            quota.in_use()
        );
    }

    let (tx, rx) = oneshot::channel();
    if let Some(permit) = quota.acquire_or_wait(move |permit| {
        // A closed listener drops the permit, which passes it on
        let _ = tx.send(permit);
    }) {
        return Some(permit);
    }

    tokio::select! {
        res = rx => res.ok(),
        _ = sock.wait_inactive() => None,
    }
}

/// Hold an accepted stream until the quota frees a slot
async fn defer_accept(
    sock: Arc<Socket>,
    quota: Quota,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
) {
    match wait_for_quota(&sock, &quota).await {
        Some(permit) if sock.is_active() => {
            accept_connection(&sock, stream, peer, Some(permit), tls.as_ref());
        }
        _ => debug!("Deferred connection from {} canceled, listener closing", peer),
    }
}

async fn accept_loop(
    sock: Arc<Socket>,
    listener: TcpListener,
    quota: Option<Quota>,
    tls: Option<Arc<rustls::ServerConfig>>,
) {
    let mut paused = sock.mgr().worker(sock.tid()).subscribe_paused();
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        if !socket::wait_unpaused(&sock, &mut paused).await {
            break;
        }

        let res = tokio::select! {
            res = listener.accept() => Some(res),
            _ = sock.woken() => None,
            _ = paused.changed() => None,
        };

        match res {
            None => {}
            Some(Ok((stream, peer))) => {
                backoff = ACCEPT_BACKOFF_MIN;
                // Accept first; a full quota parks the stream, not the listener
                match &quota {
                    None => accept_connection(&sock, stream, peer, None, tls.as_ref()),
                    Some(quota) => match quota.try_acquire() {
                        Some(permit) => {
                            accept_connection(&sock, stream, peer, Some(permit), tls.as_ref())
                        }
                        None => {
                            tokio::spawn(defer_accept(
                                sock.clone(),
                                quota.clone(),
                                stream,
                                peer,
                                tls.clone(),
                            ));
                        }
                    },
                }
            }
            Some(Err(e)) => {
                let err = map_io_err!(e);
                sock.mgr().stats.incr(StatId::AcceptFailed);
                match err {
                    NetError::TooManyOpenFiles | NetError::NoResources | NetError::NoMemory => {
                        if ACCEPT_LOG.allow(Duration::from_secs(1)) {
                            warn!("Accept failed on worker {}: {}", sock.tid(), err);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = sock.wait_inactive() => {}
                        }
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                    _ => debug!("Accept failed on worker {}: {}", sock.tid(), err),
                }
            }
        }
    }

    drop(listener);
    finish_close(&sock);
}

fn accept_connection(
    lsock: &Arc<Socket>,
    stream: TcpStream,
    peer: SocketAddr,
    permit: Option<QuotaPermit>,
    tls: Option<&Arc<rustls::ServerConfig>>,
) {
    let mgr = lsock.mgr();
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            mgr.stats.incr(StatId::AcceptFailed);
            debug!("Dropping accepted connection from {}: {}", peer, map_io_err!(e));
            return;
        }
    };
    if mgr.config().tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
    }

    let kind = lsock.kind().stream_type();
    let sock = Socket::new(mgr, kind, lsock.tid(), false, None);
    let (recv_cb, accept_cb) = {
        let st = lsock.state();
        (st.recv_cb.clone(), st.accept_cb.clone())
    };
    {
        let mut st = sock.state();
        st.stream = Some(Arc::new(stream));
        st.peer = Some(peer);
        st.local = Some(local);
        st.recv_cb = recv_cb;
        st.accept_cb = accept_cb.clone();
        st.quota = permit;
        st.read_timer = SocketTimer::new(Some(mgr.timeouts().init));
        st.io_task = true;
    }
    sock.register();
    mgr.stats.incr(StatId::Accepted);
    debug!("Accepted {} connection from {} on {}", kind, peer, local);
    tokio::spawn(socket::stream_io_loop(sock.clone()));

    match (kind, tls) {
        (SocketType::TlsDnsSocket, Some(config)) => {
            // The accept callback runs once the handshake completes
            if let Err(err) = tlsdns::accept(&sock, config.clone()) {
                close_socket(&sock, err);
            }
        }
        _ => {
            let handle = NmHandle::new(&sock, peer, local, false);
            let res = match &accept_cb {
                Some(cb) => cb(&handle, Ok(())),
                None => Ok(()),
            };
            match res {
                Ok(()) if kind == SocketType::TcpDnsSocket => {
                    let mut st = sock.state();
                    st.recv_handle = Some(handle);
                    st.reading = true;
                    st.read_timer.start();
                }
                Ok(()) => {}
                Err(err) => {
                    debug!("Connection from {} refused by accept callback: {}", peer, err);
                    close_socket(&sock, err);
                }
            }
            sock.wake();
        }
    }
}

/// Start an outgoing connection on worker `tid`, or any worker
#[allow(clippy::too_many_arguments)]
pub(crate) fn connect(
    mgr: &Arc<ManagerInner>,
    kind: SocketType,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    cb: ConnectCb,
    timeout: Duration,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
    tid: Option<usize>,
) {
    let tid = tid.unwrap_or_else(|| mgr.pick_worker());
    let sock = Socket::new(mgr, kind, tid, true, None);
    // A closing manager fails the request on the worker, never on the caller
    let req = Box::new(ConnectRequest {
        sock,
        local,
        peer,
        timeout,
        cb,
        tls,
    });
    mgr.maybe_enqueue(tid, NetEvent::Connect(req));
}

pub(crate) fn start_connect(req: Box<ConnectRequest>) {
    let ConnectRequest {
        sock,
        local,
        peer,
        timeout,
        cb,
        tls,
    } = *req;

    if sock.mgr().is_closing() {
        cb(Err(NetError::ShuttingDown));
        finish_close(&sock);
        return;
    }

    sock.register();
    {
        let mut st = sock.state();
        st.connect_cb = Some(cb);
        st.peer = Some(peer);
        st.connect_timer = SocketTimer::new(Some(timeout));
        st.connect_timer.start();
        st.io_task = true;
    }
    tokio::spawn(connect_task(sock, local, peer, tls));
}

async fn dial(local: Option<SocketAddr>, peer: SocketAddr) -> NetResult<TcpStream> {
    let socket = if peer.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| map_io_err!(e))?;

    if let Some(local) = local {
        socket.set_reuseaddr(true).map_err(|e| map_io_err!(e))?;
        socket.bind(local).map_err(|e| map_io_err!(e))?;
    }
    socket.connect(peer).await.map_err(|e| map_io_err!(e))
}

async fn connect_task(
    sock: Arc<Socket>,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
) {
    let deadline = sock.state().connect_timer.deadline();
    let sleep_until = deadline.unwrap_or_else(Instant::now);

    let res = tokio::select! {
        res = dial(local, peer) => Some(res),
        _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
            Some(Err(NetError::TimedOut))
        }
        // Closed meanwhile; the close already failed the callback
        _ = sock.wait_inactive() => None,
    };

    match res {
        Some(Ok(stream)) => {
            if connected(&sock, stream, tls) {
                socket::stream_io_loop(sock).await;
            } else {
                finish_close(&sock);
            }
        }
        None => finish_close(&sock),
        Some(Err(err)) => {
            debug!("Connect to {} failed: {}", peer, err);
            close_socket(&sock, err);
            finish_close(&sock);
        }
    }
}

/// Install a freshly connected stream; false if the socket went away
fn connected(
    sock: &Arc<Socket>,
    stream: TcpStream,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
) -> bool {
    if !sock.is_active() {
        return false;
    }
    let mgr = sock.mgr();
    if mgr.config().tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on socket {}: {}", sock.id(), e);
        }
    }
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            close_socket(sock, map_io_err!(e));
            return false;
        }
    };

    let peer = {
        let mut st = sock.state();
        st.stream = Some(Arc::new(stream));
        st.local = Some(local);
        st.peer
    };
    let Some(peer) = peer else {
        close_socket(sock, NetError::Unexpected);
        return false;
    };

    if let Some((config, name)) = tls {
        // Connect timer keeps running until the handshake completes
        if let Err(err) = tlsdns::connect(sock, config, name) {
            close_socket(sock, err);
        }
        return true;
    }

    let cb = {
        let mut st = sock.state();
        st.connect_timer.stop();
        st.read_timer = SocketTimer::new(Some(mgr.timeouts().idle));
        st.connect_cb.take()
    };
    mgr.stats.incr(StatId::Connected);
    debug!("Connected {} to {} from {}", sock.kind(), peer, local);
    if let Some(cb) = cb {
        cb(Ok(NmHandle::new(sock, peer, local, false)));
    }
    true
}

/// Deliver a raw chunk to the read callback
pub(crate) fn on_data(sock: &Arc<Socket>, data: &[u8]) {
    let read = {
        let mut st = sock.state();
        if !st.reading {
            return;
        }
        st.read_timer.restart();
        match (&st.recv_cb, &st.recv_handle) {
            (Some(cb), Some(handle)) => Some((cb.clone(), handle.clone())),
            _ => None,
        }
    };
    if let Some((cb, handle)) = read {
        cb(&handle, Ok(data));
    }
}

fn write_deadline(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Write now if possible, queue the remainder otherwise
pub(crate) fn send_direct(sock: &Arc<Socket>, mut req: Box<SendRequest>) {
    let mgr = sock.mgr();
    if !sock.is_active() {
        mgr.complete_send(req, Err(inactive_reason(sock)));
        return;
    }

    let mut st = sock.state();
    let Some(stream) = st.stream.clone() else {
        drop(st);
        mgr.complete_send(req, Err(NetError::NotConnected));
        return;
    };
    if !st.sends.is_empty() {
        req.deadline = write_deadline(st.write_timeout);
        st.sends.push_back(req);
        return;
    }

    loop {
        match stream.try_write(req.remaining()) {
            Ok(n) if n > 0 || req.is_done() => {
                req.advance(n);
                if req.is_done() {
                    drop(st);
                    mgr.complete_send(req, Ok(()));
                    return;
                }
            }
            Ok(_) => {
                req.deadline = write_deadline(st.write_timeout);
                st.sends.push_back(req);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                req.deadline = write_deadline(st.write_timeout);
                st.sends.push_back(req);
                break;
            }
            Err(e) => {
                drop(st);
                let err = map_io_err!(e);
                mgr.complete_send(req, Err(err));
                close_socket(sock, err);
                return;
            }
        }
    }
    drop(st);
    sock.wake();
}

/// Continue queued writes once the stream is writable
pub(crate) fn flush_sends(sock: &Arc<Socket>, stream: &TcpStream) {
    loop {
        let mut st = sock.state();
        let Some(req) = st.sends.front_mut() else {
            return;
        };
        match stream.try_write(req.remaining()) {
            Ok(n) => {
                req.advance(n);
                if !req.is_done() {
                    if n == 0 {
                        return;
                    }
                    continue;
                }
                let done = st.sends.pop_front();
                drop(st);
                if let Some(done) = done {
                    sock.mgr().complete_send(done, Ok(()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                drop(st);
                close_socket(sock, map_io_err!(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_barrier_first_error_wins() {
        let barrier = ListenBarrier::new(3);
        let b = barrier.clone();
        let reporter = thread::spawn(move || {
            b.report(Ok("127.0.0.1:53".parse().unwrap()), None);
            b.report(Err(NetError::AddressInUse), None);
            b.report(Err(NetError::NoPermission), None);
        });
        assert_eq!(barrier.wait().err(), Some(NetError::AddressInUse));
        reporter.join().unwrap();
    }

    #[test]
    fn test_barrier_bound_address() {
        let barrier = ListenBarrier::new(1);
        barrier.report(Ok("127.0.0.1:5300".parse().unwrap()), None);
        let (bound, exported) = barrier.wait().unwrap();
        assert_eq!(bound.port(), 5300);
        assert!(exported.is_none());
    }

    #[test]
    fn test_write_deadline() {
        assert!(write_deadline(Duration::ZERO).is_none());
        assert!(write_deadline(Duration::from_secs(1)).is_some());
    }
}
