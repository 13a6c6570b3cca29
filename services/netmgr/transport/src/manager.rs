//! The network manager: worker registry and application entry points.

use crate::config::{NetConfig, TimeoutCell, Timeouts};
use crate::error::{NetError, NetResult};
use crate::event::NetEvent;
use crate::handle::{AcceptCb, NmHandle, RecvCb};
use crate::map_io_err;
use crate::quota::Quota;
use crate::request::{RequestPool, SendRequest};
use crate::socket::{Listener, SocketType};
use crate::stats::{NetStats, StatId, StatsSnapshot};
use crate::tlsctx::{TlsClientCtx, TlsServerCtx};
use crate::worker::{self, WorkerShared};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// How long `destroy` waits for sockets to finish closing
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the manager, its workers and every socket
pub(crate) struct ManagerInner {
    id: u64,
    config: NetConfig,
    workers: Vec<WorkerShared>,
    timeouts: TimeoutCell,
    closing: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    paused_workers: Mutex<usize>,
    pause_cv: Condvar,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
    requests: RequestPool,
    pub(crate) stats: NetStats,
    next_socket: AtomicU64,
    next_worker: AtomicUsize,
}

impl ManagerInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &NetConfig {
        &self.config
    }

    pub(crate) fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker(&self, tid: usize) -> &WorkerShared {
        &self.workers[tid]
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        self.timeouts.load()
    }

    pub(crate) fn requests(&self) -> &RequestPool {
        &self.requests
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    /// Worker index of the calling thread, if it is one of ours
    pub(crate) fn current_tid(&self) -> Option<usize> {
        worker::current_worker(self.id)
    }

    /// Round-robin worker choice for new outgoing connections
    pub(crate) fn pick_worker(&self) -> usize {
        self.current_tid()
            .unwrap_or_else(|| self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len())
    }

    /// Queue `ev` to worker `tid`
    pub(crate) fn enqueue(&self, tid: usize, ev: NetEvent) {
        if let Err(ev) = self.workers[tid].send(ev) {
            if self.stopped.load(Ordering::Acquire) {
                ev.cancel(NetError::ShuttingDown);
            } else {
                panic!("netmgr: unable to queue {:?} to live worker {}", ev, tid);
            }
        }
    }

    /// Run `ev` inline when already on worker `tid`, otherwise queue it
    pub(crate) fn maybe_enqueue(self: &Arc<Self>, tid: usize, ev: NetEvent) {
        if self.current_tid() == Some(tid) {
            worker::dispatch(self, tid, ev);
        } else {
            self.enqueue(tid, ev);
        }
    }

    /// Finish a send request and return it to the pool
    pub(crate) fn complete_send(&self, req: Box<SendRequest>, result: NetResult<()>) {
        self.stats.incr(match result {
            Ok(()) => StatId::Sent,
            Err(_) => StatId::SendFailed,
        });
        self.requests.complete(req, result);
    }

    pub(crate) fn worker_paused(&self, tid: usize) {
        self.workers[tid].set_paused(true);
        let mut paused = self
            .paused_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *paused += 1;
        self.pause_cv.notify_all();
    }

    pub(crate) fn worker_resumed(&self, tid: usize) {
        self.workers[tid].set_paused(false);
        let mut paused = self
            .paused_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *paused = paused.saturating_sub(1);
        self.pause_cv.notify_all();
    }

    fn wait_paused_workers(&self, want: usize) {
        let guard = self
            .paused_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .pause_cv
            .wait_while(guard, |paused| *paused != want)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn open_sockets(&self) -> usize {
        self.workers.iter().map(WorkerShared::socket_count).sum()
    }

    /// Drop a closed socket from worker `tid` and wake a draining `destroy`
    pub(crate) fn unregister_socket(&self, tid: usize, id: u64) {
        self.workers[tid].unregister(id);
        let _guard = self
            .drain_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.drain_cv.notify_all();
    }

    /// Wait up to `timeout` for every socket to close; returns how many remain
    fn wait_drained(&self, timeout: Duration) -> usize {
        let guard = self
            .drain_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .drain_cv
            .wait_timeout_while(guard, timeout, |_| self.open_sockets() > 0)
            .unwrap_or_else(PoisonError::into_inner);
        self.open_sockets()
    }
}

/// Multi-threaded network I/O manager
pub struct NetManager {
    inner: Arc<ManagerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetManager {
    /// Start a manager with `config.workers` worker threads
    pub fn new(config: NetConfig) -> NetResult<Self> {
        config.validate()?;

        let nworkers = config.workers;
        let mut workers = Vec::with_capacity(nworkers);
        let mut queues = Vec::with_capacity(nworkers);
        for tid in 0..nworkers {
            let (shared, q) = WorkerShared::new(tid);
            workers.push(shared);
            queues.push(q);
        }

        let inner = Arc::new(ManagerInner {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            timeouts: TimeoutCell::new(config.timeouts),
            requests: RequestPool::new(config.request_pool_size),
            config,
            workers,
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            paused_workers: Mutex::new(0),
            pause_cv: Condvar::new(),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            stats: NetStats::default(),
            next_socket: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
        });

        let mgr = Self {
            inner: inner.clone(),
            threads: Mutex::new(Vec::with_capacity(nworkers)),
        };

        for (tid, q) in queues.into_iter().enumerate() {
            let started = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .and_then(|rt| worker::spawn(inner.clone(), tid, q, rt));
            match started {
                Ok(thread) => mgr
                    .threads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(thread),
                Err(e) => {
                    // Workers never started have no queue to receive from
                    inner.stopped.store(true, Ordering::Release);
                    return Err(map_io_err!(e));
                }
            }
        }

        info!("Network manager started with {} workers", nworkers);
        Ok(mgr)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.inner.nworkers()
    }

    /// Configuration the manager was started with
    pub fn config(&self) -> &NetConfig {
        self.inner.config()
    }

    /// Current timeouts
    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts()
    }

    /// Replace the timeouts; applies to reads armed from now on
    pub fn set_timeouts(&self, timeouts: Timeouts) {
        self.inner.timeouts.store(timeouts);
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop every worker from processing normal events and socket I/O.
    ///
    /// Blocks until all workers acknowledged. Must not be called from a
    /// worker thread.
    pub fn pause(&self) -> NetResult<()> {
        if self.inner.current_tid().is_some() {
            return Err(NetError::Unexpected);
        }
        if self.inner.paused.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for tid in 0..self.inner.nworkers() {
            self.inner.enqueue(tid, NetEvent::Pause);
        }
        self.inner.wait_paused_workers(self.inner.nworkers());
        debug!("Network manager paused");
        Ok(())
    }

    /// Undo [`pause`](Self::pause)
    pub fn resume(&self) -> NetResult<()> {
        if self.inner.current_tid().is_some() {
            return Err(NetError::Unexpected);
        }
        if !self.inner.paused.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for tid in 0..self.inner.nworkers() {
            self.inner.enqueue(tid, NetEvent::Resume);
        }
        self.inner.wait_paused_workers(0);
        debug!("Network manager resumed");
        Ok(())
    }

    /// Close every socket; new listen and connect calls fail with `ShuttingDown`
    pub fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Network manager shutting down");
        for tid in 0..self.inner.nworkers() {
            self.inner.enqueue(tid, NetEvent::Shutdown);
        }
    }

    /// Shut down, wait for sockets to close and stop the workers
    pub fn destroy(self) {
        // Drop does the work
    }

    fn stop_workers(&self) {
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if threads.is_empty() {
            return;
        }

        if self.inner.paused.load(Ordering::Acquire) {
            let _ = self.resume();
        }
        self.shutdown();

        let on_worker = self.inner.current_tid().is_some();
        if !on_worker {
            let left = self.inner.wait_drained(DRAIN_TIMEOUT);
            if left > 0 {
                warn!("Stopping workers with {} sockets still open", left);
            }
        }

        self.inner.stopped.store(true, Ordering::Release);
        for tid in 0..self.inner.nworkers() {
            self.inner.enqueue(tid, NetEvent::Stop);
        }

        if on_worker {
            warn!("Network manager dropped on a worker thread; not joining workers");
            return;
        }
        for thread in threads {
            let _ = thread.join();
        }
        info!("Network manager stopped");
    }

    /// Listen for plain TCP connections.
    ///
    /// `accept_cb` receives a handle per connection; reading starts when
    /// the application calls [`NmHandle::read`].
    pub fn listen_tcp<A>(
        &self,
        addr: SocketAddr,
        accept_cb: A,
        backlog: u32,
        quota: Option<Quota>,
    ) -> NetResult<Listener>
    where
        A: Fn(&NmHandle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
    {
        crate::tcp::listen(
            &self.inner,
            SocketType::TcpListener,
            addr,
            None,
            Arc::new(accept_cb),
            backlog,
            quota,
            None,
        )
    }

    /// Listen for DNS-over-TCP connections; `recv_cb` fires once per message
    pub fn listen_tcpdns<R, A>(
        &self,
        addr: SocketAddr,
        recv_cb: R,
        accept_cb: A,
        backlog: u32,
        quota: Option<Quota>,
    ) -> NetResult<Listener>
    where
        R: Fn(&NmHandle, NetResult<&[u8]>) + Send + Sync + 'static,
        A: Fn(&NmHandle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
    {
        let recv_cb: RecvCb = Arc::new(recv_cb);
        let accept_cb: AcceptCb = Arc::new(accept_cb);
        crate::tcp::listen(
            &self.inner,
            SocketType::TcpDnsListener,
            addr,
            Some(recv_cb),
            accept_cb,
            backlog,
            quota,
            None,
        )
    }

    /// Listen for TLS connections layered over TCP
    pub fn listen_tls<A>(
        &self,
        addr: SocketAddr,
        accept_cb: A,
        backlog: u32,
        quota: Option<Quota>,
        ctx: &TlsServerCtx,
    ) -> NetResult<Listener>
    where
        A: Fn(&NmHandle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
    {
        crate::tls::listen(&self.inner, addr, Arc::new(accept_cb), backlog, quota, ctx)
    }

    /// Listen for DNS-over-TLS connections; `recv_cb` fires once per message
    pub fn listen_tlsdns<R, A>(
        &self,
        addr: SocketAddr,
        recv_cb: R,
        accept_cb: A,
        backlog: u32,
        quota: Option<Quota>,
        ctx: &TlsServerCtx,
    ) -> NetResult<Listener>
    where
        R: Fn(&NmHandle, NetResult<&[u8]>) + Send + Sync + 'static,
        A: Fn(&NmHandle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
    {
        let recv_cb: RecvCb = Arc::new(recv_cb);
        let accept_cb: AcceptCb = Arc::new(accept_cb);
        crate::tcp::listen(
            &self.inner,
            SocketType::TlsDnsListener,
            addr,
            Some(recv_cb),
            accept_cb,
            backlog,
            quota,
            Some(ctx.config()),
        )
    }

    /// Open a plain TCP connection; `cb` fires exactly once
    pub fn connect_tcp<C>(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: C,
        timeout: Duration,
    ) where
        C: FnOnce(NetResult<NmHandle>) + Send + 'static,
    {
        crate::tcp::connect(
            &self.inner,
            SocketType::TcpSocket,
            local,
            peer,
            Box::new(cb),
            timeout,
            None,
            None,
        );
    }

    /// Open a DNS-over-TCP connection; `cb` fires exactly once
    pub fn connect_tcpdns<C>(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: C,
        timeout: Duration,
    ) where
        C: FnOnce(NetResult<NmHandle>) + Send + 'static,
    {
        crate::tcp::connect(
            &self.inner,
            SocketType::TcpDnsSocket,
            local,
            peer,
            Box::new(cb),
            timeout,
            None,
            None,
        );
    }

    /// Open a TLS connection layered over TCP; `cb` fires after the handshake
    pub fn connect_tls<C>(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: C,
        timeout: Duration,
        ctx: &TlsClientCtx,
    ) where
        C: FnOnce(NetResult<NmHandle>) + Send + 'static,
    {
        crate::tls::connect(&self.inner, local, peer, Box::new(cb), timeout, ctx);
    }

    /// Open a DNS-over-TLS connection; `cb` fires after the handshake
    pub fn connect_tlsdns<C>(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: C,
        timeout: Duration,
        ctx: &TlsClientCtx,
    ) where
        C: FnOnce(NetResult<NmHandle>) + Send + 'static,
    {
        crate::tcp::connect(
            &self.inner,
            SocketType::TlsDnsSocket,
            local,
            peer,
            Box::new(cb),
            timeout,
            Some((ctx.config(), ctx.server_name_for(peer))),
            None,
        );
    }
}

impl Drop for NetManager {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

impl std::fmt::Debug for NetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetManager")
            .field("id", &self.inner.id)
            .field("workers", &self.inner.nworkers())
            .field("closing", &self.inner.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;

    fn config(workers: usize) -> NetConfig {
        NetConfig::default().with_workers(workers)
    }

    #[test]
    fn test_start_stop() {
        let mgr = NetManager::new(config(2)).unwrap();
        assert_eq!(mgr.workers(), 2);
        assert_eq!(mgr.stats().active_sockets, 0);
        mgr.destroy();
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(NetManager::new(config(0)).is_err());
    }

    #[test]
    fn test_pause_resume() {
        let mgr = NetManager::new(config(3)).unwrap();
        mgr.pause().unwrap();
        assert!(mgr.inner.workers.iter().all(WorkerShared::is_paused));
        // A second pause is a no-op
        mgr.pause().unwrap();
        mgr.resume().unwrap();
        assert!(!mgr.inner.workers.iter().any(WorkerShared::is_paused));
    }

    #[test]
    fn test_set_timeouts() {
        let mgr = NetManager::new(config(1)).unwrap();
        let t = Timeouts {
            init: Duration::from_secs(1),
            idle: Duration::from_secs(2),
            keepalive: Duration::from_secs(3),
            advertised: Duration::from_secs(4),
        };
        mgr.set_timeouts(t);
        assert_eq!(mgr.timeouts(), t);
    }

    #[test]
    fn test_listen_after_shutdown() {
        let mgr = NetManager::new(config(1)).unwrap();
        mgr.shutdown();
        let res = mgr.listen_tcp("127.0.0.1:0".parse().unwrap(), |_, _| Ok(()), 10, None);
        assert_eq!(res.err(), Some(NetError::ShuttingDown));
    }

    #[test]
    fn test_connect_after_shutdown_fails_on_worker() {
        let mgr = NetManager::new(config(1)).unwrap();
        mgr.shutdown();

        let (tx, rx) = std::sync::mpsc::channel();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        mgr.connect_tcp(
            None,
            peer,
            move |res| {
                let _ = tx.send((std::thread::current().id(), res.err()));
            },
            Duration::from_secs(1),
        );
        let (thread, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(thread, std::thread::current().id());
        assert_eq!(err, Some(NetError::ShuttingDown));
        mgr.destroy();
    }

    #[test]
    fn test_drain_wakes_on_unregister() {
        let mgr = NetManager::new(config(1)).unwrap();
        let sock = Socket::new(&mgr.inner, SocketType::TcpSocket, 0, false, None);
        mgr.inner.worker(0).register(&sock);
        assert_eq!(mgr.inner.open_sockets(), 1);

        let inner = mgr.inner.clone();
        let id = sock.id();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            inner.unregister_socket(0, id);
        });

        let started = std::time::Instant::now();
        assert_eq!(mgr.inner.wait_drained(Duration::from_secs(30)), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        closer.join().unwrap();
        mgr.destroy();
    }

    #[test]
    fn test_drain_gives_up_after_timeout() {
        let mgr = NetManager::new(config(1)).unwrap();
        let sock = Socket::new(&mgr.inner, SocketType::TcpSocket, 0, false, None);
        mgr.inner.worker(0).register(&sock);
        assert_eq!(mgr.inner.wait_drained(Duration::from_millis(20)), 1);
        mgr.inner.unregister_socket(0, sock.id());
        assert_eq!(mgr.inner.wait_drained(Duration::ZERO), 0);
    }
}
