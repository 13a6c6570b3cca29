//! Worker threads.
//!
//! Each worker is one OS thread driving a single-threaded tokio runtime.
//! The loop drains two queues: priority events always, normal events only
//! while the manager is not paused. Socket I/O runs as tasks spawned on the
//! same runtime, so every socket is only ever touched by its own worker.

use crate::error::NetError;
use crate::event::NetEvent;
use crate::manager::ManagerInner;
use crate::socket::{self, Socket};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

thread_local! {
    static CURRENT: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
    static RECV_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Worker index of the calling thread, if it is a worker of manager `mgr_id`
pub(crate) fn current_worker(mgr_id: u64) -> Option<usize> {
    CURRENT.with(|c| match c.get() {
        Some((id, tid)) if id == mgr_id => Some(tid),
        _ => None,
    })
}

/// Run `f` over the thread's scratch receive buffer of at least `size` bytes
pub(crate) fn with_recv_buffer<R>(size: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    RECV_BUF.with(|cell| match cell.try_borrow_mut() {
        Ok(mut buf) => {
            if buf.len() < size {
                buf.resize(size, 0);
            }
            f(&mut buf[..size])
        }
        // Nested use; fall back to a one-off buffer
        Err(_) => f(&mut vec![0u8; size]),
    })
}

/// Receiving ends of a worker's queues, moved into its thread
pub(crate) struct WorkerQueues {
    normal: mpsc::UnboundedReceiver<NetEvent>,
    priority: mpsc::UnboundedReceiver<NetEvent>,
}

/// Worker state reachable from other threads
pub(crate) struct WorkerShared {
    id: usize,
    normal: mpsc::UnboundedSender<NetEvent>,
    priority: mpsc::UnboundedSender<NetEvent>,
    paused: watch::Sender<bool>,
    sockets: Mutex<HashMap<u64, Arc<Socket>>>,
}

impl WorkerShared {
    pub(crate) fn new(id: usize) -> (Self, WorkerQueues) {
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        (
            Self {
                id,
                normal: normal_tx,
                priority: priority_tx,
                paused,
                sockets: Mutex::new(HashMap::new()),
            },
            WorkerQueues {
                normal: normal_rx,
                priority: priority_rx,
            },
        )
    }

    /// Queue an event, handing it back if the worker is gone
    pub(crate) fn send(&self, ev: NetEvent) -> Result<(), NetEvent> {
        let queue = if ev.is_priority() {
            &self.priority
        } else {
            &self.normal
        };
        queue.send(ev).map_err(|e| e.0)
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        if self.paused.send_replace(paused) != paused {
            debug!("Worker {} {}", self.id, if paused { "paused" } else { "resumed" });
        }
    }

    pub(crate) fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Track a socket owned by this worker
    pub(crate) fn register(&self, sock: &Arc<Socket>) {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sock.id(), sock.clone());
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Snapshot of the sockets owned by this worker
    pub(crate) fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn clear(&self) {
        let sockets: Vec<_> = self
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        drop(sockets);
    }
}

/// Start the thread for worker `tid`
pub(crate) fn spawn(
    mgr: Arc<ManagerInner>,
    tid: usize,
    queues: WorkerQueues,
    rt: Runtime,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("netmgr-worker-{}", tid))
        .spawn(move || run(mgr, tid, queues, rt))
}

fn run(mgr: Arc<ManagerInner>, tid: usize, mut queues: WorkerQueues, rt: Runtime) {
    CURRENT.with(|c| c.set(Some((mgr.id(), tid))));
    debug!("Worker {} started", tid);

    rt.block_on(event_loop(&mgr, tid, &mut queues));

    // Events that raced with the stop never run; fail what they carry
    queues.priority.close();
    queues.normal.close();
    while let Ok(ev) = queues.priority.try_recv() {
        ev.cancel(NetError::ShuttingDown);
    }
    while let Ok(ev) = queues.normal.try_recv() {
        ev.cancel(NetError::ShuttingDown);
    }

    mgr.worker(tid).clear();
    drop(rt);

    CURRENT.with(|c| c.set(None));
    debug!("Worker {} stopped", tid);
}

async fn event_loop(mgr: &Arc<ManagerInner>, tid: usize, queues: &mut WorkerQueues) {
    let worker = mgr.worker(tid);
    loop {
        let paused = worker.is_paused();
        let ev = tokio::select! {
            biased;
            ev = queues.priority.recv() => ev,
            ev = queues.normal.recv(), if !paused => ev,
        };

        match ev {
            None | Some(NetEvent::Stop) => break,
            Some(ev) => dispatch(mgr, tid, ev),
        }
    }
}

/// Execute one event on worker `tid`
pub(crate) fn dispatch(mgr: &Arc<ManagerInner>, tid: usize, ev: NetEvent) {
    trace!("Worker {} processing {:?}", tid, ev);

    match ev {
        NetEvent::StartListening(sock) => crate::tcp::start_listening(&sock),
        NetEvent::StopListening(sock) => socket::close_socket(&sock, NetError::Canceled),
        NetEvent::Pause => mgr.worker_paused(tid),
        NetEvent::Resume => mgr.worker_resumed(tid),
        NetEvent::Shutdown => {
            for sock in mgr.worker(tid).sockets() {
                socket::close_socket(&sock, NetError::ShuttingDown);
            }
        }
        NetEvent::Stop => {}
        NetEvent::Connect(req) => crate::tcp::start_connect(req),
        NetEvent::Read { handle, cb } => socket::start_read(handle, cb),
        NetEvent::PauseRead(sock) => socket::pause_read(&sock),
        NetEvent::ResumeRead(sock) => socket::resume_read(&sock),
        NetEvent::CancelRead(sock) => socket::cancel_read(&sock),
        NetEvent::Send(req) => socket::send(req),
        NetEvent::Process(sock) => socket::process(&sock),
        NetEvent::Close { sock, reason } => socket::close_socket(&sock, reason),
        NetEvent::HandleDetached { sock, message } => socket::handle_detached(&sock, message),
        NetEvent::Configure { sock, option } => socket::configure(&sock, option),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_buffer_reuse() {
        let first = with_recv_buffer(16, |buf| {
            buf[0] = 7;
            buf.len()
        });
        assert_eq!(first, 16);

        // Same thread, same allocation
        let seen = with_recv_buffer(8, |buf| buf[0]);
        assert_eq!(seen, 7);

        // Nested calls get their own buffer
        with_recv_buffer(4, |outer| {
            outer[0] = 1;
            with_recv_buffer(4, |inner| assert_eq!(inner[0], 0));
        });
    }

    #[test]
    fn test_not_a_worker() {
        assert_eq!(current_worker(1), None);
    }
}
