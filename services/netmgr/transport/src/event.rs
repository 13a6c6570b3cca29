//! Events exchanged between application threads and workers.
//!
//! Anything that mutates a socket runs on the worker owning it. Callers on
//! other threads wrap the operation in a [`NetEvent`] and queue it to that
//! worker; callers already on the owning thread run it inline.

use crate::error::NetError;
use crate::handle::{ConnectCb, NmHandle, RecvCb};
use crate::request::SendRequest;
use crate::socket::{finish_close, Socket};
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Per-socket setting changes
#[derive(Debug, Clone, Copy)]
pub(crate) enum SocketOption {
    ReadTimeout(Option<Duration>),
    Keepalive(bool),
    WriteTimeout(Duration),
    Sequential,
}

/// Outgoing connection parameters
pub(crate) struct ConnectRequest {
    pub(crate) sock: Arc<Socket>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) peer: SocketAddr,
    pub(crate) timeout: Duration,
    pub(crate) cb: ConnectCb,
    pub(crate) tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
}

/// Work item for a worker loop
pub(crate) enum NetEvent {
    // Priority class: drained even while the manager is paused
    StartListening(Arc<Socket>),
    StopListening(Arc<Socket>),
    Pause,
    Resume,
    Shutdown,
    Stop,

    // Normal class
    Connect(Box<ConnectRequest>),
    Read { handle: NmHandle, cb: RecvCb },
    PauseRead(Arc<Socket>),
    ResumeRead(Arc<Socket>),
    CancelRead(Arc<Socket>),
    Send(Box<SendRequest>),
    Process(Arc<Socket>),
    Close { sock: Arc<Socket>, reason: NetError },
    HandleDetached { sock: Arc<Socket>, message: bool },
    Configure { sock: Arc<Socket>, option: SocketOption },
}

impl NetEvent {
    /// Whether the event belongs to the priority queue
    pub(crate) fn is_priority(&self) -> bool {
        matches!(
            self,
            NetEvent::StartListening(_)
                | NetEvent::StopListening(_)
                | NetEvent::Pause
                | NetEvent::Resume
                | NetEvent::Shutdown
                | NetEvent::Stop
        )
    }

    /// Fail the callbacks carried by an event that will never run
    pub(crate) fn cancel(self, err: NetError) {
        match self {
            NetEvent::Connect(req) => {
                let ConnectRequest { sock, cb, .. } = *req;
                cb(Err(err));
                finish_close(&sock);
            }
            NetEvent::Read { handle, cb } => cb(&handle, Err(err)),
            NetEvent::Send(req) => {
                if let Some(sock) = req.handle.as_ref().map(|h| h.socket().clone()) {
                    sock.mgr().complete_send(req, Err(err));
                }
            }
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        match self {
            NetEvent::StartListening(_) => "start-listening",
            NetEvent::StopListening(_) => "stop-listening",
            NetEvent::Pause => "pause",
            NetEvent::Resume => "resume",
            NetEvent::Shutdown => "shutdown",
            NetEvent::Stop => "stop",
            NetEvent::Connect(_) => "connect",
            NetEvent::Read { .. } => "read",
            NetEvent::PauseRead(_) => "pause-read",
            NetEvent::ResumeRead(_) => "resume-read",
            NetEvent::CancelRead(_) => "cancel-read",
            NetEvent::Send(_) => "send",
            NetEvent::Process(_) => "process",
            NetEvent::Close { .. } => "close",
            NetEvent::HandleDetached { .. } => "handle-detached",
            NetEvent::Configure { .. } => "configure",
        }
    }
}

impl fmt::Debug for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_class() {
        assert!(NetEvent::Pause.is_priority());
        assert!(NetEvent::Stop.is_priority());
        assert!(NetEvent::Shutdown.is_priority());
    }
}
