//! Application-facing connection handles.
//!
//! An [`NmHandle`] is a cloneable capability over one socket. Every clone
//! keeps the connection accounted as in use; when the last clone of a handle
//! goes away the owning worker is told, and a stream socket nobody holds or
//! reads from any more is closed.

use crate::error::{NetError, NetResult};
use crate::event::{NetEvent, SocketOption};
use crate::socket::{Socket, SocketType};
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Receive callback; fires once per message (framed) or chunk (raw)
pub type RecvCb = Arc<dyn Fn(&NmHandle, NetResult<&[u8]>) + Send + Sync>;

/// Accept callback; returning an error drops the new connection
pub type AcceptCb = Arc<dyn Fn(&NmHandle, NetResult<()>) -> NetResult<()> + Send + Sync>;

/// Connect callback; fires exactly once
pub type ConnectCb = Box<dyn FnOnce(NetResult<NmHandle>) + Send>;

/// Send completion callback; fires exactly once
pub type SendCb = Box<dyn FnOnce(&NmHandle, NetResult<()>) + Send>;

struct HandleInner {
    sock: Arc<Socket>,
    slot: u64,
    peer: SocketAddr,
    local: SocketAddr,
    message: bool,
    data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Always queued: the last clone may go away inside a callback
        let sock = &self.sock;
        sock.mgr().enqueue(
            sock.tid(),
            NetEvent::HandleDetached {
                sock: sock.clone(),
                message: self.message,
            },
        );
    }
}

/// Handle on one connection
#[derive(Clone)]
pub struct NmHandle {
    inner: Arc<HandleInner>,
}

impl NmHandle {
    pub(crate) fn new(
        sock: &Arc<Socket>,
        peer: SocketAddr,
        local: SocketAddr,
        message: bool,
    ) -> Self {
        let slot = sock.attach_handle();
        Self {
            inner: Arc::new(HandleInner {
                sock: sock.clone(),
                slot,
                peer,
                local,
                message,
                data: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn socket(&self) -> &Arc<Socket> {
        &self.inner.sock
    }

    fn submit(&self, ev: NetEvent) {
        let sock = self.socket();
        sock.mgr().maybe_enqueue(sock.tid(), ev);
    }

    fn configure(&self, option: SocketOption) {
        self.submit(NetEvent::Configure {
            sock: self.socket().clone(),
            option,
        });
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Local address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Transport of the underlying socket
    pub fn socket_type(&self) -> SocketType {
        self.socket().kind()
    }

    /// Whether the underlying socket has not started closing
    pub fn is_active(&self) -> bool {
        self.socket().is_active()
    }

    /// Whether this is a DNS-over-TLS connection
    pub fn is_tlsdns(&self) -> bool {
        self.socket_type() == SocketType::TlsDnsSocket
    }

    /// Whether the peer negotiated the `dot` ALPN protocol
    pub fn alpn_negotiated(&self) -> bool {
        self.socket().alpn_dot()
    }

    /// Check whether zone transfers may run over this connection
    pub fn xfr_check_perm(&self) -> NetResult<()> {
        match self.socket_type() {
            SocketType::TlsDnsSocket if self.alpn_negotiated() => Ok(()),
            SocketType::TlsDnsSocket => Err(NetError::DotAlpnError),
            _ => Err(NetError::NoPermission),
        }
    }

    /// Attach typed extension data, replacing any previous value
    pub fn set_data<T: Any + Send>(&self, value: T) {
        *self.inner.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(value));
    }

    /// Copy of the extension data, if it is a `T`
    pub fn data<T: Any + Send + Clone>(&self) -> Option<T> {
        self.with_data(|v: &mut T| v.clone())
    }

    /// Run `f` on the extension data, if it is a `T`
    pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut data = self.inner.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.as_mut()
            .and_then(|d| (**d).downcast_mut::<T>())
            .map(f)
    }

    /// Start delivering received data to `cb`.
    ///
    /// Delivery is asynchronous even when data is already buffered.
    pub fn read<F>(&self, cb: F)
    where
        F: Fn(&NmHandle, NetResult<&[u8]>) + Send + Sync + 'static,
    {
        self.submit(NetEvent::Read {
            handle: self.clone(),
            cb: Arc::new(cb),
        });
    }

    /// Send `data`; framed transports add the length prefix
    pub fn send<F>(&self, data: impl Into<Bytes>, cb: F)
    where
        F: FnOnce(&NmHandle, NetResult<()>) + Send + 'static,
    {
        let sock = self.socket();
        let req = sock
            .mgr()
            .requests()
            .get(self.clone(), data.into(), Box::new(cb));
        self.submit(NetEvent::Send(req));
    }

    /// Stop reading, keeping buffered data
    pub fn pause_read(&self) {
        self.submit(NetEvent::PauseRead(self.socket().clone()));
    }

    /// Resume a paused read
    pub fn resume_read(&self) {
        self.submit(NetEvent::ResumeRead(self.socket().clone()));
    }

    /// Fail the current read with EOF without closing the connection
    pub fn cancel_read(&self) {
        self.submit(NetEvent::CancelRead(self.socket().clone()));
    }

    /// Close the connection; idempotent
    pub fn shutdown(&self) {
        self.submit(NetEvent::Close {
            sock: self.socket().clone(),
            reason: NetError::Canceled,
        });
    }

    /// Drop the connection after a malformed request
    pub fn bad_request(&self) {
        self.submit(NetEvent::Close {
            sock: self.socket().clone(),
            reason: NetError::InvalidProtocol,
        });
    }

    /// Override the read timeout
    pub fn set_timeout(&self, timeout: Duration) {
        self.configure(SocketOption::ReadTimeout(Some(timeout)));
    }

    /// Disable the read timeout
    pub fn clear_timeout(&self) {
        self.configure(SocketOption::ReadTimeout(None));
    }

    /// Switch between the idle and keepalive read timeouts
    pub fn keepalive(&self, enabled: bool) {
        self.configure(SocketOption::Keepalive(enabled));
    }

    /// Override the per-send write timeout
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.configure(SocketOption::WriteTimeout(timeout));
    }

    /// Dispatch the next message only after the previous message handle is released
    pub fn sequential(&self) {
        self.configure(SocketOption::Sequential);
    }
}

impl fmt::Debug for NmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NmHandle")
            .field("socket", &self.socket().id())
            .field("type", &self.socket_type())
            .field("slot", &self.inner.slot)
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .finish()
    }
}
