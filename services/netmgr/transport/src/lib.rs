//! Worker-per-thread network I/O manager: TCP, TLS, DNS-over-TCP and DNS-over-TLS.
//!
//! A [`NetManager`] owns a fixed set of worker threads, each running its own
//! event loop. Every socket belongs to exactly one worker; operations issued
//! from other threads are queued to it, operations issued on it run inline.
//! Applications interact through callbacks and [`NmHandle`]s.
//!
//! ## Features
//!
//! - **Listeners**: one listening socket per worker, load balanced with
//!   `SO_REUSEPORT` where available
//! - **DNS framing**: 2-byte big-endian length prefix on TCP and TLS streams
//! - **TLS**: rustls sessions driven without an async adapter, with ALPN
//!   `dot` detection and client session resumption
//! - **Admission control**: a shared [`Quota`] defers accepts instead of
//!   refusing them
//! - **Timers**: per-connection init, idle, keepalive and write timeouts
//!
//! ## Example
//!
//! ```rust,no_run
//! use netmgr_transport::{NetConfig, NetManager};
//!
//! # fn example() -> Result<(), netmgr_transport::NetError> {
//! let mgr = NetManager::new(NetConfig::default().with_workers(2))?;
//! let listener = mgr.listen_tcpdns(
//!     "127.0.0.1:5300".parse().unwrap(),
//!     |handle, msg| {
//!         if let Ok(msg) = msg {
//!             // Echo every message back
//!             handle.send(msg.to_vec(), |_, _| {});
//!         }
//!     },
//!     |_, _| Ok(()),
//!     128,
//!     None,
//! )?;
//! println!("listening on {}", listener.local_addr());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod quota;
pub mod socket;
pub mod stats;
pub mod tlsctx;

mod event;
mod request;
mod tcp;
mod tcpdns;
mod timer;
mod tls;
mod tlsdns;
mod worker;

// Re-export main types
pub use config::{NetConfig, Timeouts};
pub use error::{NetError, NetResult};
pub use handle::{AcceptCb, ConnectCb, NmHandle, RecvCb, SendCb};
pub use manager::NetManager;
pub use quota::{Quota, QuotaPermit};
pub use socket::{Listener, SocketType};
pub use stats::StatsSnapshot;
pub use tlsctx::{TlsClientCtx, TlsCtxError, TlsServerCtx, DOT_ALPN};
