//! Canonical error kinds for the network manager.
//!
//! Every OS or TLS library error is translated into a [`NetError`] exactly
//! once, where it is first observed. Codes without a canonical kind surface
//! as [`NetError::Unexpected`] and are logged with their call site.

use once_cell::sync::Lazy;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the transport crate
pub type NetResult<T> = Result<T, NetError>;

/// Network manager error kinds
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetError {
    /// Bad descriptor or path
    #[error("invalid file")]
    InvalidFile,
    /// Path does not exist
    #[error("file not found")]
    FileNotFound,
    /// Resource temporarily unavailable
    #[error("no connection")]
    NoConnection,
    /// Operation not permitted
    #[error("permission denied")]
    NoPermission,
    /// Path already exists
    #[error("file exists")]
    FileExists,
    /// Generic I/O failure
    #[error("I/O error")]
    IoError,
    /// Out of memory
    #[error("out of memory")]
    NoMemory,
    /// Descriptor limit reached
    #[error("too many open files")]
    TooManyOpenFiles,
    /// No space left
    #[error("disc full")]
    DiscFull,
    /// Peer reset or aborted the connection
    #[error("connection reset")]
    ConnectionReset,
    /// Socket is not connected
    #[error("socket is not connected")]
    NotConnected,
    /// Operation timed out
    #[error("timed out")]
    TimedOut,
    /// Out of buffers or similar kernel resource
    #[error("ran out of resources")]
    NoResources,
    /// Address family not supported
    #[error("address family not supported")]
    FamilyNotSupported,
    /// Network is down
    #[error("network down")]
    NetworkDown,
    /// Host is down
    #[error("host down")]
    HostDown,
    /// Network is unreachable
    #[error("network unreachable")]
    NetworkUnreachable,
    /// Host is unreachable
    #[error("host unreachable")]
    HostUnreachable,
    /// Address already in use
    #[error("address in use")]
    AddressInUse,
    /// Address not available
    #[error("address not available")]
    AddressNotAvailable,
    /// Connection refused
    #[error("connection refused")]
    ConnectionRefused,
    /// Operation canceled
    #[error("operation canceled")]
    Canceled,
    /// End of stream
    #[error("end of file")]
    Eof,
    /// Message exceeds the framing limit
    #[error("message too large")]
    MessageTooLarge,
    /// Peer violated the protocol
    #[error("invalid protocol")]
    InvalidProtocol,
    /// TLS failure
    #[error("TLS error")]
    TlsError,
    /// Peer certificate rejected
    #[error("bad peer certificate")]
    TlsBadPeerCertificate,
    /// DNS-over-TLS ALPN was not negotiated
    #[error("DoT ALPN not negotiated")]
    DotAlpnError,
    /// The manager is shutting down
    #[error("shutting down")]
    ShuttingDown,
    /// Untranslated error
    #[error("unexpected error")]
    Unexpected,
}

impl NetError {
    /// Translate an OS error, `None` when no canonical kind exists
    pub fn from_io(err: &io::Error) -> Option<Self> {
        #[cfg(unix)]
        if let Some(kind) = err.raw_os_error().and_then(Self::from_errno) {
            return Some(kind);
        }

        match err.kind() {
            io::ErrorKind::NotFound => Some(NetError::FileNotFound),
            io::ErrorKind::PermissionDenied => Some(NetError::NoPermission),
            io::ErrorKind::AlreadyExists => Some(NetError::FileExists),
            io::ErrorKind::WouldBlock => Some(NetError::NoConnection),
            io::ErrorKind::ConnectionRefused => Some(NetError::ConnectionRefused),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Some(NetError::ConnectionReset),
            io::ErrorKind::NotConnected => Some(NetError::NotConnected),
            io::ErrorKind::AddrInUse => Some(NetError::AddressInUse),
            io::ErrorKind::AddrNotAvailable => Some(NetError::AddressNotAvailable),
            io::ErrorKind::TimedOut => Some(NetError::TimedOut),
            io::ErrorKind::UnexpectedEof => Some(NetError::Eof),
            io::ErrorKind::OutOfMemory => Some(NetError::NoMemory),
            io::ErrorKind::InvalidInput => Some(NetError::InvalidFile),
            io::ErrorKind::Unsupported => Some(NetError::FamilyNotSupported),
            _ => None,
        }
    }

    #[cfg(unix)]
    fn from_errno(code: i32) -> Option<Self> {
        use libc::{
            EACCES, EADDRINUSE, EADDRNOTAVAIL, EAFNOSUPPORT, EAGAIN, EBADF, ECANCELED,
            ECONNABORTED, ECONNREFUSED, ECONNRESET, EEXIST, EHOSTDOWN, EHOSTUNREACH, EINVAL,
            EIO, ELOOP, EMFILE, EMSGSIZE, ENAMETOOLONG, ENETDOWN, ENETUNREACH, ENFILE, ENOBUFS,
            ENOENT, ENOMEM, ENOSPC, ENOTCONN, ENOTDIR, EOPNOTSUPP, EPERM, EPIPE, ETIMEDOUT,
        };

        let kind = match code {
            ENOTDIR | ELOOP | EINVAL | ENAMETOOLONG | EBADF => NetError::InvalidFile,
            ENOENT => NetError::FileNotFound,
            EAGAIN => NetError::NoConnection,
            EACCES | EPERM => NetError::NoPermission,
            EEXIST => NetError::FileExists,
            EIO => NetError::IoError,
            ENOMEM => NetError::NoMemory,
            ENFILE | EMFILE => NetError::TooManyOpenFiles,
            ENOSPC => NetError::DiscFull,
            EPIPE | ECONNRESET | ECONNABORTED => NetError::ConnectionReset,
            ENOTCONN => NetError::NotConnected,
            ETIMEDOUT => NetError::TimedOut,
            ENOBUFS => NetError::NoResources,
            EAFNOSUPPORT | EOPNOTSUPP => NetError::FamilyNotSupported,
            ENETDOWN => NetError::NetworkDown,
            EHOSTDOWN => NetError::HostDown,
            ENETUNREACH => NetError::NetworkUnreachable,
            EHOSTUNREACH => NetError::HostUnreachable,
            EADDRINUSE => NetError::AddressInUse,
            EADDRNOTAVAIL => NetError::AddressNotAvailable,
            ECONNREFUSED => NetError::ConnectionRefused,
            ECANCELED => NetError::Canceled,
            EMSGSIZE => NetError::MessageTooLarge,
            _ => return None,
        };
        Some(kind)
    }

    /// Translate an OS error, logging untranslated codes against the call site
    pub fn from_io_at(err: &io::Error, file: &str, line: u32, module: &str) -> Self {
        match Self::from_io(err) {
            Some(kind) => kind,
            None => {
                if UNEXPECTED_LOG.allow(Duration::from_secs(1)) {
                    error!(
                        "{}:{} {}(): unable to convert OS error to a result code: {} ({:?})",
                        file,
                        line,
                        module,
                        err,
                        err.raw_os_error()
                    );
                }
                NetError::Unexpected
            }
        }
    }

    /// Translate a TLS library error
    pub fn from_tls(err: &rustls::Error) -> Self {
        use rustls::AlertDescription;

        match err {
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                NetError::TlsBadPeerCertificate
            }
            rustls::Error::AlertReceived(
                AlertDescription::BadCertificate
                | AlertDescription::UnsupportedCertificate
                | AlertDescription::CertificateRevoked
                | AlertDescription::CertificateExpired
                | AlertDescription::CertificateUnknown
                | AlertDescription::UnknownCA,
            ) => NetError::TlsBadPeerCertificate,
            _ => NetError::TlsError,
        }
    }

    /// Whether the error means the peer went away
    pub fn is_eof_class(&self) -> bool {
        matches!(
            self,
            NetError::Eof | NetError::ConnectionReset | NetError::NotConnected
        )
    }
}

impl From<netmgr_wire::WireError> for NetError {
    fn from(err: netmgr_wire::WireError) -> Self {
        match err {
            netmgr_wire::WireError::TooLarge(_) => NetError::MessageTooLarge,
            netmgr_wire::WireError::BufferFull { .. } => NetError::NoResources,
        }
    }
}

/// Translate an `io::Error`, recording the call site for unexpected codes
#[macro_export]
macro_rules! map_io_err {
    ($err:expr) => {
        $crate::error::NetError::from_io_at(&$err, file!(), line!(), module_path!())
    };
}

static UNEXPECTED_LOG: LogLimiter = LogLimiter::new();

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Allows one log line per interval across all threads
pub(crate) struct LogLimiter {
    last: AtomicU64,
}

impl LogLimiter {
    pub(crate) const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Claim the right to log now
    pub(crate) fn allow(&self, interval: Duration) -> bool {
        // Offset by one interval so the very first call always logs
        let now = CLOCK_BASE.elapsed().as_millis() as u64 + interval.as_millis() as u64;
        let last = self.last.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(NetError::from_io(&err), Some(NetError::ConnectionRefused));

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(NetError::from_io(&err), Some(NetError::ConnectionReset));

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(NetError::from_io(&err), None);
        assert_eq!(map_io_err!(err), NetError::Unexpected);
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_mapping() {
        let cases = [
            (libc::ECONNRESET, NetError::ConnectionReset),
            (libc::ECONNREFUSED, NetError::ConnectionRefused),
            (libc::EADDRINUSE, NetError::AddressInUse),
            (libc::EMFILE, NetError::TooManyOpenFiles),
            (libc::ETIMEDOUT, NetError::TimedOut),
            (libc::EHOSTUNREACH, NetError::HostUnreachable),
            (libc::EMSGSIZE, NetError::MessageTooLarge),
        ];
        for (code, want) in cases {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(NetError::from_io(&err), Some(want), "errno {}", code);
        }

        // ENOTTY has no canonical kind
        let err = io::Error::from_raw_os_error(libc::ENOTTY);
        assert_eq!(NetError::from_io(&err), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_unmapped_errno_uses_error_kind() {
        // ENOTRECOVERABLE sits where other platforms put ECONNRESET
        let err = io::Error::from_raw_os_error(libc::ENOTRECOVERABLE);
        assert_ne!(NetError::from_io(&err), Some(NetError::ConnectionReset));

        // Kind-only errors carry no errno and still map
        let err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        assert_eq!(NetError::from_io(&err), Some(NetError::AddressInUse));
    }

    #[test]
    fn test_tls_mapping() {
        let err = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        assert_eq!(NetError::from_tls(&err), NetError::TlsBadPeerCertificate);

        let err = rustls::Error::DecryptError;
        assert_eq!(NetError::from_tls(&err), NetError::TlsError);
    }

    #[test]
    fn test_log_limiter() {
        let limiter = LogLimiter::new();
        assert!(limiter.allow(Duration::from_secs(60)));
        assert!(!limiter.allow(Duration::from_secs(60)));
    }
}
