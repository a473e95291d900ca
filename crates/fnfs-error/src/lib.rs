#![forbid(unsafe_code)]
//! Error types for FrankenNFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Wire parsing | `ParseError` | `fnfs-types` | Malformed RPC headers or procedure bodies |
//! | Cancellation | `CxError` | `fnfs-types` | Cancelled or expired `Cx` contexts |
//! | Runtime | `NfsError` | `fnfs-error` (this crate) | Errors surfaced by the cache, the RPC engine, and the client facade |
//!
//! `fnfs-error` does not depend on `fnfs-types`. The conversions
//! `ParseError` → `NfsError::Protocol` and `CxError` → `Interrupted` /
//! `Timeout` are implemented in `fnfs-types`.
//!
//! ## Propagation policy
//!
//! | Variant | Class | Handling |
//! |---------|-------|----------|
//! | `Busy` | transient | retried by the caller |
//! | `WouldBlock` | transient | non-blocking lookup; caller retries later |
//! | `ConnectionLost` | transient | triggers reconnect; pending requests are resent |
//! | `ServerTryLater` | transient | backoff and resend; surfaced only when the try-later budget is spent |
//! | `StaleWriteVerifier` | transient | data rewritten stable; never surfaced |
//! | `ResourceExhausted` | transient | degrades to a blocking wait |
//! | `Timeout` | fatal | soft mount retry budget spent, or deadline expired |
//! | `Protocol` | fatal | malformed or rejected reply; the buffer is marked errored |
//! | `Server` | fatal | server returned a non-zero NFS status |
//! | `Interrupted` | fatal | caller cancelled the wait |
//! | `Abandoned` | fatal | the request was abandoned by its owner |
//! | `Shutdown` | fatal | engine stopped with requests pending |
//!
//! ## errno mapping
//!
//! Every variant maps to exactly one POSIX errno via [`NfsError::to_errno`].
//! The match is exhaustive so a new variant fails to compile until it is
//! assigned one.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Busy` | `EBUSY` |
//! | `WouldBlock` | `EWOULDBLOCK` |
//! | `Timeout` | `ETIMEDOUT` |
//! | `ConnectionLost` | `ENOTCONN` |
//! | `ServerTryLater` | `EAGAIN` |
//! | `StaleWriteVerifier` | `EIO` |
//! | `Protocol` | `EBADMSG` |
//! | `ResourceExhausted` | `ENOBUFS` |
//! | `Interrupted` | `EINTR` |
//! | `Abandoned` | `ECANCELED` |
//! | `Server` | the status when it is errno-valued (< 10000), else `EIO` |
//! | `InvalidConfig` | `EINVAL` |
//! | `Shutdown` | `ESHUTDOWN` |

use std::io;
use thiserror::Error;

/// NFS statuses below this value share their numeric value with errno.
const NFS_ERRNO_LIMIT: u32 = 10_000;

/// Unified error type for all FrankenNFS operations.
#[derive(Debug, Error)]
pub enum NfsError {
    /// Local socket or system I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Buffer or resource temporarily unavailable.
    #[error("resource busy")]
    Busy,

    /// Non-blocking acquisition found the resource busy.
    #[error("operation would block")]
    WouldBlock,

    /// Retry budget or deadline exhausted.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport failed; the connection is being re-established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server asked for the request to be retried later and the
    /// try-later budget ran out.
    #[error("server busy, try later")]
    ServerTryLater,

    /// Uncommitted data was written under a server verifier that has since
    /// changed.
    #[error("stale write verifier")]
    StaleWriteVerifier,

    /// Malformed, denied, or unexpected RPC reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pool at capacity.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The caller's context was cancelled while waiting.
    #[error("interrupted")]
    Interrupted,

    /// The request was abandoned before a reply arrived.
    #[error("request abandoned")]
    Abandoned,

    /// The server answered with a non-zero NFS status.
    #[error("server returned NFS status {status}")]
    Server { status: u32 },

    /// Mount configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine was shut down before the operation completed.
    #[error("engine shut down")]
    Shutdown,
}

impl NfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Busy => libc::EBUSY,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::Timeout(_) => libc::ETIMEDOUT,
            Self::ConnectionLost(_) => libc::ENOTCONN,
            Self::ServerTryLater => libc::EAGAIN,
            Self::StaleWriteVerifier => libc::EIO,
            Self::Protocol(_) => libc::EBADMSG,
            Self::ResourceExhausted => libc::ENOBUFS,
            Self::Interrupted => libc::EINTR,
            Self::Abandoned => libc::ECANCELED,
            Self::Server { status } => {
                if *status < NFS_ERRNO_LIMIT {
                    libc::c_int::try_from(*status).unwrap_or(libc::EIO)
                } else {
                    libc::EIO
                }
            }
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::Shutdown => libc::ESHUTDOWN,
        }
    }

    /// Errors the engine resolves internally by retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy
                | Self::WouldBlock
                | Self::ServerTryLater
                | Self::StaleWriteVerifier
                | Self::ConnectionLost(_)
                | Self::ResourceExhausted
        )
    }

    /// Errors that mean the transport is unusable and must be reconnected.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Clone an error so it can be recorded in several places (buffer,
    /// file, waiter). I/O errors keep their kind and message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Io(err) => match err.raw_os_error() {
                Some(code) => Self::Io(io::Error::from_raw_os_error(code)),
                None => Self::Io(io::Error::new(err.kind(), err.to_string())),
            },
            Self::Busy => Self::Busy,
            Self::WouldBlock => Self::WouldBlock,
            Self::Timeout(msg) => Self::Timeout(msg.clone()),
            Self::ConnectionLost(msg) => Self::ConnectionLost(msg.clone()),
            Self::ServerTryLater => Self::ServerTryLater,
            Self::StaleWriteVerifier => Self::StaleWriteVerifier,
            Self::Protocol(msg) => Self::Protocol(msg.clone()),
            Self::ResourceExhausted => Self::ResourceExhausted,
            Self::Interrupted => Self::Interrupted,
            Self::Abandoned => Self::Abandoned,
            Self::Server { status } => Self::Server { status: *status },
            Self::InvalidConfig(msg) => Self::InvalidConfig(msg.clone()),
            Self::Shutdown => Self::Shutdown,
        }
    }
}

/// Result alias using `NfsError`.
pub type Result<T> = std::result::Result<T, NfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(NfsError, libc::c_int)> = vec![
            (NfsError::Io(io::Error::other("test")), libc::EIO),
            (NfsError::Busy, libc::EBUSY),
            (NfsError::WouldBlock, libc::EWOULDBLOCK),
            (NfsError::Timeout("soft mount".into()), libc::ETIMEDOUT),
            (NfsError::ConnectionLost("reset".into()), libc::ENOTCONN),
            (NfsError::ServerTryLater, libc::EAGAIN),
            (NfsError::StaleWriteVerifier, libc::EIO),
            (NfsError::Protocol("short reply".into()), libc::EBADMSG),
            (NfsError::ResourceExhausted, libc::ENOBUFS),
            (NfsError::Interrupted, libc::EINTR),
            (NfsError::Abandoned, libc::ECANCELED),
            (NfsError::Server { status: 13 }, libc::EACCES),
            (NfsError::Server { status: 10_001 }, libc::EIO),
            (NfsError::InvalidConfig("write_size".into()), libc::EINVAL),
            (NfsError::Shutdown, libc::ESHUTDOWN),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = io::Error::from_raw_os_error(libc::EPIPE);
        let err = NfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPIPE);
        assert_eq!(err.duplicate().to_errno(), libc::EPIPE);
    }

    #[test]
    fn transient_and_connection_classification() {
        assert!(NfsError::ServerTryLater.is_transient());
        assert!(NfsError::StaleWriteVerifier.is_transient());
        assert!(NfsError::ConnectionLost("x".into()).is_transient());
        assert!(!NfsError::Protocol("x".into()).is_transient());
        assert!(!NfsError::Timeout("x".into()).is_transient());

        assert!(NfsError::ConnectionLost("x".into()).is_connection_level());
        assert!(NfsError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_level());
        assert!(!NfsError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_connection_level());
        assert!(!NfsError::Busy.is_connection_level());
    }

    #[test]
    fn duplicate_preserves_kind_and_message() {
        let original = NfsError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        let copy = original.duplicate();
        assert!(copy.is_connection_level());
        assert_eq!(copy.to_string(), original.to_string());

        let status = NfsError::Server { status: 28 }.duplicate();
        assert!(matches!(status, NfsError::Server { status: 28 }));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            NfsError::Timeout("READ xid 0x00000007".into()).to_string(),
            "timed out: READ xid 0x00000007"
        );
        assert_eq!(
            NfsError::Server { status: 70 }.to_string(),
            "server returned NFS status 70"
        );
        assert_eq!(NfsError::ServerTryLater.to_string(), "server busy, try later");
        assert!(
            NfsError::Protocol("bad xid".into())
                .to_string()
                .contains("protocol error:")
        );
    }
}
