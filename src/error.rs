//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// A Responder was asked for its peer before one was learned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no peer bound yet")]
pub struct NoPeer;

/// Configuration rejected at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("initiator requires a remote address")]
    MissingRemote,

    #[error("responder must not be given a remote address")]
    UnexpectedRemote,

    #[error("mtu {0} out of range ({min}..={max})", min = crate::config::MIN_MTU, max = crate::config::MAX_MTU)]
    MtuOutOfRange(u16),

    #[error("keepalive interval must be greater than zero")]
    ZeroKeepaliveInterval,

    #[error("invalid interface name {0:?} (1 to 15 bytes, no NUL or '/')")]
    InvalidDeviceName(String),
}

/// Failure that stops the relay loop.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A long-lived descriptor returned end-of-file.
    #[error("{0}: descriptor closed")]
    Closed(&'static str),

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Name of the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Closed(op) | Self::Io { op, .. } => op,
        }
    }
}

/// Send failures worth retrying: the datagram was not sent, but the socket is
/// still usable.
pub fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
        _ => err.raw_os_error() == Some(libc::ENOBUFS),
    }
}
