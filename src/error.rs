//! Closed problem-code taxonomy shared by the transport and every channel.
//!
//! A `close` control message carries `problem` as one of these string tags,
//! or is absent for an orderly close. Every fallible operation in this crate
//! eventually collapses into a [`Problem`] before it reaches the wire —
//! internal plumbing (config loading, CLI parsing) keeps using
//! `anyhow::Result`, and only maps into `Problem` at the point where an
//! internal error becomes a channel or transport close.

use std::io;

use thiserror::Error;

/// The closed set of problem codes a channel or the transport can close with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Problem {
    #[error("protocol-error")]
    ProtocolError,
    #[error("not-found")]
    NotFound,
    #[error("not-supported")]
    NotSupported,
    #[error("access-denied")]
    AccessDenied,
    #[error("authentication-failed")]
    AuthenticationFailed,
    #[error("terminated")]
    Terminated,
    #[error("disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("internal-error")]
    InternalError,
    #[error("change-conflict")]
    ChangeConflict,
    #[error("out-of-date")]
    OutOfDate,
    #[error("unknown-hostkey")]
    UnknownHostkey,
}

impl Problem {
    /// The wire string for this problem code, as it appears in a `close`
    /// control message's `problem` field.
    #[must_use]
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Problem::ProtocolError => "protocol-error",
            Problem::NotFound => "not-found",
            Problem::NotSupported => "not-supported",
            Problem::AccessDenied => "access-denied",
            Problem::AuthenticationFailed => "authentication-failed",
            Problem::Terminated => "terminated",
            Problem::Disconnected => "disconnected",
            Problem::Timeout => "timeout",
            Problem::InternalError => "internal-error",
            Problem::ChangeConflict => "change-conflict",
            Problem::OutOfDate => "out-of-date",
            Problem::UnknownHostkey => "unknown-hostkey",
        }
    }

    /// Map an [`io::Error`] onto the closed problem-code set.
    #[must_use]
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Problem::AccessDenied,
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => Problem::NotFound,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Problem::Disconnected,
            io::ErrorKind::TimedOut => Problem::Timeout,
            _ => match err.raw_os_error() {
                Some(libc::EACCES | libc::EPERM) => Problem::AccessDenied,
                Some(libc::ENOENT | libc::ECONNREFUSED | libc::ENETUNREACH) => Problem::NotFound,
                Some(libc::EPIPE) => Problem::Disconnected,
                Some(libc::ETIMEDOUT) => Problem::Timeout,
                _ => Problem::InternalError,
            },
        }
    }
}

/// Result alias for code that reports failures via the closed problem set.
pub type Result<T> = std::result::Result<T, Problem>;
