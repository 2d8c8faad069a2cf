//! Error handling for the live-session synchronization layer.
//!
//! Errors carry an [`ErrorKind`] modelled after gRPC status codes plus the
//! underlying cause. Most failures in this crate never reach a caller as an
//! `Error`: delivery failures resolve a [`Delivery`] to `false`, malformed
//! inbound messages make dispatch return `false`, and durable store failures
//! are logged where they happen. What remains are the failures a caller has
//! to act on:
//!
//! * illegal state transitions ([`ErrorKind::FailedPrecondition`])
//! * relay connection failures ([`ErrorKind::Unavailable`],
//!   [`ErrorKind::Cancelled`], [`ErrorKind::DeadlineExceeded`])
//! * configuration and secrets problems ([`ErrorKind::InvalidArgument`],
//!   [`ErrorKind::NotFound`])
//! * durable store I/O ([`ErrorKind::DataLoss`] and friends)
//!
//! [`Delivery`]: crate::reliability::Delivery

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Error kind plus the boxed cause.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The operation was cancelled, typically by the relay closing the
    /// connection or by the end of a set.
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// The relay did not answer in time.
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    /// The session is not in a state that allows the operation.
    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("operation aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    /// The relay or the durable store cannot be reached right now.
    #[error("service unavailable")]
    Unavailable = 14,

    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,

    #[error("no valid authentication credentials")]
    Unauthenticated = 16,
}

macro_rules! constructors {
    ($($(#[$meta:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$meta])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

constructors! {
    aborted => Aborted,
    already_exists => AlreadyExists,
    /// Use when the relay closed the connection or a set was ended while
    /// an operation was in flight.
    cancelled => Cancelled,
    /// Use when persisted data could not be read back or was truncated.
    data_loss => DataLoss,
    deadline_exceeded => DeadlineExceeded,
    /// Use for operations that the current connection status forbids, like
    /// going live twice.
    failed_precondition => FailedPrecondition,
    internal => Internal,
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    out_of_range => OutOfRange,
    permission_denied => PermissionDenied,
    resource_exhausted => ResourceExhausted,
    unauthenticated => Unauthenticated,
    /// Use when the transport is not open or the store cannot be reached.
    unavailable => Unavailable,
    unimplemented => Unimplemented,
    unknown => Unknown,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats as `"{kind}: {details}"`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Maps I/O errors of the durable store and the history watcher onto
/// their logical equivalents.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Maps websocket errors of the relay connection.
///
/// A closed connection is a cancellation, not a failure: the reconnect
/// loop decides whether to try again.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed => Self::cancelled(err),
            AlreadyClosed => Self::unavailable(err),
            Io(err) => err.into(),
            Capacity(_) => Self::out_of_range(err),
            WriteBufferFull(_) => Self::resource_exhausted(err.to_string()),
            AttackAttempt => Self::permission_denied(err),
            _ => Self::unavailable(err),
        }
    }
}

/// JSON errors go through the I/O mapping: syntax and data errors become
/// `InvalidArgument`, truncated input becomes `DataLoss`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Maps errors of the local database. Undecodable rows are data loss.
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error::*;
        match err {
            Io(err) => err.into(),
            RowNotFound => Self::not_found(err),
            Configuration(_) => Self::invalid_argument(err),
            PoolTimedOut | PoolClosed | WorkerCrashed => Self::unavailable(err),
            ColumnDecode { .. } | ColumnNotFound(_) | Decode(_) | TypeNotFound { .. } => {
                Self::data_loss(err)
            }
            _ => Self::internal(err),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}
