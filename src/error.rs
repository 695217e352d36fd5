//! Error taxonomy shared by every component of this crate.
//!
//! A single `Error` type carrying a `kind` plus an optional boxed cause,
//! with extension traits to attach a kind to any foreign `Result` without
//! losing the original error.

use std::error;
use std::fmt;
use std::result;

/// Wrapper result type used throughout this crate.
pub type Result<T> = result::Result<T, Error>;

/// Coarse classification of a failure: what the caller should do about it,
/// not what went wrong mechanically.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// A channel's peer closed it; terminal for that channel only.
    TransportClose,
    /// The underlying socket failed, or a protocol invariant was violated.
    TransportError,
    /// The peer handshake failed authentication.
    ChallengeError,
    /// Operation attempted on a peer/multiplexer that is not ready.
    NotConnected,
    /// Malformed frame: bad flow type, oversized payload, duplicate NEW.
    Protocol,
    /// A handshake or ClientHello read exceeded its bound.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorKind::TransportClose => "transport closed",
            ErrorKind::TransportError => "transport error",
            ErrorKind::ChallengeError => "challenge authentication failed",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::Protocol => "protocol violation",
            ErrorKind::Timeout => "timed out",
        };
        f.write_str(msg)
    }
}

/// The error type used throughout this crate.
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Build an error with no underlying cause.
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    /// Wrap an arbitrary error, tagging it with `kind`.
    pub fn wrap<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(source.into()),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{:?}: {:?}", self.kind, source),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind, source),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrap(ErrorKind::TransportError, e)
    }
}

/// Extension for wrapping a foreign error type into our own, tagged
/// with an [`ErrorKind`].
pub trait ResultContextExt {
    type T;

    fn context(self, kind: ErrorKind) -> Result<Self::T>;
}

impl<T, E> ResultContextExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn context(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::wrap(kind, e))
    }
}

/// Extension for producing an error with no preserved cause, useful when the
/// foreign error type isn't `Send + Sync` or carries no useful detail.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|_| Error::new(kind))
    }
}
