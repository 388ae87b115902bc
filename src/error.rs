//! Crate error type.
//!
//! Modeled on the hand-rolled `ErrnoError` in the teacher's CLI entry
//! point: a thin wrapper with a manual `Display`/`std::error::Error` impl
//! rather than a derive-macro error crate, carrying the error-kind
//! vocabulary from the storage engine's error handling design (§7):
//! `Io`, `Corruption`, `NoSpace`, `Oom`, `Busy`, `NotFound`.

use std::fmt;

/// The kind of failure a core operation reports.
///
/// `Busy` and `NotFound` are routine control-flow signals, not failures:
/// `Busy` tells the commit engine's staging loop to stop early because a
/// buffer belongs to the delta that hasn't opened yet, and `NotFound` is
/// an ordinary lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Corruption,
    NoSpace,
    Oom,
    Busy,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "I/O error",
            ErrorKind::Corruption => "corruption",
            ErrorKind::NoSpace => "no space",
            ErrorKind::Oom => "out of memory",
            ErrorKind::Busy => "busy",
            ErrorKind::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// A core engine error: a kind plus a human-readable message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    source: Option<std::io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error { kind, msg: msg.into(), source: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Io, msg)
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Corruption, msg)
    }

    pub fn no_space(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::NoSpace, msg)
    }

    pub fn oom(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Oom, msg)
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Busy, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_busy(&self) -> bool {
        self.kind == ErrorKind::Busy
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error { kind: ErrorKind::Io, msg: e.to_string(), source: Some(e) }
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Error::io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
