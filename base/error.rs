// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type used throughout wdcap.
//!
//! Errors carry a coarse [`ErrorKind`] (the general-purpose gRPC status
//! classification), an optional message, and an optional source chain.

use std::fmt;

/// Error kind, taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("Cancelled")] Cancelled,
    #[error("Unknown")] Unknown,
    #[error("Invalid argument")] InvalidArgument,
    #[error("Deadline exceeded")] DeadlineExceeded,
    #[error("Not found")] NotFound,
    #[error("Already exists")] AlreadyExists,
    #[error("Permission denied")] PermissionDenied,
    #[error("Unauthenticated")] Unauthenticated,
    #[error("Resource exhausted")] ResourceExhausted,
    #[error("Failed precondition")] FailedPrecondition,
    #[error("Aborted")] Aborted,
    #[error("Out of range")] OutOfRange,
    #[error("Unimplemented")] Unimplemented,
    #[error("Internal")] Internal,
    #[error("Unavailable")] Unavailable,
    #[error("Data loss")] DataLoss,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: Option<String>) -> Self {
        Self {
            kind,
            msg,
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            msg: None,
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a value that `Display`s the full chain of causes.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, None)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            IoKind::UnexpectedEof => ErrorKind::DataLoss,
            _ => ErrorKind::Unknown,
        };
        Self::wrap(kind, e)
    }
}

/// `Display`s an [`Error`] along with all its causes, separated by `: `.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping the original as the
    /// source of the returned error.
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(kind, e))
    }
}

/// Constructs an [`Error`] from an `ErrorKind` variant name and an optional
/// format-style message.
///
/// ```
/// use wdcap_base::{err, ErrorKind};
/// let e = err!(NotFound, "no interim file for worker {}", 3);
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no interim file for worker 3");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None)
    };
    ($kind:ident, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($arg)+)))
    };
}

/// Returns early with an [`Error`] built as by [`err!`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return Err($crate::err!($($arg)+).into())
    };
}
