// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type with a small kind taxonomy, constructed via the [`err!`] and
//! [`bail!`] macros.

use std::error::Error as StdError;
use std::fmt;

/// Classification of a [`Error`].
///
/// The set mirrors how the engine recovers: transient kinds are retried
/// locally, everything else surfaces through the session's progress stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Cooperative stop; not a failure.
    Cancelled,

    /// A source that can't be opened or persistently can't decode. Fatal to
    /// the session that owns it.
    UnreadableSource,

    /// A transient decode failure; skip the frame and continue.
    Decode,

    /// A remote collaborator failed in a retryable way (timeout, 429, 5xx).
    Unavailable,

    /// A remote collaborator rejected the request permanently (other 4xx,
    /// authentication failure). Never retried.
    Rejected,

    /// Structured output from a collaborator could not be parsed/validated.
    Parse,

    /// A local token bucket is empty. Internal; callers await refill.
    RateLimited,

    /// The caller supplied something invalid (bad URI, bad config value).
    InvalidArgument,

    /// A bug or unclassifiable local failure.
    Internal,
}

impl ErrorKind {
    /// True if a retry with backoff is worthwhile.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable | ErrorKind::Decode | ErrorKind::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::UnreadableSource => "Unreadable source",
            ErrorKind::Decode => "Decode error",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::Parse => "Parse failure",
            ErrorKind::RateLimited => "Rate limited",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::Internal => "Internal",
        })
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// Boxed so that `Result<T, Error>` stays a couple of words wide.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    #[doc(hidden)]
    pub fn with_msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    #[doc(hidden)]
    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the same error with its kind replaced.
    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.0.kind = kind;
        self
    }

    /// Display adapter which includes the full source chain, for logging:
    /// `error!(err = %e.chain(), ...)`.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = StdError::source(self.0);
        while let Some(s) = source {
            write!(f, ": caused by: {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Constructs an [`Error`] from a kind and optional `msg(...)`/`source(...)`
/// clauses.
///
/// ```
/// use vigil_base::{err, ErrorKind};
/// let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
/// let e = err!(Unavailable, msg("describe attempt {} failed", 2), source(io));
/// assert_eq!(e.kind(), ErrorKind::Unavailable);
/// assert_eq!(e.to_string(), "Unavailable: describe attempt 2 failed");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($msg)*))
    };
    ($kind:ident, source($source:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($source)
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($msg)*))
            .with_source($source)
    };
}

/// `return Err(err!(...))`.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*))
    };
}
