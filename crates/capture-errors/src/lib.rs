//! Error facade shared by the warning capture module and its bindings.
//!
//! Every failure carries a coarse [`ErrorKind`] (who is at fault), a stable
//! [`ErrorCode`] (what went wrong, surfaced to Python as an `ERR_*` string), a
//! human-readable message and an ordered list of context pairs.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Convenient alias used across crates that report `CaptureError`.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Who is responsible for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller passed something invalid.
    Usage,
    /// The host interpreter or filesystem misbehaved.
    Environment,
    /// Code under test misbehaved in a way we could not tolerate.
    Target,
    /// A bug in the capture module itself.
    Internal,
}

/// Stable error identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum ErrorCode {
    Unknown,
    InvalidPolicyValue,
    InvalidFilterTarget,
    SinkInstallFailed,
    SinkRestoreFailed,
    SinkStackCorrupted,
    RegistryScanFailed,
    LineTableUnavailable,
    OriginMismatch,
    ReplayFailed,
    Io,
}

impl ErrorCode {
    const ALL: [ErrorCode; 11] = [
        ErrorCode::Unknown,
        ErrorCode::InvalidPolicyValue,
        ErrorCode::InvalidFilterTarget,
        ErrorCode::SinkInstallFailed,
        ErrorCode::SinkRestoreFailed,
        ErrorCode::SinkStackCorrupted,
        ErrorCode::RegistryScanFailed,
        ErrorCode::LineTableUnavailable,
        ErrorCode::OriginMismatch,
        ErrorCode::ReplayFailed,
        ErrorCode::Io,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "ERR_UNKNOWN",
            ErrorCode::InvalidPolicyValue => "ERR_INVALID_POLICY_VALUE",
            ErrorCode::InvalidFilterTarget => "ERR_INVALID_FILTER_TARGET",
            ErrorCode::SinkInstallFailed => "ERR_SINK_INSTALL_FAILED",
            ErrorCode::SinkRestoreFailed => "ERR_SINK_RESTORE_FAILED",
            ErrorCode::SinkStackCorrupted => "ERR_SINK_STACK_CORRUPTED",
            ErrorCode::RegistryScanFailed => "ERR_REGISTRY_SCAN_FAILED",
            ErrorCode::LineTableUnavailable => "ERR_LINE_TABLE_UNAVAILABLE",
            ErrorCode::OriginMismatch => "ERR_ORIGIN_MISMATCH",
            ErrorCode::ReplayFailed => "ERR_REPLAY_FAILED",
            ErrorCode::Io => "ERR_IO",
        }
    }

    /// Parse the `ERR_*` representation back into a code.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == trimmed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried across the capture module.
#[derive(Debug)]
pub struct CaptureError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    pub context: Vec<(&'static str, String)>,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CaptureError {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attach a key/value pair; later pairs with the same key are kept as-is.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn source_ref(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            f.write_str(" (")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn Error + 'static))
    }
}

/// Build a usage error: `usage!(ErrorCode::X, "fmt {}", arg)`.
#[macro_export]
macro_rules! usage {
    ($code:expr, $($arg:tt)+) => {
        $crate::CaptureError::new($crate::ErrorKind::Usage, $code, format!($($arg)+))
    };
}

/// Build an environment error.
#[macro_export]
macro_rules! enverr {
    ($code:expr, $($arg:tt)+) => {
        $crate::CaptureError::new($crate::ErrorKind::Environment, $code, format!($($arg)+))
    };
}

/// Build a target error.
#[macro_export]
macro_rules! target {
    ($code:expr, $($arg:tt)+) => {
        $crate::CaptureError::new($crate::ErrorKind::Target, $code, format!($($arg)+))
    };
}

/// Build an internal error.
#[macro_export]
macro_rules! bug {
    ($code:expr, $($arg:tt)+) => {
        $crate::CaptureError::new($crate::ErrorKind::Internal, $code, format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_parse() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("ERR_NOPE"), None);
    }

    #[test]
    fn display_includes_code_and_context() {
        let err = usage!(ErrorCode::InvalidFilterTarget, "{} is not a function", "None")
            .with_context("index", "0");
        assert_eq!(err.kind, ErrorKind::Usage);
        assert_eq!(
            err.to_string(),
            "[ERR_INVALID_FILTER_TARGET] None is not a function (index=0)"
        );
        assert_eq!(err.context_value("index"), Some("0"));
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = enverr!(ErrorCode::Io, "failed to open log").with_source(io);
        assert_eq!(err.source_ref().map(|s| s.to_string()).as_deref(), Some("disk gone"));
        assert!(Error::source(&err).is_some());
    }
}
