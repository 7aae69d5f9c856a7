//! Bridge Errors
//!
//! A single error type crosses the boundary in both directions. Guest
//! exceptions, host raises and engine termination are kept apart as
//! distinct variants and converted at each edge.

use std::fmt;

use crate::value::Value;
use crate::wrapper::JsObject;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors produced by the bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed guest source; never reached execution.
    #[error("Compile error in {origin}: {message}")]
    Compile { origin: String, message: String },

    /// A value could not be converted across the boundary.
    #[error("Cannot convert {kind}: {reason}")]
    Conversion { kind: String, reason: String },

    /// An ordinary exception thrown by guest code.
    #[error("Uncaught {0}")]
    Thrown(GuestException),

    /// A host error raised while servicing a call made by guest code.
    #[error("Host error in guest callback: {source}")]
    HostRaisedInGuestCallback {
        source: Box<Error>,
        guest_stack: Option<String>,
    },

    /// An error raised by host code, destined for the guest.
    #[error("{0}")]
    Host(HostError),

    /// A handle or wrapper was used after its context was disposed.
    #[error("Handle used after its context was disposed")]
    InvalidatedHandle,

    /// Guest code for one isolate was requested while another isolate is
    /// entered on the calling thread.
    #[error("Isolate {requested} cannot run while isolate {entered} is entered on this thread")]
    WrongIsolateThread { entered: u64, requested: u64 },

    /// The engine terminated execution. Guest code cannot catch this.
    #[error("Execution terminated: {reason}")]
    Fatal { reason: String },

    /// Enter/leave ordering violation.
    #[error("Context stack violation: {reason}")]
    ContextStack { reason: String },

    #[error("Dispose refused: {reason}")]
    DisposeRefused { reason: String },

    /// A debug listener tried to call back into the bridge.
    #[error("Debug listeners cannot call into the guest")]
    DebugReentry,
}

impl Error {
    pub fn conversion(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub(crate) fn context_stack(reason: impl Into<String>) -> Self {
        Self::ContextStack {
            reason: reason.into(),
        }
    }

    /// Shorthand for a host-raised error of the given kind.
    pub fn host(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Host(HostError::new(kind, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::host(ErrorKind::TypeError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::host(ErrorKind::RangeError, message)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// The guest exception carried by this error, if any.
    pub fn guest_exception(&self) -> Option<&GuestException> {
        match self {
            Self::Thrown(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<HostError> for Error {
    fn from(error: HostError) -> Self {
        Self::Host(error)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Guest exceptions
// ─────────────────────────────────────────────────────────────────────────────

/// A value thrown by guest code, converted to the host side
#[derive(Debug, Clone)]
pub struct GuestException {
    /// The thrown value itself. Error objects arrive as [`Value::Js`].
    pub payload: Value,
    /// `error.name` for error objects (`"TypeError"`, ...).
    pub name: Option<String>,
    pub message: String,
    /// Raw guest stack description.
    pub stack: Option<String>,
    /// `error.cause`, one level deep.
    pub cause: Option<Box<Error>>,
    /// The thrown object by identity, when an object was thrown. Rethrowing
    /// the exception into the guest throws this object.
    pub thrown: Option<JsObject>,
}

impl GuestException {
    /// Stack frames parsed from [`GuestException::stack`].
    pub fn frames(&self) -> Vec<StackFrame> {
        self.stack.as_deref().map(parse_stack).unwrap_or_default()
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !self.message.is_empty() => write!(f, "{name}: {}", self.message),
            Some(name) => f.write_str(name),
            None => f.write_str(&self.message),
        }
    }
}

/// One frame of a guest stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub script: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Parse QuickJS stack text (`    at name (file:line:col)`).
pub fn parse_stack(stack: &str) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix("at ")?;
            let (function, location) = match line.rfind(" (") {
                Some(index) if line.ends_with(')') => {
                    (&line[..index], &line[index + 2..line.len() - 1])
                }
                _ => ("<anonymous>", line),
            };

            let mut parts = location.rsplitn(3, ':');
            let last = parts.next();
            let middle = parts.next();
            let rest = parts.next();
            let row = middle.and_then(|m| m.parse::<u32>().ok());
            let column = last.and_then(|c| c.parse::<u32>().ok());
            let frame = match (rest, row, column) {
                (Some(script), Some(row), Some(column)) => StackFrame {
                    function: function.to_string(),
                    script: script.to_string(),
                    line: Some(row),
                    column: Some(column),
                },
                _ => StackFrame {
                    function: function.to_string(),
                    script: location.to_string(),
                    line: None,
                    column: None,
                },
            };
            Some(frame)
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Host errors
// ─────────────────────────────────────────────────────────────────────────────

/// Guest error class a host error is thrown as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
}

impl ErrorKind {
    /// Name of the guest constructor for this kind.
    pub fn class_name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
        }
    }

    pub fn from_class_name(name: &str) -> Self {
        match name {
            "TypeError" => Self::TypeError,
            "RangeError" => Self::RangeError,
            "ReferenceError" => Self::ReferenceError,
            "SyntaxError" => Self::SyntaxError,
            _ => Self::Error,
        }
    }
}

/// An error raised on the host side
#[derive(Debug, Clone)]
pub struct HostError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<Error>>,
}

impl HostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the error that caused this one.
    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.class_name(), self.message)
    }
}
