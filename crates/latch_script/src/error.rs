//! Error kinds crossing the script boundary
//!
//! Inside trampolines everything is a [`ScriptError`] value. It only becomes a
//! thrown script exception at the very edge, and only becomes a host-side
//! `Err` once control is back in native code.

use thiserror::Error;

use crate::boxes::BoxKey;

/// Errors surfaced by the bridge
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Script code threw, or a script callable failed when invoked from native code
    #[error("{message}")]
    Evaluation {
        message: String,
        stack: Option<String>,
    },

    /// A global binding that was asked for does not exist
    #[error("{name} is undefined")]
    Key { name: String },

    /// A value crossing the boundary has the wrong shape or linkage
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Bridge misuse or corrupted state; abort the current operation
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl ScriptError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::Fatal(_))
    }

    /// Message plus stack trace, the way a host log line wants it
    pub fn report(&self) -> String {
        match self {
            ScriptError::Evaluation {
                message,
                stack: Some(stack),
            } if !stack.is_empty() => format!("{message}\n{stack}"),
            other => other.to_string(),
        }
    }
}

/// Boundary type errors; always raised as a catchable script `TypeError`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("Constructor must be called with 'new'.")]
    NotConstructCall,

    #[error("expected at least {expected} argument(s), got {given}")]
    ArgumentCount { expected: usize, given: usize },

    #[error("expected {expected}, found {found}")]
    Shape { expected: String, found: String },

    #[error("missing required property `{field}`")]
    MissingField { field: String },

    #[error("expected reference to {expected}, but the value carries no native object")]
    MissingLinkage { expected: String },

    #[error("native object behind this handle is no longer available")]
    StaleHandle,
}

impl TypeError {
    pub fn shape(expected: impl Into<String>, found: impl Into<String>) -> Self {
        TypeError::Shape {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Programming errors. Raised into script as `InternalError` and always
/// reported back to the host, even if script code catches them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("handle resolved to a null native object")]
    NullHandle,

    #[error("exclusive box {key} was already emptied")]
    ExclusiveBoxEmptied { key: BoxKey },

    #[error("exclusive box {key} is lent to a call in progress")]
    ExclusiveBoxBorrowed { key: BoxKey },

    #[error("box {key} no longer exists")]
    StaleBoxKey { key: BoxKey },

    #[error("type `{type_name}` is not registered with the bridge")]
    UnregisteredType { type_name: String },

    #[error("cannot convert `{from}` to `{to}`")]
    CastFailed { from: String, to: String },

    #[error("stack index {index} out of range (top = {top})")]
    StackIndex { index: i32, top: usize },

    #[error("native code panicked: {message}")]
    Panic { message: String },

    #[error("script engine failure: {message}")]
    Engine { message: String },

    #[error("bridge was dropped")]
    BridgeDropped,
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;
