//! Structured error types for refetch.
//!
//! Two kinds of failure exist and they never mix:
//!
//! - [`RefetchError`] is a **configuration or lifecycle fault**. It is returned
//!   synchronously from [`Connection::reconcile`](crate::Connection::reconcile)
//!   and [`Connection::invoke`](crate::Connection::invoke) and is never retried.
//! - [`Rejection`] is a **transport rejection**. It never crosses the API as an
//!   `Err`; it is carried by a rejected [`PromiseState`](crate::PromiseState)
//!   and may be intercepted by a `catch` / `and_catch` continuation.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` is ever stored in a cell.**
//!
//! - `anyhow` is internal transport (ergonomic for [`Fetch`](crate::Fetch) executors)
//! - `Rejection` is the only externalized failure (cloneable, serializable)
//!
//! # Example
//!
//! ```ignore
//! use refetch::{Connection, RefetchError, Specs, Mapping};
//!
//! let specs = Specs::new().with("user", Mapping::new().url("/users/1").value(1));
//! match connection.reconcile(specs) {
//!     Err(RefetchError::ConflictingSource { name }) => eprintln!("{name} declares both"),
//!     Err(e) => eprintln!("round aborted: {e}"),
//!     Ok(()) => {}
//! }
//! ```

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Rejection
// =============================================================================

/// The reason carried by a rejected cell.
///
/// Built from an executor fault ([`Rejection::from_error`]), from a decoded
/// error body ([`Rejection::from_cause`]), or from a plain message.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{message}")]
pub struct Rejection {
    /// Human-readable message.
    pub message: String,
    /// Decoded error body, when the rejection came from a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
    /// HTTP status of the response that was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Rejection {
    /// Create a rejection with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            status: None,
        }
    }

    /// Create a rejection from an executor fault.
    ///
    /// The message is the full context chain of the error (`outer: inner`).
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self::new(format!("{error:#}"))
    }

    /// Create a rejection from a decoded error body.
    ///
    /// The message is taken from the body's `error` field, then its `message`
    /// field, and falls back to `fallback` (usually the status text).
    pub fn from_cause(cause: Value, fallback: impl Into<String>) -> Self {
        let message = ["error", "message"]
            .iter()
            .find_map(|key| match cause.get(key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| fallback.into());

        Self {
            message,
            cause: Some(cause),
            status: None,
        }
    }

    /// Attach the HTTP status that produced this rejection.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<&str> for Rejection {
    fn from(message: &str) -> Self {
        Rejection::new(message)
    }
}

impl From<String> for Rejection {
    fn from(message: String) -> Self {
        Rejection::new(message)
    }
}

impl From<RefetchError> for Rejection {
    fn from(error: RefetchError) -> Self {
        Rejection::new(error.to_string())
    }
}

// =============================================================================
// Refetch Error
// =============================================================================

/// Structured error type for refetch operations.
///
/// Every variant is a programmer or lifecycle error: the round that raised it
/// is aborted and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefetchError {
    /// A mapping declared both a `value` and a `url`.
    #[error("mapping `{name}` must declare exactly one of `value` or `url`, not both")]
    ConflictingSource {
        /// The name the mapping was bound to.
        name: String,
    },

    /// A mapping declared neither a `value` nor a `url`.
    #[error("mapping `{name}` must declare exactly one of `value` or `url`")]
    MissingSource {
        /// The name the mapping was bound to.
        name: String,
    },

    /// A mapping with a functional value did not declare `comparison`.
    #[error("mapping `{name}` with a functional `value` must also declare `comparison`")]
    LazyValueWithoutComparison {
        /// The name the mapping was bound to.
        name: String,
    },

    /// A url mapping has no fetch executor in the mapping or the defaults.
    #[error("mapping `{name}` has a `url` but no fetch executor is configured")]
    MissingFetch {
        /// The name the mapping was bound to.
        name: String,
    },

    /// The method is not a valid HTTP token.
    #[error("mapping `{name}` has an invalid method {method:?}")]
    InvalidMethod {
        /// The name the mapping was bound to.
        name: String,
        /// The rejected method.
        method: String,
    },

    /// A string option (credentials, redirect, mode) is not one of its allowed values.
    #[error("{option} must be one of {allowed}; got {value:?}")]
    InvalidOption {
        /// Which option was being parsed.
        option: &'static str,
        /// Comma-separated allowed values.
        allowed: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A `then` / `catch` continuation returned a deferred trigger.
    #[error("continuation of `{name}` must return a mapping or url, not a deferred trigger")]
    DeferredContinuation {
        /// The name whose continuation misbehaved.
        name: String,
    },

    /// `invoke` was called for a name that is not bound to a deferred trigger.
    #[error("`{name}` is not bound to a deferred trigger")]
    UnknownTrigger {
        /// The name that was invoked.
        name: String,
    },

    /// `PromiseState::adopt` was given a cell that has not settled.
    #[error("cannot resolve with a promise state that has not settled")]
    UnsettledResolve,

    /// The connection has been torn down.
    #[error("connection has been torn down")]
    TornDown,

    /// A connection was built outside of a tokio runtime.
    #[error("a connection must be built inside a tokio runtime")]
    NoRuntime,
}

impl RefetchError {
    /// The mapping name this fault concerns, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            RefetchError::ConflictingSource { name }
            | RefetchError::MissingSource { name }
            | RefetchError::LazyValueWithoutComparison { name }
            | RefetchError::MissingFetch { name }
            | RefetchError::InvalidMethod { name, .. }
            | RefetchError::DeferredContinuation { name }
            | RefetchError::UnknownTrigger { name } => Some(name),
            RefetchError::InvalidOption { .. }
            | RefetchError::UnsettledResolve
            | RefetchError::TornDown
            | RefetchError::NoRuntime => None,
        }
    }
}
