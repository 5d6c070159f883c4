//! Error types for the coordination layer.
//!
//! Three kinds of failure exist and they are deliberately kept apart:
//!
//! - [`StoreError`]: the backing key-value store could not answer (transport,
//!   script or reply-shape problems). Produced by [`KvScriptClient`](crate::store::KvScriptClient)
//!   implementations.
//! - [`InvalidArgument`]: the caller passed parameters that can never be served
//!   (zero window, zero capacity, empty key). Raised before any store call.
//! - Ownership mismatch on a lock is *not* an error; renew/unlock return `Ok(false)`.
//!
//! Rate limiting swallows `StoreError` (fail-closed); lock operations surface it
//! through [`CoordinationError`].

use std::fmt;

/// Boxed transport error carried by [`StoreError::Unavailable`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a key-value store client.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection broke mid-call.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] BoxError),
    /// The store rejected or aborted a server-side script.
    #[error("script `{script}` failed: {message}")]
    Script {
        /// Stable script identifier.
        script: &'static str,
        /// Message reported by the store.
        message: String,
    },
    /// The store answered with a value of the wrong shape.
    #[error("unexpected reply to {context}: {reply}")]
    UnexpectedReply {
        /// Operation that received the reply.
        context: &'static str,
        /// Debug rendering of the reply.
        reply: String,
    },
}

impl StoreError {
    /// Wrap any transport error as [`StoreError::Unavailable`].
    pub fn unavailable<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StoreError::Unavailable(err.into())
    }

    /// Build an [`StoreError::UnexpectedReply`] from any debuggable reply.
    pub fn unexpected_reply(context: &'static str, reply: impl fmt::Debug) -> Self {
        StoreError::UnexpectedReply { context, reply: format!("{:?}", reply) }
    }

    /// True for transport-level failures (as opposed to script or decoding errors).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Parameters that can never be served, rejected before touching the store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid argument `{name}`: {reason}")]
pub struct InvalidArgument {
    /// Name of the offending parameter.
    pub name: &'static str,
    /// Human-readable explanation.
    pub reason: String,
}

impl InvalidArgument {
    pub(crate) fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self { name, reason: reason.into() }
    }
}

/// Error returned by distributed lock operations.
///
/// Store failures propagate here instead of collapsing into `false`: treating an
/// outage as "lock released" would let two holders run concurrently.
#[derive(thiserror::Error, Debug)]
pub enum CoordinationError {
    /// Caller misuse, rejected synchronously.
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    /// The store could not confirm the outcome; ownership is unknown.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoordinationError {
    /// Check if this error came from the store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Check if this error is a rejected argument.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Borrow the store error if present.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}
