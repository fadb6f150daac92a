//! Error types for the resource client.
//!
//! # Design
//! `Usage` covers call-site mistakes (updating a resource that was never
//! persisted, starting an OAuth exchange without a callback URI). It is
//! returned before any request is built. Every non-2xx response lands in
//! `Http` with the raw status and body, 401 included; the session teardown
//! that accompanies a 401 is a side effect inside the client, not a separate
//! variant.

use thiserror::Error;

/// Failure reported by a [`Transport`](crate::Transport) before any HTTP
/// status was received (connection refused, DNS, TLS, ...).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport failed: {0}")]
pub struct TransportError(pub String);

/// Errors returned by `ResourceClient` operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The call itself is invalid; nothing was sent.
    #[error("invalid call: {0}")]
    Usage(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A 2xx response whose body is not the expected JSON.
    #[error("could not decode HTTP {status} response: {message}")]
    Decode {
        status: u16,
        body: String,
        message: String,
    },

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The request never produced a response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Well-formed JSON that lacks a field the operation depends on.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A single-object extension call returned several objects.
    #[error("expected at most one object, received {0}")]
    TooManyResults(usize),
}

impl ClientError {
    /// The HTTP status associated with this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } | ClientError::Decode { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        ClientError::Usage(msg.into())
    }
}
