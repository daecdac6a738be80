//! Error types for the request bridge.
//!
//! # Design
//! Nothing here ever crosses the host boundary as a live error. Each variant
//! maps to the small integer the host sees: `BridgeError::code` gives the
//! negative sentinel returned by registry/dispatch calls, `JsonError::code`
//! the positive result code of arena operations, and
//! `TransportError::failure_class` the code handed to the failure callback.

use crate::registry::Handle;

/// Errors returned by client, request and WebSocket operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The transport client could not be constructed (bad endpoint, trust store).
    #[error("failed to create client: {0}")]
    ClientCreation(String),

    /// A client, header-set or session handle does not exist.
    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: Handle },

    /// The method code is outside the supported range.
    #[error("invalid HTTP method code {0}")]
    InvalidMethod(i32),

    /// A JSON body handle could not be resolved.
    #[error("invalid JSON body: {0}")]
    Json(#[from] JsonError),

    /// The worker pool is gone or refused the job.
    #[error("failed to dispatch request: {0}")]
    DispatchFailure(String),

    /// A WebSocket could not be opened or written to.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A value could not be serialized for the wire.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Negative sentinel returned to the host in place of a handle or id.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::InvalidHandle { .. } | BridgeError::ClientCreation(_) => -1,
            BridgeError::WebSocket(_) => -1,
            BridgeError::DispatchFailure(_) => -2,
            BridgeError::InvalidMethod(_) => -3,
            BridgeError::Json(_) | BridgeError::Serialization(_) => -4,
        }
    }
}

/// Errors returned by JSON arena operations.
#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("invalid node handle {0}")]
    InvalidNode(Handle),

    #[error("node is not an object")]
    NotObject,

    #[error("node is not an array")]
    NotArray,

    #[error("invalid value node {0}")]
    InvalidValue(Handle),

    #[error("key {0:?} not found")]
    MissingKey(String),

    #[error("value has the wrong type")]
    WrongType,

    #[error("index {0} out of range")]
    OutOfRange(i32),

    #[error("object keys must be non-empty")]
    InvalidKey,

    #[error("nodes must both be objects or both be arrays")]
    Mismatched,

    #[error("number is not finite")]
    NotFinite,

    #[error("node {0} is persistent")]
    Persistent(Handle),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl JsonError {
    /// Result code of a failed arena operation.
    ///
    /// Setters report 1 (node), 2 (not an object), 3 (value); getters report
    /// 1 (node), 2 (key or index), 3 (type).
    pub fn code(&self) -> i32 {
        match self {
            JsonError::InvalidNode(_) | JsonError::NotArray | JsonError::Parse(_) => 1,
            JsonError::Mismatched | JsonError::NotFinite => 1,
            JsonError::NotObject | JsonError::MissingKey(_) | JsonError::OutOfRange(_) => 2,
            JsonError::Persistent(_) => 2,
            JsonError::InvalidValue(_) | JsonError::WrongType | JsonError::InvalidKey => 3,
        }
    }

    /// Negative code for constructors that otherwise return a handle.
    pub fn handle_code(&self) -> i32 {
        match self {
            JsonError::InvalidKey | JsonError::Mismatched | JsonError::NotFinite => -1,
            _ => -2,
        }
    }
}

/// Failures observed while executing a request on a worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// HTTP-protocol level failure: connect, TLS, malformed response.
    #[error("{0}")]
    Http(String),

    /// I/O and other recognised failures outside the protocol layer.
    #[error("{0}")]
    Generic(String),

    /// The worker panicked or the failure could not be classified.
    #[error("{0}")]
    Unknown(String),
}

impl TransportError {
    /// Code passed to the failure callback.
    pub fn failure_class(&self) -> i32 {
        match self {
            TransportError::Http(_) => 1,
            TransportError::Generic(_) => 2,
            TransportError::Unknown(_) => 3,
        }
    }
}
