//! Error types for the cohort container framework.
//!
//! Every error is `Clone` so it can travel inside events delivered to
//! several subscribers.

use std::time::Duration;

use thiserror::Error;

use crate::container::ConnectionState;
use crate::identity::Id;

/// Errors raised while building an [`Id`] through a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdCreateError {
    /// No namespace registered under this name.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// Constructor arguments do not match any supported shape.
    #[error("namespace {namespace} expects {expected}, got {found}")]
    ArgumentMismatch {
        /// Namespace that rejected the arguments.
        namespace: String,
        /// Supported argument shapes.
        expected: String,
        /// Shape actually supplied.
        found: String,
    },

    /// The opaque value is malformed for this namespace.
    #[error("malformed {namespace} id: {reason}")]
    Malformed {
        /// Namespace that rejected the value.
        namespace: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Errors from the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport could not be opened.
    #[error("connection instantiation failed: {0}")]
    Instantiation(String),

    /// Operation did not complete in time.
    #[error("connection operation timed out")]
    Timeout,

    /// I/O failure on the underlying link.
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection has been closed and cannot be used again.
    #[error("connection closed")]
    Closed,

    /// The connection is not open yet.
    #[error("connection not connected")]
    NotConnected,

    /// `connect` was called on a connection that is already open.
    #[error("connection already connected")]
    AlreadyConnected,

    /// Frame exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Frame failed checksum verification.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> Self {
        ConnectionError::Io(error.to_string())
    }
}

/// Errors surfaced by `Container::connect`.
///
/// Terminal for the attempt: the container is back in `Disconnected` and the
/// core never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The container is not in the `Disconnected` state.
    #[error("cannot connect while {0}")]
    InvalidState(ConnectionState),

    /// The target ID could not be resolved to a transport address.
    #[error("malformed target {target}: {reason}")]
    MalformedTarget {
        /// The target that failed to resolve.
        target: Id,
        /// Why resolution failed.
        reason: String,
    },

    /// The group refused the join request.
    #[error("join refused: {0}")]
    Refused(String),

    /// No join reply within the connect timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// A `disconnect()` aborted the attempt.
    #[error("connect cancelled")]
    Cancelled,

    /// The transport failed while connecting.
    #[error("transport error: {0}")]
    Transport(#[from] ConnectionError),

    /// The group sent data that breaks membership invariants.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A join message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The container was disposed.
    #[error("container disposed")]
    Disposed,
}

/// Errors related to shared objects and their manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedObjectError {
    /// An object with this ID is already registered.
    #[error("shared object already exists: {0}")]
    AlreadyExists(Id),

    /// Replicated objects need a connected container.
    #[error("container not connected")]
    NotConnected,

    /// No object with this ID is registered.
    #[error("shared object not found: {0}")]
    NotFound(Id),

    /// No factory registered for the type name.
    #[error("no factory registered for type {0}")]
    UnknownFactory(String),

    /// The factory or activation hook failed.
    #[error("shared object creation failed: {0}")]
    CreateFailed(String),

    /// The message handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The message handler panicked.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// The ID is neither this container nor a group member.
    #[error("not a group member: {0}")]
    UnknownMember(Id),

    /// The object is not active and cannot process messages.
    #[error("shared object {0} is not active")]
    Inactive(Id),

    /// Payload encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The group send failed.
    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),
}

/// Errors from membership table updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// The same member appears twice.
    #[error("duplicate member: {0}")]
    DuplicateMember(Id),
}

/// Errors from message encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(String),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A timeout was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// A size limit was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}
