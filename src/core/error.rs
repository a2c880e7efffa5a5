//! Error taxonomy shared by the session state machine and the transfer engine.

use thiserror::Error;

/// Every failure the core can report to its caller.
///
/// Variants map one-to-one onto a recovery policy: identity collisions are
/// retried, precondition violations are returned synchronously, channel
/// failures tear the session down, and protocol violations drop the
/// offending message while the session continues.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer id {0} is already taken")]
    IdentityCollision(String),

    #[error("invalid remote id '{0}': expected exactly 6 digits")]
    InvalidRemoteIdFormat(String),

    #[error("cannot connect to our own id {0}")]
    SelfConnection(String),

    #[error("a connection is already active or awaiting a decision")]
    SessionBusy,

    #[error("no open channel")]
    NotConnected,

    #[error("no connection request is awaiting a decision")]
    NoPendingRequest,

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("screen capture denied: {0}")]
    MediaCaptureDenied(String),

    #[error("screen capture unsupported")]
    MediaUnsupported,

    #[error("a transfer is already active in this direction")]
    TransferAlreadyActive,

    #[error("no incoming file offer is awaiting a decision")]
    NoIncomingOffer,

    #[error("input forwarding requires the controller role with pointer focus")]
    NotControlling,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
