use thiserror::Error;

/// Why a string was rejected as a connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentity {
    #[error("identity is empty")]
    Empty,
    #[error("identity is longer than {max} characters")]
    TooLong { max: usize },
    #[error("identity contains a control character")]
    ControlCharacter,
}

/// Failure to authenticate a channel-open request. Fatal to the handshake:
/// the socket is never upgraded and nothing is registered.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no credential presented")]
    MissingToken,
    #[error("credential has expired")]
    Expired,
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential is malformed: {0}")]
    Malformed(String),
    #[error("credential names an unusable identity: {0}")]
    InvalidIdentity(#[from] InvalidIdentity),
}

/// An inbound frame that could not be turned into a routable signal.
/// The frame is dropped; the channel stays open.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("message is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    InvalidField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(InvalidIdentity),
}

/// A frame could not be queued on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendFailure {
    #[error("outbound buffer is full")]
    Full,
    #[error("channel is closed")]
    Closed,
}
