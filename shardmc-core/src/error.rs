//! Error types shared by every part of the crate.

use std::fmt::{self, Display, Formatter};

/// A status code returned in a response header's `vbucket_or_status` field.
///
/// `KeyTooLarge` is not a wire status: it is synthesized client-side when a
/// key exceeds [`crate::MAX_KEY_SIZE`] before any request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrOnNonNumericValue,
    VbucketBelongsToAnotherServer,
    AuthenticationError,
    AuthenticationContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    KeyTooLarge,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(val: u16) -> Self {
        match val {
            0x00 => Status::NoError,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArguments,
            0x05 => Status::ItemNotStored,
            0x06 => Status::IncrDecrOnNonNumericValue,
            0x07 => Status::VbucketBelongsToAnotherServer,
            0x08 => Status::AuthenticationError,
            0x09 => Status::AuthenticationContinue,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            other => Status::Unknown(other),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoError => write!(f, "no error"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::ItemNotStored => write!(f, "item not stored"),
            Status::IncrDecrOnNonNumericValue => write!(f, "incr/decr on non-numeric value"),
            Status::VbucketBelongsToAnotherServer => write!(f, "vbucket belongs to another server"),
            Status::AuthenticationError => write!(f, "authentication error"),
            Status::AuthenticationContinue => write!(f, "authentication continue"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::InternalError => write!(f, "internal error"),
            Status::Busy => write!(f, "busy"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::KeyTooLarge => write!(f, "key too large"),
            Status::Unknown(code) => write!(f, "unknown status 0x{:02x}", code),
        }
    }
}

/// A malformed wire frame: header too short, bad magic, or a body that
/// doesn't match the header's declared length.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet shorter than the 24-byte header")]
    PacketTooSmall,
    #[error("body length does not match the header")]
    BodySizeMismatch,
    #[error("invalid magic byte: {0:#x}")]
    InvalidMagic(u8),
}

/// Every error this crate can produce.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error communicating over the wire (includes the stale-connection
    /// "connection closed" case, detected by a short/zero-byte read).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame that cannot be parsed as the binary protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A response carried a non-zero status that the calling operation's
    /// failure predicate does not treat as a soft/boolean outcome.
    #[error("memcached status error: {status} ({message})")]
    Status { status: Status, message: String },

    /// Failed to (de)serialize a value via bincode.
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    /// A key, after encoding, exceeded the 250-byte wire limit. Raised
    /// client-side before any I/O.
    #[error("key too large: {0} bytes (max 250)")]
    KeyTooLarge(usize),

    /// The connection was closed by the peer before a full frame was read.
    /// A subtype of a protocol/status error that drives the stale-recovery
    /// retry path.
    #[error("connection closed mid-frame")]
    ConnectionClosed,
}

impl Error {
    /// True for the distinct "stale connection" error kind (§7, error kind
    /// 3) that the retry wrapper narrows on.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }

    pub(crate) fn status(status: Status, message: impl Into<Vec<u8>>) -> Self {
        Error::Status {
            status,
            message: String::from_utf8_lossy(&message.into()).into_owned(),
        }
    }
}
