//! Error codes and error types.

use core::fmt;
use std::sync::Arc;

/// Reason code carried by a channel-open failure.
///
/// Codes 1-4 are fixed by the connection protocol; anything else a peer
/// sends is preserved as [`RejectionReason::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Unknown(u32),
}

impl RejectionReason {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::AdministrativelyProhibited,
            2 => Self::ConnectFailed,
            3 => Self::UnknownChannelType,
            4 => Self::ResourceShortage,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::AdministrativelyProhibited => 1,
            Self::ConnectFailed => 2,
            Self::UnknownChannelType => 3,
            Self::ResourceShortage => 4,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdministrativelyProhibited => write!(f, "administratively prohibited"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::UnknownChannelType => write!(f, "unknown channel type"),
            Self::ResourceShortage => write!(f, "resource shortage"),
            Self::Unknown(code) => write!(f, "unknown reason {code}"),
        }
    }
}

/// Returned by `open_channel` when the peer refuses the channel.
///
/// This is a recoverable outcome: the connection stays up and the caller
/// may retry with other parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelError {
    pub reason: RejectionReason,
    pub message: String,
}

impl OpenChannelError {
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for OpenChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected: {} ({})", self.reason, self.message)
    }
}

impl std::error::Error for OpenChannelError {}

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    UnknownMessage(u8),
    InvalidUtf8,
    TrailingBytes(usize),
    FrameTooLarge { len: usize, max: usize },
    EmptyFrame,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::UnknownMessage(n) => write!(f, "unknown message number {n}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::EmptyFrame => write!(f, "empty frame"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Stream-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The stream has ended, either because it was closed or the peer went away.
    Closed,
    Io(std::io::Error),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "stream closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Errors returned by connection and channel operations.
///
/// The type is cheap to clone so that a single terminal cause can be
/// handed to every operation that was suspended when the connection went
/// down, and to every caller of `wait`.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// The connection was closed locally; no further operations are accepted.
    Closed,
    /// The underlying stream failed. Shared by all observers of the failure.
    Transport(Arc<TransportError>),
    /// The peer violated the connection protocol.
    Protocol(String),
    /// The peer refused to open a channel.
    Rejected(OpenChannelError),
    /// The channel has been closed and accepts no more operations.
    ChannelClosed { channel: u32 },
}

impl ConnectionError {
    /// The rejection details, if the peer refused a channel open.
    pub fn as_rejection(&self) -> Option<&OpenChannelError> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// True for errors that end the whole connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(_) | Self::Protocol(_))
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Rejected(e) => write!(f, "{e}"),
            Self::ChannelClosed { channel } => write!(f, "channel {channel} closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e.as_ref()),
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(Arc::new(e))
    }
}

impl From<OpenChannelError> for ConnectionError {
    fn from(e: OpenChannelError) -> Self {
        Self::Rejected(e)
    }
}
