//! Error types for the WebSocket server core.
//!
//! [`Error`] covers everything that can go wrong once a connection exists:
//! framing violations, transport failures and misuse of a closed connection.
//! [`HandshakeError`] covers rejections that happen before a connection
//! exists and maps each one to the HTTP status the upgrade endpoint answers
//! with.

use thiserror::Error;

use crate::message::CloseCode;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on an established WebSocket connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Protocol violation detected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 where the protocol requires it (close reason).
    #[error("Invalid UTF-8 in close reason")]
    InvalidUtf8,

    /// Declared payload length exceeds the configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared payload length from the wire.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// Reassembled message exceeds the configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many fragments in a single message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Actual fragment count.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// Connection has been closed.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// Malformed HTTP request head.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// HTTP request head exceeds the configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Size seen so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid close code.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Invalid opcode value.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Control frame fragmented (RFC violation).
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Unmasked client frame (security violation).
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Reserved bits set without extension.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },
}

impl Error {
    /// Returns `true` for errors caused by the peer breaking RFC 6455 framing
    /// rules. These fail the connection with a close frame.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::InvalidUtf8
                | Error::FrameTooLarge { .. }
                | Error::MessageTooLarge { .. }
                | Error::TooManyFragments { .. }
                | Error::InvalidCloseCode(_)
                | Error::ReservedOpcode(_)
                | Error::InvalidOpcode(_)
                | Error::FragmentedControlFrame
                | Error::ControlFrameTooLarge(_)
                | Error::UnmaskedClientFrame
                | Error::ReservedBitsSet
        )
    }

    /// Close code sent to the peer when this error fails the connection.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::TooManyFragments { .. } => CloseCode::MessageTooBig,
            Error::InvalidUtf8 => CloseCode::InvalidPayload,
            Error::Io(_) | Error::ConnectionClosed(_) => CloseCode::Abnormal,
            _ => CloseCode::ProtocolError,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed(None),
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

/// Reasons an upgrade request is refused before any connection exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeError {
    /// `Upgrade: websocket` missing or carrying another value.
    #[error("Not a websocket handshake")]
    MissingUpgrade,

    /// `Sec-WebSocket-Key` missing or empty.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Request head could not be parsed or failed strict validation.
    #[error("Malformed handshake: {0}")]
    Malformed(String),

    /// The HTTP layer cannot hand over its raw stream.
    #[error("Connection does not support hijacking")]
    HijackUnsupported,

    /// The HTTP layer failed while handing over its raw stream.
    #[error("Hijack failed: {0}")]
    HijackFailed(String),

    /// Writing the 101 response failed.
    #[error("I/O error during handshake: {0}")]
    Io(String),
}

impl HandshakeError {
    /// HTTP status code the upgrade endpoint answers with.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            HandshakeError::MissingUpgrade
            | HandshakeError::MissingKey
            | HandshakeError::Malformed(_) => 400,
            HandshakeError::HijackUnsupported
            | HandshakeError::HijackFailed(_)
            | HandshakeError::Io(_) => 500,
        }
    }

    /// Returns `true` when the request itself was at fault.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.status() < 500
    }
}

impl From<Error> for HandshakeError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(msg) => HandshakeError::Io(msg),
            other => HandshakeError::Malformed(other.to_string()),
        }
    }
}
