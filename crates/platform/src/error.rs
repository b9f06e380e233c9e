//! Error types for KimCloud

use std::fmt;

/// Unified error type for all KimCloud operations.
///
/// Every variant except [`CloudError::AuthFailure`] and [`CloudError::FileIo`]
/// is fatal for the connection it was raised on.
#[derive(Debug)]
pub enum CloudError {
    /// Socket or other I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed packet length or padding
    Framing(String),

    /// No common algorithm in some negotiated category
    NegotiationFailure(String),

    /// KEXINIT payload could not be parsed
    MalformedNegotiation(String),

    /// Key exchange message was unparsable or incomplete
    KeyExchange(String),

    /// Integrity check failed for the frame expected at `sequence`
    MacMismatch {
        /// Cipher sequence number the frame was checked against
        sequence: u32,
    },

    /// Encrypted frame shorter than its MAC tag
    FrameTooShort(usize),

    /// Credentials rejected by the server
    AuthFailure(String),

    /// Destination or source file could not be opened, read or written
    FileIo(String),

    /// Message not valid in the current session state
    ProtocolViolation(String),
}

impl CloudError {
    /// Returns whether the connection may continue after this error.
    ///
    /// Authentication failures can be retried on the same connection, and a
    /// file error only aborts the transfer it occurred in.
    ///
    /// # Example
    ///
    /// ```
    /// use kimcloud_platform::CloudError;
    ///
    /// assert!(CloudError::AuthFailure("bad password".into()).is_recoverable());
    /// assert!(!CloudError::MacMismatch { sequence: 3 }.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloudError::AuthFailure(_) | CloudError::FileIo(_))
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::Io(e) => write!(f, "IO error: {}", e),
            CloudError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CloudError::Framing(msg) => write!(f, "Framing error: {}", msg),
            CloudError::NegotiationFailure(msg) => write!(f, "Negotiation failure: {}", msg),
            CloudError::MalformedNegotiation(msg) => {
                write!(f, "Malformed negotiation message: {}", msg)
            }
            CloudError::KeyExchange(msg) => write!(f, "Key exchange failure: {}", msg),
            CloudError::MacMismatch { sequence } => {
                write!(f, "MAC mismatch at sequence {}", sequence)
            }
            CloudError::FrameTooShort(len) => {
                write!(f, "Encrypted frame too short: {} bytes", len)
            }
            CloudError::AuthFailure(msg) => write!(f, "Authentication failed: {}", msg),
            CloudError::FileIo(msg) => write!(f, "File I/O error: {}", msg),
            CloudError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for CloudError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CloudError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        CloudError::Io(err)
    }
}

/// Result type for KimCloud operations
pub type CloudResult<T> = Result<T, CloudError>;
