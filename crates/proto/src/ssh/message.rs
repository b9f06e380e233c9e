//! Protocol message type codes.
//!
//! Two code spaces exist:
//!
//! - **Handshake messages** ([`MessageType`]) are the first byte of a
//!   [`Packet`](super::Packet) payload before keys are in place.
//! - **Frame types** ([`FrameType`]) are the first byte of the decrypted
//!   envelope header once the cipher pair is ready.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::message::{FrameType, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 0x14);
//! assert_eq!(FrameType::from_u8(2), Some(FrameType::FileData));
//! ```

/// Handshake message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Algorithm negotiation.
    KexInit = 20,
    /// Signals that the cipher pair is in place.
    NewKeys = 21,
    /// Initiator's Diffie-Hellman public value.
    KexdhInit = 30,
    /// Responder's host key blob, public value and signature blob.
    KexdhReply = 31,
}

impl MessageType {
    /// Converts a byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::KexInit => "MSG_KEXINIT",
            MessageType::NewKeys => "MSG_NEWKEYS",
            MessageType::KexdhInit => "MSG_KEXDH_INIT",
            MessageType::KexdhReply => "MSG_KEXDH_REPLY",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Encrypted frame types carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// File announcement (name, size, chunk size); echoed as acknowledgment.
    FileStart = 1,
    /// One file chunk; an empty payload is an acknowledgment.
    FileData = 2,
    /// End of a file transfer.
    FileEnd = 3,
    /// Receiver could not open the destination; payload is a UTF-8 reason.
    FileError = 4,
    /// Orderly end of the session.
    Disconnect = 5,
    /// Username and password.
    AuthRequest = 10,
    /// Credentials accepted.
    AuthSuccess = 11,
    /// Credentials rejected.
    AuthFailure = 12,
}

impl FrameType {
    /// Converts a byte to a frame type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kimcloud_proto::ssh::message::FrameType;
    ///
    /// assert_eq!(FrameType::from_u8(10), Some(FrameType::AuthRequest));
    /// assert_eq!(FrameType::from_u8(6), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameType::FileStart),
            2 => Some(FrameType::FileData),
            3 => Some(FrameType::FileEnd),
            4 => Some(FrameType::FileError),
            5 => Some(FrameType::Disconnect),
            10 => Some(FrameType::AuthRequest),
            11 => Some(FrameType::AuthSuccess),
            12 => Some(FrameType::AuthFailure),
            _ => None,
        }
    }

    /// Returns the frame type name.
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::FileStart => "FILE_START",
            FrameType::FileData => "FILE_DATA",
            FrameType::FileEnd => "FILE_END",
            FrameType::FileError => "FILE_ERROR",
            FrameType::Disconnect => "DISCONNECT",
            FrameType::AuthRequest => "AUTH_REQUEST",
            FrameType::AuthSuccess => "AUTH_SUCCESS",
            FrameType::AuthFailure => "AUTH_FAILURE",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
