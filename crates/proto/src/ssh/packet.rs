//! Handshake packet framing.
//!
//! Every handshake message (KEXINIT, KEXDH_INIT/REPLY, NEWKEYS) travels in a
//! length-and-padding-delimited packet. Post-handshake traffic uses the
//! encrypted envelope in [`envelope`](super::envelope) instead.
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length   (padding_length byte + payload + padding)
//! byte      padding_length  (>= 4)
//! byte[n1]  payload         (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding  (n2 = padding_length)
//! ```
//!
//! # Constraints
//!
//! - `4 + packet_length` is always a multiple of 8 for packets we build
//! - Padding bytes come from a caller-supplied cryptographically secure RNG
//! - Padding content is discarded on parse and never validated
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::Packet;
//! use rand::rngs::OsRng;
//!
//! let packet = Packet::new(b"KEXINIT payload".to_vec(), &mut OsRng);
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"KEXINIT payload");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use rand::{CryptoRng, RngCore};

/// Largest `packet_length` accepted from the wire.
///
/// Handshake messages are small; this bounds the allocation made for a
/// declared length before any bytes are read.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Smallest well-formed packet: length field, padding-length byte, one byte.
pub const MIN_PACKET_SIZE: usize = 6;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: usize = 4;

/// Alignment of `4 + packet_length`.
pub const BLOCK_SIZE: usize = 8;

/// Handshake packet.
///
/// # Invariants
///
/// - A packet built with [`Packet::new`] has at least 4 bytes of padding
/// - `4 + 1 + payload + padding` is a multiple of [`BLOCK_SIZE`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a new packet, padding it with bytes drawn from `rng`.
    ///
    /// # Arguments
    ///
    /// * `payload` - The message payload
    /// * `rng` - Secure random source for the padding bytes
    ///
    /// # Example
    ///
    /// ```rust
    /// use kimcloud_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"hello".to_vec(), &mut rand::rngs::OsRng);
    /// assert_eq!(packet.padding().len(), 6);
    /// ```
    pub fn new<R: RngCore + CryptoRng>(payload: Vec<u8>, rng: &mut R) -> Self {
        let mut padding = vec![0u8; padding_len_for(payload.len())];
        rng.fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes this packet to wire format.
    ///
    /// ```text
    /// uint32    packet_length (big-endian)
    /// byte      padding_length
    /// byte[n1]  payload
    /// byte[n2]  padding
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses a packet from wire format.
    ///
    /// Only the declared payload must be present; missing or surplus padding
    /// bytes are tolerated because padding is never inspected.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Framing`] if:
    /// - Data is shorter than 6 bytes
    /// - `packet_length` is too small to hold the padding-length byte and padding
    /// - The declared payload does not fit inside the remaining bytes
    ///
    /// # Example
    ///
    /// ```rust
    /// use kimcloud_proto::ssh::Packet;
    ///
    /// let data = [0, 0, 0, 6, 4, b'x', 0, 0, 0, 0];
    /// let packet = Packet::from_bytes(&data).unwrap();
    /// assert_eq!(packet.payload(), b"x");
    /// ```
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(CloudError::Framing(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                MIN_PACKET_SIZE
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        let padding_length = buf.get_u8() as usize;

        if packet_length < 1 + padding_length {
            return Err(CloudError::Framing(format!(
                "packet_length ({}) too small for padding_length ({})",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - padding_length - 1;
        if payload_length > buf.len() {
            return Err(CloudError::Framing(format!(
                "Incomplete payload: declared {} bytes, {} available",
                payload_length,
                buf.len()
            )));
        }

        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);

        let padding = buf[..padding_length.min(buf.len())].to_vec();

        Ok(Self { payload, padding })
    }
}

/// Returns the padding length for a payload of `payload_len` bytes.
///
/// The remainder-based padding is bumped by one block when it would fall
/// below [`MIN_PADDING_LEN`].
pub fn padding_len_for(payload_len: usize) -> usize {
    let unpadded = 4 + 1 + payload_len;
    let mut padding = BLOCK_SIZE - (unpadded % BLOCK_SIZE);
    if padding < MIN_PADDING_LEN {
        padding += BLOCK_SIZE;
    }
    padding
}

/// Wraps `payload` into a padded packet and returns its wire bytes.
pub fn wrap<R: RngCore + CryptoRng>(payload: &[u8], rng: &mut R) -> Vec<u8> {
    Packet::new(payload.to_vec(), rng).to_bytes()
}

/// Unwraps wire bytes into the contained payload.
///
/// # Errors
///
/// Same conditions as [`Packet::from_bytes`].
pub fn unwrap(data: &[u8]) -> CloudResult<Vec<u8>> {
    Packet::from_bytes(data).map(Packet::into_payload)
}
