//! Encrypted message envelope.
//!
//! After NEWKEYS every message travels as two length-prefixed encrypted
//! segments:
//!
//! ```text
//! uint32    encrypted header length
//! byte[n]   encrypted header || MAC
//! uint32    encrypted payload length      (only if payload_length > 0)
//! byte[m]   encrypted payload || MAC      (only if payload_length > 0)
//! ```
//!
//! The decrypted header is exactly nine bytes:
//!
//! ```text
//! byte      frame type
//! uint32    payload length
//! uint32    application sequence number
//! ```
//!
//! Every segment is one [`SessionCipher`] call, so a message with a payload
//! consumes two cipher sequence numbers.

use crate::ssh::crypto::{SessionCipher, MAC_LEN};
use crate::ssh::message::FrameType;
use bytes::{Buf, BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest file chunk a peer may send (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest encrypted segment accepted from the wire.
pub const MAX_SEGMENT_LEN: usize = MAX_CHUNK_SIZE + 64;

/// Decrypted header length.
pub const HEADER_LEN: usize = 9;

/// Decrypted envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub frame_type: FrameType,
    /// Length of the logical payload in bytes
    pub payload_length: u32,
    /// Application sequence number
    pub sequence: u32,
}

impl FrameHeader {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.frame_type as u8;
        out[1..5].copy_from_slice(&self.payload_length.to_be_bytes());
        out[5..9].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Parses a decrypted header.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] if the input is not exactly
    /// nine bytes or names an unknown frame type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kimcloud_proto::ssh::envelope::FrameHeader;
    /// use kimcloud_proto::ssh::message::FrameType;
    ///
    /// let header = FrameHeader::from_bytes(&[2, 0, 0, 0, 12, 0, 0, 0, 7]).unwrap();
    /// assert_eq!(header.frame_type, FrameType::FileData);
    /// assert_eq!(header.payload_length, 12);
    /// assert_eq!(header.sequence, 7);
    /// ```
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        if data.len() != HEADER_LEN {
            return Err(CloudError::ProtocolViolation(format!(
                "Frame header must be {} bytes, got {}",
                HEADER_LEN,
                data.len()
            )));
        }

        let mut buf = data;
        let code = buf.get_u8();
        let frame_type = FrameType::from_u8(code).ok_or_else(|| {
            CloudError::ProtocolViolation(format!("Unknown frame type: {}", code))
        })?;

        Ok(Self {
            frame_type,
            payload_length: buf.get_u32(),
            sequence: buf.get_u32(),
        })
    }
}

/// A decrypted application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Application sequence number from the header
    pub sequence: u32,
    /// Decrypted payload (may be empty)
    pub payload: Vec<u8>,
}

/// Encrypts one message into its wire form.
///
/// # Errors
///
/// Returns [`CloudError::Framing`] if the payload would produce a segment
/// larger than [`MAX_SEGMENT_LEN`].
pub fn seal(
    cipher: &mut SessionCipher,
    frame_type: FrameType,
    sequence: u32,
    payload: &[u8],
) -> CloudResult<Vec<u8>> {
    if payload.len() + MAC_LEN > MAX_SEGMENT_LEN {
        return Err(CloudError::Framing(format!(
            "Payload too large: {} bytes",
            payload.len()
        )));
    }

    let header = FrameHeader {
        frame_type,
        payload_length: payload.len() as u32,
        sequence,
    };
    let sealed_header = cipher.encrypt(&header.to_bytes());

    let mut buf = BytesMut::with_capacity(8 + sealed_header.len() + payload.len() + MAC_LEN);
    buf.put_u32(sealed_header.len() as u32);
    buf.put_slice(&sealed_header);

    if !payload.is_empty() {
        let sealed_payload = cipher.encrypt(payload);
        buf.put_u32(sealed_payload.len() as u32);
        buf.put_slice(&sealed_payload);
    }

    Ok(buf.to_vec())
}

/// Decrypts one complete message from an in-memory buffer.
///
/// Returns the frame and the number of bytes consumed.
///
/// # Errors
///
/// Same as [`read_frame`], with truncated input reported as
/// [`CloudError::Framing`].
pub fn open(cipher: &mut SessionCipher, data: &[u8]) -> CloudResult<(Frame, usize)> {
    let mut offset = 0;

    let sealed_header = take_segment(data, &mut offset)?;
    let header = open_header(cipher, sealed_header)?;

    let payload = if header.payload_length > 0 {
        let sealed_payload = take_segment(data, &mut offset)?;
        open_payload(cipher, &header, sealed_payload)?
    } else {
        Vec::new()
    };

    Ok((
        Frame {
            frame_type: header.frame_type,
            sequence: header.sequence,
            payload,
        },
        offset,
    ))
}

/// Encrypts and writes one message.
pub async fn write_frame<W>(
    writer: &mut W,
    cipher: &mut SessionCipher,
    frame_type: FrameType,
    sequence: u32,
    payload: &[u8],
) -> CloudResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = seal(cipher, frame_type, sequence, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and decrypts one message.
///
/// # Errors
///
/// - [`CloudError::Io`] on socket errors or EOF
/// - [`CloudError::Framing`] for segment lengths above [`MAX_SEGMENT_LEN`]
/// - [`CloudError::MacMismatch`] / [`CloudError::FrameTooShort`] from the cipher
/// - [`CloudError::ProtocolViolation`] for a bad header or a payload segment
///   whose length disagrees with the header
pub async fn read_frame<R>(reader: &mut R, cipher: &mut SessionCipher) -> CloudResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let sealed_header = read_segment(reader).await?;
    let header = open_header(cipher, &sealed_header)?;

    let payload = if header.payload_length > 0 {
        let sealed_payload = read_segment(reader).await?;
        open_payload(cipher, &header, &sealed_payload)?
    } else {
        Vec::new()
    };

    Ok(Frame {
        frame_type: header.frame_type,
        sequence: header.sequence,
        payload,
    })
}

fn check_segment_len(len: usize) -> CloudResult<()> {
    if len > MAX_SEGMENT_LEN {
        return Err(CloudError::Framing(format!(
            "Segment too large: {} bytes (max {})",
            len, MAX_SEGMENT_LEN
        )));
    }
    Ok(())
}

async fn read_segment<R>(reader: &mut R) -> CloudResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    check_segment_len(len)?;

    let mut segment = vec![0u8; len];
    reader.read_exact(&mut segment).await?;
    Ok(segment)
}

fn take_segment<'a>(data: &'a [u8], offset: &mut usize) -> CloudResult<&'a [u8]> {
    let rest = &data[*offset..];
    if rest.len() < 4 {
        return Err(CloudError::Framing(
            "Truncated segment length".to_string(),
        ));
    }

    let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    check_segment_len(len)?;

    if rest.len() - 4 < len {
        return Err(CloudError::Framing(format!(
            "Truncated segment: need {} bytes, have {}",
            len,
            rest.len() - 4
        )));
    }

    *offset += 4 + len;
    Ok(&rest[4..4 + len])
}

fn open_header(cipher: &mut SessionCipher, sealed: &[u8]) -> CloudResult<FrameHeader> {
    let plain = cipher.decrypt(sealed)?;
    FrameHeader::from_bytes(&plain)
}

fn open_payload(
    cipher: &mut SessionCipher,
    header: &FrameHeader,
    sealed: &[u8],
) -> CloudResult<Vec<u8>> {
    let expected = header.payload_length as usize + MAC_LEN;
    if sealed.len() != expected {
        return Err(CloudError::ProtocolViolation(format!(
            "{} payload segment is {} bytes, header announced {}",
            header.frame_type,
            sealed.len(),
            expected
        )));
    }
    cipher.decrypt(sealed)
}
