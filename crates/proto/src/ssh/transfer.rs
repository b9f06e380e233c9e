//! Chunked file transfer over an authenticated session.
//!
//! # Message Flow
//!
//! ```text
//! sender                                   receiver
//!   FILE_START [nlen][size][chunk][name] ->
//!                                       <- FILE_START (echo) | FILE_ERROR [reason]
//!   FILE_DATA [n][len][data]             ->
//!                                       <- FILE_DATA (empty ack)
//!   ... one ack per chunk ...
//!                                       <- FILE_END (empty, file complete)
//!   FILE_END                             ->
//!                                       <- FILE_DATA (empty, from the command loop)
//! ```
//!
//! Every frame is acknowledged before the next one is sent, so the two
//! cipher streams advance in lock-step. Chunk numbers are still checked on
//! the receiving side: the [`ChunkReorderBuffer`] holds chunks that arrive
//! ahead of the expected one and drops chunks that were already written.
//! It only ever sees frames that passed their MAC check.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::transfer::{ChunkReorderBuffer, PushOutcome};
//!
//! let mut buffer = ChunkReorderBuffer::new();
//! assert_eq!(buffer.push(1, b"world".to_vec()), PushOutcome::Buffered);
//! assert_eq!(
//!     buffer.push(0, b"hello ".to_vec()),
//!     PushOutcome::Ready(vec![b"hello ".to_vec(), b"world".to_vec()])
//! );
//! assert_eq!(buffer.push(1, b"world".to_vec()), PushOutcome::Duplicate);
//! ```

use crate::ssh::envelope::MAX_CHUNK_SIZE;
use crate::ssh::logging;
use crate::ssh::message::FrameType;
use crate::ssh::transport::TransportSession;
use bytes::{Buf, BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: u32 = 8192;

/// Maximum declared filename length in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// FILE_START payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStart {
    /// Declared file name (no directory part is stripped)
    pub filename: String,
    /// Total size in bytes
    pub file_size: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u32,
}

impl FileStart {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.filename.len());
        buf.put_u32(self.filename.len() as u32);
        buf.put_u64(self.file_size);
        buf.put_u32(self.chunk_size);
        buf.put_slice(self.filename.as_bytes());
        buf.to_vec()
    }

    /// Parses the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] for a filename outside
    /// 1..=255 bytes or not UTF-8, a chunk size outside 1..=1 MiB, or
    /// truncated input.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        let mut buf = data;
        if buf.remaining() < 16 {
            return Err(CloudError::ProtocolViolation(format!(
                "FILE_START too short: {} bytes",
                data.len()
            )));
        }

        let name_len = buf.get_u32() as usize;
        let file_size = buf.get_u64();
        let chunk_size = buf.get_u32();

        if name_len == 0 || name_len > MAX_FILENAME_LEN {
            return Err(CloudError::ProtocolViolation(format!(
                "Filename length {} outside 1..={}",
                name_len, MAX_FILENAME_LEN
            )));
        }
        if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_SIZE {
            return Err(CloudError::ProtocolViolation(format!(
                "Chunk size {} outside 1..={}",
                chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if buf.remaining() != name_len {
            return Err(CloudError::ProtocolViolation(format!(
                "FILE_START filename is {} bytes, header says {}",
                buf.remaining(),
                name_len
            )));
        }

        let filename = std::str::from_utf8(buf)
            .map_err(|_| CloudError::ProtocolViolation("Filename is not UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            filename,
            file_size,
            chunk_size,
        })
    }

    /// Number of chunks the file is split into.
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size as u64)
    }
}

/// FILE_DATA payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    /// Zero-based chunk index
    pub chunk_number: u32,
    /// Chunk contents
    pub data: Vec<u8>,
}

impl FileData {
    /// Serializes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_u32(self.chunk_number);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] if the declared data length
    /// does not match the remaining bytes.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        let mut buf = data;
        if buf.remaining() < 8 {
            return Err(CloudError::ProtocolViolation(format!(
                "FILE_DATA too short: {} bytes",
                data.len()
            )));
        }

        let chunk_number = buf.get_u32();
        let data_len = buf.get_u32() as usize;
        if buf.remaining() != data_len {
            return Err(CloudError::ProtocolViolation(format!(
                "FILE_DATA chunk {} declares {} bytes, carries {}",
                chunk_number,
                data_len,
                buf.remaining()
            )));
        }

        Ok(Self {
            chunk_number,
            data: buf.to_vec(),
        })
    }
}

/// Result of offering a chunk to the [`ChunkReorderBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The chunk was the expected one; these chunks (it and any buffered
    /// successors) are now contiguous and must be written in order.
    Ready(Vec<Vec<u8>>),
    /// The chunk is ahead of the expected one and was stored.
    Buffered,
    /// The chunk was already written or is already buffered; dropped.
    Duplicate,
}

/// Holds chunks that arrive before the expected one.
#[derive(Debug, Default)]
pub struct ChunkReorderBuffer {
    expected: u32,
    pending: BTreeMap<u32, Vec<u8>>,
}

impl ChunkReorderBuffer {
    /// Creates an empty buffer expecting chunk 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next chunk to write.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of chunks held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Offers chunk `index`.
    pub fn push(&mut self, index: u32, data: Vec<u8>) -> PushOutcome {
        if index < self.expected || self.pending.contains_key(&index) {
            return PushOutcome::Duplicate;
        }

        if index > self.expected {
            self.pending.insert(index, data);
            return PushOutcome::Buffered;
        }

        let mut ready = vec![data];
        self.expected += 1;
        while let Some(next) = self.pending.remove(&self.expected) {
            ready.push(next);
            self.expected += 1;
        }
        PushOutcome::Ready(ready)
    }
}

/// Summary of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Filename declared to the server
    pub remote_name: String,
    /// Bytes sent
    pub bytes_sent: u64,
    /// FILE_DATA frames sent
    pub chunks: u32,
}

/// Summary of a received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Where the file was written
    pub path: PathBuf,
    /// Bytes written
    pub bytes_written: u64,
    /// Declared size
    pub file_size: u64,
    /// Chunks written
    pub chunks: u32,
}

impl ReceivedFile {
    /// Returns true if every declared byte was written.
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.file_size
    }
}

/// Destination for an upload: `upload_dir/{username}_{filename}`.
///
/// The filename is used as declared; path separators in it are not removed.
pub fn destination_path(upload_dir: &Path, username: &str, filename: &str) -> PathBuf {
    upload_dir.join(format!("{}_{}", username, filename))
}

/// Receiver side of one transfer, entered after a FILE_START frame.
///
/// # Errors
///
/// - [`CloudError::FileIo`] if the destination cannot be opened; FILE_ERROR
///   was sent and the session stays open
/// - [`CloudError::FileIo`] on a write error; the session is closed
/// - [`CloudError::ProtocolViolation`] for malformed or unexpected frames;
///   the session is closed
pub async fn receive_file<S>(
    session: &mut TransportSession<S>,
    upload_dir: &Path,
    username: &str,
    start_payload: &[u8],
) -> CloudResult<ReceivedFile>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = match FileStart::from_bytes(start_payload) {
        Ok(start) => start,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };
    session.mark_transferring()?;

    let path = destination_path(upload_dir, username, &start.filename);
    logging::log_transfer_start(session.peer(), &start.filename, start.file_size, start.chunk_size);

    let mut file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            let reason = format!("Cannot open {}: {}", path.display(), e);
            logging::log_transfer_failed(session.peer(), &start.filename, &reason);
            session
                .send_frame(FrameType::FileError, reason.as_bytes())
                .await?;
            return Err(CloudError::FileIo(reason));
        }
    };

    session.send_frame(FrameType::FileStart, start_payload).await?;

    let chunk_count = start.chunk_count();
    let mut reorder = ChunkReorderBuffer::new();
    let mut bytes_written: u64 = 0;
    let mut chunks: u32 = 0;

    while bytes_written < start.file_size {
        let frame = session.recv_frame().await?;

        match frame.frame_type {
            FrameType::FileData => {}
            FrameType::FileEnd => {
                if reorder.pending_len() > 0 {
                    logging::log_chunks_lost(&start.filename, reorder.pending_len(), reorder.expected());
                }
                break;
            }
            other => {
                session.close().await;
                return Err(CloudError::ProtocolViolation(format!(
                    "Unexpected {} during transfer of '{}'",
                    other, start.filename
                )));
            }
        }

        let chunk = match validate_chunk(&frame.payload, &start, chunk_count) {
            Ok(chunk) => chunk,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        session.send_frame(FrameType::FileData, &[]).await?;

        let index = chunk.chunk_number;
        match reorder.push(index, chunk.data) {
            PushOutcome::Ready(ready) => {
                for data in ready {
                    if let Err(e) = file.write_all(&data).await {
                        let reason = format!("Write to {} failed: {}", path.display(), e);
                        logging::log_transfer_failed(session.peer(), &start.filename, &reason);
                        session.close().await;
                        return Err(CloudError::FileIo(reason));
                    }
                    bytes_written += data.len() as u64;
                    chunks += 1;
                }
                debug!(chunk = index, bytes_written = bytes_written, "Chunk written");
            }
            PushOutcome::Buffered => {
                logging::log_chunk_buffered(index, reorder.expected(), reorder.pending_len());
            }
            PushOutcome::Duplicate => {
                logging::log_chunk_duplicate(index, reorder.expected());
            }
        }
    }

    if let Err(e) = file.flush().await {
        session.close().await;
        return Err(CloudError::FileIo(format!(
            "Flush of {} failed: {}",
            path.display(),
            e
        )));
    }
    drop(file);

    session.send_frame(FrameType::FileEnd, &[]).await?;
    logging::log_transfer_complete(session.peer(), &start.filename, bytes_written, chunks);

    Ok(ReceivedFile {
        path,
        bytes_written,
        file_size: start.file_size,
        chunks,
    })
}

fn validate_chunk(payload: &[u8], start: &FileStart, chunk_count: u64) -> CloudResult<FileData> {
    let chunk = FileData::from_bytes(payload)?;

    if chunk.chunk_number as u64 >= chunk_count {
        return Err(CloudError::ProtocolViolation(format!(
            "Chunk {} beyond end of '{}' ({} chunks)",
            chunk.chunk_number, start.filename, chunk_count
        )));
    }

    // No chunk may run past the declared file size
    let offset = chunk.chunk_number as u64 * start.chunk_size as u64;
    let limit = (start.file_size - offset).min(start.chunk_size as u64);
    if chunk.data.len() as u64 > limit {
        return Err(CloudError::ProtocolViolation(format!(
            "Chunk {} is {} bytes, at most {} allowed",
            chunk.chunk_number,
            chunk.data.len(),
            limit
        )));
    }

    Ok(chunk)
}

/// Sender side of one transfer.
///
/// # Errors
///
/// - [`CloudError::FileIo`] if the local file cannot be read, the server
///   answered FILE_ERROR, or the file shrank while sending; the session
///   stays open
/// - transport errors and [`CloudError::ProtocolViolation`] close the session
pub async fn send_file<S>(
    session: &mut TransportSession<S>,
    path: &Path,
    chunk_size: u32,
) -> CloudResult<UploadReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_SIZE {
        return Err(CloudError::Config(format!(
            "Chunk size {} outside 1..={}",
            chunk_size, MAX_CHUNK_SIZE
        )));
    }

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CloudError::FileIo(format!("No usable file name in {}", path.display())))?
        .to_string();
    if filename.len() > MAX_FILENAME_LEN {
        return Err(CloudError::FileIo(format!(
            "File name longer than {} bytes: {}",
            MAX_FILENAME_LEN, filename
        )));
    }

    let mut file = File::open(path)
        .await
        .map_err(|e| CloudError::FileIo(format!("Cannot open {}: {}", path.display(), e)))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| CloudError::FileIo(format!("Cannot stat {}: {}", path.display(), e)))?
        .len();

    session.mark_transferring()?;

    let start = FileStart {
        filename: filename.clone(),
        file_size,
        chunk_size,
    };
    logging::log_transfer_start(session.peer(), &filename, file_size, chunk_size);
    session.send_frame(FrameType::FileStart, &start.to_bytes()).await?;

    let reply = session.recv_frame().await?;
    match reply.frame_type {
        FrameType::FileStart => {}
        FrameType::FileError => {
            let reason = String::from_utf8_lossy(&reply.payload).into_owned();
            logging::log_transfer_failed(session.peer(), &filename, &reason);
            return Err(CloudError::FileIo(format!("Server refused '{}': {}", filename, reason)));
        }
        other => {
            session.close().await;
            return Err(CloudError::ProtocolViolation(format!(
                "Expected FILE_START acknowledgment, got {}",
                other
            )));
        }
    }

    let mut buf = vec![0u8; chunk_size as usize];
    let mut remaining = file_size;
    let mut chunk_number: u32 = 0;
    let mut bytes_sent: u64 = 0;

    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let read = match read_chunk(&mut file, &mut buf[..want]).await {
            Ok(0) => Err(format!("{} shrank to {} bytes while sending", path.display(), bytes_sent)),
            Ok(n) => Ok(n),
            Err(e) => Err(format!("Read from {} failed: {}", path.display(), e)),
        };

        let n = match read {
            Ok(n) => n,
            Err(reason) => {
                abort_transfer(session).await?;
                logging::log_transfer_failed(session.peer(), &filename, &reason);
                return Err(CloudError::FileIo(reason));
            }
        };

        let chunk = FileData {
            chunk_number,
            data: buf[..n].to_vec(),
        };
        session.send_frame(FrameType::FileData, &chunk.to_bytes()).await?;
        expect_empty(session, FrameType::FileData).await?;

        chunk_number += 1;
        bytes_sent += n as u64;
        remaining -= n as u64;
    }

    expect_empty(session, FrameType::FileEnd).await?;

    session.send_frame(FrameType::FileEnd, &[]).await?;
    expect_empty(session, FrameType::FileData).await?;

    logging::log_transfer_complete(session.peer(), &filename, bytes_sent, chunk_number);

    Ok(UploadReport {
        remote_name: filename,
        bytes_sent,
        chunks: chunk_number,
    })
}

/// Ends a transfer early: FILE_END, then the receiver's final FILE_END.
async fn abort_transfer<S>(session: &mut TransportSession<S>) -> CloudResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.send_frame(FrameType::FileEnd, &[]).await?;
    expect_empty(session, FrameType::FileEnd).await
}

async fn expect_empty<S>(session: &mut TransportSession<S>, expected: FrameType) -> CloudResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = session.recv_frame().await?;
    if frame.frame_type != expected || !frame.payload.is_empty() {
        session.close().await;
        return Err(CloudError::ProtocolViolation(format!(
            "Expected empty {}, got {} with {} bytes",
            expected,
            frame.frame_type,
            frame.payload.len()
        )));
    }
    Ok(())
}

/// Reads until `buf` is full or EOF.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_of(data: &[u8], size: usize) -> Vec<Vec<u8>> {
        data.chunks(size).map(|c| c.to_vec()).collect()
    }

    fn reassemble(order: &[u32], chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut buffer = ChunkReorderBuffer::new();
        let mut out = Vec::new();
        for &index in order {
            if let PushOutcome::Ready(ready) = buffer.push(index, chunks[index as usize].clone()) {
                for data in ready {
                    out.extend_from_slice(&data);
                }
            }
        }
        out
    }

    #[test]
    fn test_file_start_layout() {
        let start = FileStart {
            filename: "a.txt".to_string(),
            file_size: 10,
            chunk_size: 4,
        };
        let bytes = start.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..12], &10u64.to_be_bytes());
        assert_eq!(&bytes[12..16], &4u32.to_be_bytes());
        assert_eq!(&bytes[16..], b"a.txt");

        let parsed = FileStart::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, start);
        assert_eq!(parsed.chunk_count(), 3);
    }

    #[test]
    fn test_file_start_rejects_bad_names() {
        let mut start = FileStart {
            filename: String::new(),
            file_size: 1,
            chunk_size: 8192,
        };
        assert!(FileStart::from_bytes(&start.to_bytes()).is_err());

        start.filename = "n".repeat(256);
        assert!(FileStart::from_bytes(&start.to_bytes()).is_err());

        start.filename = "n".repeat(255);
        assert!(FileStart::from_bytes(&start.to_bytes()).is_ok());
    }

    #[test]
    fn test_file_start_rejects_bad_chunk_size() {
        let mut start = FileStart {
            filename: "f".to_string(),
            file_size: 1,
            chunk_size: 0,
        };
        assert!(FileStart::from_bytes(&start.to_bytes()).is_err());
        start.chunk_size = (MAX_CHUNK_SIZE + 1) as u32;
        assert!(FileStart::from_bytes(&start.to_bytes()).is_err());
    }

    #[test]
    fn test_file_data_layout() {
        let chunk = FileData {
            chunk_number: 7,
            data: b"xyz".to_vec(),
        };
        assert_eq!(chunk.to_bytes(), vec![0, 0, 0, 7, 0, 0, 0, 3, b'x', b'y', b'z']);
        assert_eq!(FileData::from_bytes(&chunk.to_bytes()).unwrap(), chunk);
    }

    #[test]
    fn test_file_data_length_mismatch() {
        let mut bytes = FileData {
            chunk_number: 0,
            data: b"abcd".to_vec(),
        }
        .to_bytes();
        bytes.pop();
        assert!(matches!(
            FileData::from_bytes(&bytes),
            Err(CloudError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_reorder_matches_in_order() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4 * 100).collect();
        let chunks = chunks_of(&data, 100);

        assert_eq!(reassemble(&[0, 1, 2, 3], &chunks), data);
        assert_eq!(reassemble(&[2, 0, 3, 1], &chunks), data);
        assert_eq!(reassemble(&[3, 2, 1, 0], &chunks), data);
    }

    #[test]
    fn test_reorder_outcomes() {
        let mut buffer = ChunkReorderBuffer::new();
        assert_eq!(buffer.push(2, vec![2]), PushOutcome::Buffered);
        assert_eq!(buffer.push(0, vec![0]), PushOutcome::Ready(vec![vec![0]]));
        assert_eq!(buffer.push(3, vec![3]), PushOutcome::Buffered);
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(
            buffer.push(1, vec![1]),
            PushOutcome::Ready(vec![vec![1], vec![2], vec![3]])
        );
        assert_eq!(buffer.expected(), 4);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_reorder_duplicates_dropped() {
        let mut buffer = ChunkReorderBuffer::new();
        buffer.push(0, vec![0]);
        buffer.push(1, vec![1]);
        assert_eq!(buffer.push(1, vec![9]), PushOutcome::Duplicate);

        assert_eq!(buffer.push(5, vec![5]), PushOutcome::Buffered);
        assert_eq!(buffer.push(5, vec![6]), PushOutcome::Duplicate);
        assert_eq!(buffer.expected(), 2);
    }

    #[test]
    fn test_destination_path() {
        let path = destination_path(Path::new("/srv/uploads"), "hosung", "notes.txt");
        assert_eq!(path, PathBuf::from("/srv/uploads/hosung_notes.txt"));
    }

    #[test]
    fn test_validate_chunk_bounds() {
        let start = FileStart {
            filename: "f".to_string(),
            file_size: 10,
            chunk_size: 4,
        };
        let ok = FileData {
            chunk_number: 2,
            data: vec![0; 2],
        };
        assert!(validate_chunk(&ok.to_bytes(), &start, 3).is_ok());

        let beyond = FileData {
            chunk_number: 3,
            data: vec![0; 2],
        };
        assert!(validate_chunk(&beyond.to_bytes(), &start, 3).is_err());

        let oversized = FileData {
            chunk_number: 0,
            data: vec![0; 5],
        };
        assert!(validate_chunk(&oversized.to_bytes(), &start, 3).is_err());
    }

    #[test]
    fn test_validate_chunk_last_chunk_limited_to_remaining() {
        let start = FileStart {
            filename: "f".to_string(),
            file_size: 10,
            chunk_size: 4,
        };

        let full_middle = FileData {
            chunk_number: 1,
            data: vec![0; 4],
        };
        assert!(validate_chunk(&full_middle.to_bytes(), &start, 3).is_ok());

        let exact_tail = FileData {
            chunk_number: 2,
            data: vec![0; 2],
        };
        assert!(validate_chunk(&exact_tail.to_bytes(), &start, 3).is_ok());

        // A full-size last chunk would store 12 bytes for a 10-byte file
        let overlong_tail = FileData {
            chunk_number: 2,
            data: vec![0; 4],
        };
        assert!(matches!(
            validate_chunk(&overlong_tail.to_bytes(), &start, 3),
            Err(CloudError::ProtocolViolation(_))
        ));
    }
}
