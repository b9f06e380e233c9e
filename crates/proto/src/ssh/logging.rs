//! Structured logging for transport and transfer events.
//!
//! Every event that several call sites report goes through one helper here so
//! the field names stay identical across the client and the server.
//!
//! # Log Levels
//!
//! - **DEBUG**: individual frames, KEXINIT cookies, chunk bookkeeping
//! - **INFO**: handshake lifecycle, authentication success, transfers
//! - **WARN**: authentication failures, rejected or lost chunks
//! - **ERROR**: failures that close a connection
//!
//! Key material and passwords are never passed to these helpers.
//!
//! # Example
//!
//! ```no_run
//! use kimcloud_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("kimcloud_proto=debug")
//!     .init();
//!
//! logging::log_handshake_start("127.0.0.1:4000", "responder");
//! ```

use crate::ssh::kex::NegotiatedAlgorithms;
use tracing::{debug, error, info, warn};

/// Log a transport state transition
pub fn log_state_transition(peer: &str, old_state: &str, new_state: &str) {
    debug!(
        peer = peer,
        state_from = old_state,
        state_to = new_state,
        "Transport state transition"
    );
}

/// Log handshake start
///
/// # Arguments
///
/// * `peer` - Peer address or label
/// * `role` - "initiator" or "responder"
pub fn log_handshake_start(peer: &str, role: &str) {
    info!(peer = peer, role = role, "Handshake started");
}

/// Log a KEXINIT message sent or received
pub fn log_kexinit(peer: &str, direction: &str, cookie: &[u8]) {
    debug!(
        peer = peer,
        direction = direction,
        cookie = %hex::encode(cookie),
        "KEXINIT"
    );
}

/// Log the negotiated algorithm set
pub fn log_algorithms_negotiated(peer: &str, algorithms: &NegotiatedAlgorithms) {
    info!(
        peer = peer,
        kex = %algorithms.kex,
        host_key = %algorithms.host_key,
        cipher_c2s = %algorithms.encryption_client_to_server,
        cipher_s2c = %algorithms.encryption_server_to_client,
        mac_c2s = %algorithms.mac_client_to_server,
        mac_s2c = %algorithms.mac_server_to_client,
        "Algorithms negotiated"
    );
}

/// Log a Diffie-Hellman public value
pub fn log_public_value(peer: &str, direction: &str, public_value: u64) {
    debug!(
        peer = peer,
        direction = direction,
        public_value = %hex::encode(public_value.to_be_bytes()),
        "DH public value"
    );
}

/// Log handshake completion
///
/// # Arguments
///
/// * `peer` - Peer address or label
/// * `duration_ms` - Handshake duration in milliseconds
pub fn log_handshake_complete(peer: &str, duration_ms: u64) {
    info!(peer = peer, duration_ms = duration_ms, "Handshake completed");
}

/// Log handshake failure
pub fn log_handshake_failed(peer: &str, error: &str) {
    error!(peer = peer, error = error, "Handshake failed");
}

/// Log successful authentication
pub fn log_authentication_success(peer: &str, username: &str) {
    info!(peer = peer, username = username, "Authentication successful");
}

/// Log failed authentication
pub fn log_authentication_failed(peer: &str, username: &str, reason: &str) {
    warn!(
        peer = peer,
        username = username,
        reason = reason,
        "Authentication failed"
    );
}

/// Log the start of a file transfer
pub fn log_transfer_start(peer: &str, filename: &str, file_size: u64, chunk_size: u32) {
    info!(
        peer = peer,
        filename = filename,
        file_size = file_size,
        chunk_size = chunk_size,
        "File transfer started"
    );
}

/// Log the end of a file transfer
pub fn log_transfer_complete(peer: &str, filename: &str, bytes: u64, chunks: u32) {
    info!(
        peer = peer,
        filename = filename,
        bytes = bytes,
        chunks = chunks,
        "File transfer completed"
    );
}

/// Log a rejected or aborted file transfer
pub fn log_transfer_failed(peer: &str, filename: &str, reason: &str) {
    warn!(
        peer = peer,
        filename = filename,
        reason = reason,
        "File transfer failed"
    );
}

/// Log a chunk held back until its predecessors arrive
pub fn log_chunk_buffered(chunk: u32, expected: u32, buffered: usize) {
    debug!(
        chunk = chunk,
        expected = expected,
        buffered = buffered,
        "Chunk buffered out of order"
    );
}

/// Log a chunk dropped as a duplicate
pub fn log_chunk_duplicate(chunk: u32, expected: u32) {
    warn!(chunk = chunk, expected = expected, "Duplicate chunk dropped");
}

/// Log chunks still buffered when a transfer ended early
pub fn log_chunks_lost(filename: &str, buffered: usize, expected: u32) {
    warn!(
        filename = filename,
        buffered = buffered,
        expected = expected,
        "Transfer ended with chunks still buffered"
    );
}

/// Log a MAC verification failure
pub fn log_mac_failure(peer: &str, sequence: u32) {
    error!(peer = peer, seq_num = sequence, "MAC verification failed");
}

/// Log an encrypted frame sent
pub fn log_frame_send(frame_type: &str, sequence: u32, payload_len: usize) {
    debug!(
        frame_type = frame_type,
        seq_num = sequence,
        payload_len = payload_len,
        "Frame sent"
    );
}

/// Log an encrypted frame received
pub fn log_frame_recv(frame_type: &str, sequence: u32, payload_len: usize) {
    debug!(
        frame_type = frame_type,
        seq_num = sequence,
        payload_len = payload_len,
        "Frame received"
    );
}

/// Log a generic error with context
pub fn log_error(context: &str, error: &str) {
    error!(context = context, error = error, "Operation failed");
}
