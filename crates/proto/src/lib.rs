//! Protocol implementation for the KimCloud file transfer service.
//!
//! This crate provides an SSH-style secure transport and an authenticated,
//! chunked file-upload protocol running over it:
//!
//! - **Handshake** - version exchange, algorithm negotiation, Diffie-Hellman
//! - **Secure channel** - sequenced XOR stream cipher with a per-frame MAC
//! - **Application** - password authentication and file upload
//!
//! # Features
//!
//! - `ssh` (default) - protocol, client and server
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::Packet;
//! use rand::rngs::OsRng;
//!
//! // Wrap a handshake payload into a padded packet
//! let packet = Packet::new(b"KEXINIT payload".to_vec(), &mut OsRng);
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"KEXINIT payload");
//! ```
//!
//! # Security
//!
//! The key exchange uses a 31-bit modulus and the channel cipher is a
//! non-cryptographic XOR stream. They preserve the structure of a secure
//! transport (determinism, direction separation, tamper detection) without
//! its strength. Do not use this on untrusted networks.
//!
//! What the crate does enforce:
//! - Constant-time password and MAC comparison (`subtle`)
//! - Secrets zeroized on drop (`zeroize`)
//! - Bounded allocations for every length field read from the wire

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
