//! Secure transport and file transfer protocol.
//!
//! # Architecture
//!
//! The implementation is layered, and both roles share every layer:
//!
//! 1. **Packet Layer** ([`packet`]) - padded handshake packets
//! 2. **Negotiation** ([`kex`], [`version`]) - identification lines, KEXINIT, first-match selection
//! 3. **Key Exchange** ([`kex_dh`]) - Diffie-Hellman over a small prime
//! 4. **Secure Channel** ([`crypto`], [`envelope`]) - sequenced cipher, MAC, encrypted frames
//! 5. **Transport** ([`transport`]) - per-connection state machine
//! 6. **Application** ([`auth`], [`transfer`]) - password login, chunked upload
//! 7. **Client/Server APIs** ([`client`], [`server`])
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::kex::negotiate_algorithm;
//!
//! let initiator = vec!["a".to_string(), "b".to_string(), "c".to_string()];
//! let responder = vec!["c".to_string(), "b".to_string()];
//! assert_eq!(negotiate_algorithm(&initiator, &responder).unwrap(), "b");
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod packet;
pub mod server;
pub mod transfer;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{AuthRequest, CredentialStore};
pub use client::FileClient;
pub use config::{ClientConfig, ServerConfig};
pub use crypto::{CipherPair, SessionCipher};
pub use envelope::{Frame, FrameHeader, MAX_CHUNK_SIZE};
pub use kex::{negotiate_algorithm, select_first_match, AlgorithmLists, KexInit, NegotiatedAlgorithms, NewKeys};
pub use kex_dh::{DhExchange, DhParams, KexDhInit, KexDhReply, SharedSecret};
pub use message::{FrameType, MessageType};
pub use packet::Packet;
pub use server::{FileServer, ServerContext, SessionSummary};
pub use transfer::{ChunkReorderBuffer, FileData, FileStart, PushOutcome, UploadReport};
pub use transport::{Role, State, TransportConfig, TransportSession, TransportState};
pub use version::Version;
