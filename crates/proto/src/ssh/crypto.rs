//! Sequenced stream cipher and MAC for the encrypted envelope.
//!
//! Each connection owns one [`SessionCipher`] per direction. A cipher is
//! keyed from the shared Diffie-Hellman secret and a direction tag, and
//! carries its own sequence number that advances once per `encrypt` call (or
//! per successful `decrypt`). The two ends of one direction therefore stay in
//! lock-step; a lost, duplicated or reordered frame desynchronizes that
//! direction for the rest of the connection.
//!
//! # Algorithms
//!
//! ```text
//! fold(input)[i % 32] ^= input[i] ^ (i & 0xFF)
//! key  = fold(secret_le || tag)
//! iv   = fold(secret_le || "iv_" || tag)[..16]
//!
//! per call:  iv[i] ^= (seq >> ((i % 4) * 8)) & 0xFF
//! encrypt:   ct[i] = pt[i] ^ key[i % 32] ^ iv[i % 16] ^ ((i + seq) & 0xFF)
//! mac:       rotate-XOR hash over (seq_be || ct), 16 bytes
//! frame:     ct || mac
//! ```
//!
//! The construction is an XOR stream and a non-cryptographic checksum. It
//! detects accidental corruption and ordering errors but offers no
//! confidentiality or authenticity against an active attacker.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::crypto::{SessionCipher, CLIENT_TO_SERVER};
//! use kimcloud_proto::ssh::kex_dh::SharedSecret;
//!
//! let secret = SharedSecret::from_value(0x1234_5678);
//! let mut sender = SessionCipher::new(&secret, CLIENT_TO_SERVER);
//! let mut receiver = SessionCipher::new(&secret, CLIENT_TO_SERVER);
//!
//! let frame = sender.encrypt(b"FILE_DATA chunk");
//! assert_eq!(receiver.decrypt(&frame).unwrap(), b"FILE_DATA chunk");
//! assert_eq!(sender.sequence(), 1);
//! assert_eq!(receiver.sequence(), 1);
//! ```

use crate::ssh::kex_dh::SharedSecret;
use crate::ssh::transport::Role;
use kimcloud_platform::{CloudError, CloudResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Cipher key length in bytes.
pub const KEY_LEN: usize = 32;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// MAC tag length in bytes.
pub const MAC_LEN: usize = 16;

/// Direction tag for traffic sent by the initiator.
pub const CLIENT_TO_SERVER: &str = "client_to_server";

/// Direction tag for traffic sent by the responder.
pub const SERVER_TO_CLIENT: &str = "server_to_client";

/// Folds arbitrary input into a 32-byte buffer.
///
/// `hash[i % 32] ^= input[i] ^ (i & 0xFF)` for every input byte.
pub fn fold_hash(input: &[u8]) -> [u8; KEY_LEN] {
    let mut hash = [0u8; KEY_LEN];
    for (i, byte) in input.iter().enumerate() {
        hash[i % KEY_LEN] ^= byte ^ (i & 0xFF) as u8;
    }
    hash
}

/// Derives the key and initial IV for one direction.
///
/// # Example
///
/// ```rust
/// use kimcloud_proto::ssh::crypto::{derive_key_material, CLIENT_TO_SERVER, SERVER_TO_CLIENT};
/// use kimcloud_proto::ssh::kex_dh::SharedSecret;
///
/// let secret = SharedSecret::from_value(99);
/// let (c2s_key, _) = derive_key_material(&secret, CLIENT_TO_SERVER);
/// let (s2c_key, _) = derive_key_material(&secret, SERVER_TO_CLIENT);
/// assert_ne!(c2s_key, s2c_key);
/// ```
pub fn derive_key_material(secret: &SharedSecret, direction_tag: &str) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let secret_bytes = secret.value().to_le_bytes();

    let mut input = Vec::with_capacity(secret_bytes.len() + 3 + direction_tag.len());
    input.extend_from_slice(&secret_bytes);
    input.extend_from_slice(direction_tag.as_bytes());
    let key = fold_hash(&input);

    input.truncate(secret_bytes.len());
    input.extend_from_slice(b"iv_");
    input.extend_from_slice(direction_tag.as_bytes());
    let mut iv_full = fold_hash(&input);
    input.zeroize();

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&iv_full[..IV_LEN]);
    iv_full.zeroize();

    (key, iv)
}

/// Computes the 16-byte rotate-XOR tag over `seq_be || ciphertext`.
pub fn compute_mac(sequence: u32, ciphertext: &[u8]) -> [u8; MAC_LEN] {
    let mut tag = [0u8; MAC_LEN];
    let seq_bytes = sequence.to_be_bytes();

    for (i, &byte) in seq_bytes.iter().chain(ciphertext.iter()).enumerate() {
        let position = (i & 0xFF) as u8;
        let mut mixed = byte;
        for (j, slot) in tag.iter_mut().enumerate() {
            *slot ^= mixed ^ position ^ ((i + j) & 0xFF) as u8;
            mixed = mixed.rotate_left(1);
        }
    }

    tag
}

/// One direction of the encrypted channel.
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    sequence: u32,
}

impl SessionCipher {
    /// Creates a cipher for `direction_tag` with sequence number 0.
    pub fn new(secret: &SharedSecret, direction_tag: &str) -> Self {
        let (key, iv) = derive_key_material(secret, direction_tag);
        Self {
            key,
            iv,
            sequence: 0,
        }
    }

    /// Returns the sequence number the next frame will use.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    fn update_iv(&mut self) {
        for (i, byte) in self.iv.iter_mut().enumerate() {
            *byte ^= (self.sequence >> ((i % 4) * 8)) as u8;
        }
    }

    fn apply_keystream(&self, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            let position = (i as u64 + self.sequence as u64) as u8;
            *byte ^= self.key[i % KEY_LEN] ^ self.iv[i % IV_LEN] ^ position;
        }
    }

    /// Encrypts `plaintext` and appends the MAC tag.
    ///
    /// Advances the sequence number by one.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.update_iv();

        let mut frame = Vec::with_capacity(plaintext.len() + MAC_LEN);
        frame.extend_from_slice(plaintext);
        self.apply_keystream(&mut frame);

        let tag = compute_mac(self.sequence, &frame);
        frame.extend_from_slice(&tag);

        self.sequence = self.sequence.wrapping_add(1);
        frame
    }

    /// Verifies the trailing MAC tag and decrypts the frame.
    ///
    /// On failure neither the IV nor the sequence number changes.
    ///
    /// # Errors
    ///
    /// - [`CloudError::FrameTooShort`] if the frame is shorter than the tag
    /// - [`CloudError::MacMismatch`] if the tag does not match the
    ///   ciphertext at the current sequence number
    pub fn decrypt(&mut self, frame: &[u8]) -> CloudResult<Vec<u8>> {
        if frame.len() < MAC_LEN {
            return Err(CloudError::FrameTooShort(frame.len()));
        }

        let (ciphertext, received_tag) = frame.split_at(frame.len() - MAC_LEN);
        let expected_tag = compute_mac(self.sequence, ciphertext);

        if !bool::from(expected_tag.ct_eq(received_tag)) {
            return Err(CloudError::MacMismatch {
                sequence: self.sequence,
            });
        }

        self.update_iv();
        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(&mut plaintext);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

/// The send and receive ciphers of one connection.
#[derive(Debug)]
pub struct CipherPair {
    /// Cipher for outgoing frames
    pub send: SessionCipher,
    /// Cipher for incoming frames
    pub recv: SessionCipher,
}

impl CipherPair {
    /// Builds the complementary cipher pair for `role`.
    ///
    /// The initiator sends with `client_to_server` and receives with
    /// `server_to_client`; the responder does the opposite.
    pub fn for_role(secret: &SharedSecret, role: Role) -> Self {
        let (send_tag, recv_tag) = match role {
            Role::Initiator => (CLIENT_TO_SERVER, SERVER_TO_CLIENT),
            Role::Responder => (SERVER_TO_CLIENT, CLIENT_TO_SERVER),
        };

        Self {
            send: SessionCipher::new(secret, send_tag),
            recv: SessionCipher::new(secret, recv_tag),
        }
    }
}
