//! Finite-field Diffie-Hellman key exchange over a toy-sized group.
//!
//! The default modulus is the Mersenne prime 2^31 - 1 with generator 2.
//! The group is far too small to resist a discrete-log search; it exists to
//! exercise the message flow and the symmetry of the shared secret, not to
//! provide secrecy.
//!
//! # Messages
//!
//! ```text
//! KEXDH_INIT:   byte 30 | uint32 8 | uint64 e
//! KEXDH_REPLY:  byte 31 | string host_key_blob | uint32 8 | uint64 f | string signature_blob
//! ```
//!
//! Both blobs in the reply are opaque placeholders and are never verified.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::kex_dh::{DhExchange, DhParams};
//! use rand::rngs::OsRng;
//!
//! let client = DhExchange::new(DhParams::default(), &mut OsRng).unwrap();
//! let server = DhExchange::new(DhParams::default(), &mut OsRng).unwrap();
//!
//! let client_secret = client.compute_shared_secret(server.public_value()).unwrap();
//! let server_secret = server.compute_shared_secret(client.public_value()).unwrap();
//! assert_eq!(client_secret, server_secret);
//! ```

use crate::ssh::message::MessageType;
use bytes::{Buf, BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use rand::{CryptoRng, Rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default group modulus P (2^31 - 1).
pub const DEFAULT_MODULUS: u64 = 0x7FFF_FFFF;

/// Default group generator G.
pub const DEFAULT_GENERATOR: u64 = 2;

/// Host key blob sent in KEXDH_REPLY in place of a real host key.
pub const PLACEHOLDER_HOST_KEY: &[u8] = b"kimcloud-host-key";

/// Signature blob sent in KEXDH_REPLY in place of a real signature.
pub const PLACEHOLDER_SIGNATURE: &[u8] = b"kimcloud-signature";

/// Width of a serialized public value.
pub const PUBLIC_VALUE_LEN: usize = 8;

/// Group parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhParams {
    /// Modulus P
    pub modulus: u64,
    /// Generator G
    pub generator: u64,
}

impl DhParams {
    /// Creates validated group parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] if `modulus < 5` or the generator lies
    /// outside `[2, modulus - 2]`.
    pub fn new(modulus: u64, generator: u64) -> CloudResult<Self> {
        let params = Self { modulus, generator };
        params.validate()?;
        Ok(params)
    }

    /// Validates the parameters.
    pub fn validate(&self) -> CloudResult<()> {
        if self.modulus < 5 {
            return Err(CloudError::Config(format!(
                "DH modulus too small: {}",
                self.modulus
            )));
        }
        if self.generator < 2 || self.generator > self.modulus - 2 {
            return Err(CloudError::Config(format!(
                "DH generator {} outside [2, {}]",
                self.generator,
                self.modulus - 2
            )));
        }
        Ok(())
    }
}

impl Default for DhParams {
    fn default() -> Self {
        Self {
            modulus: DEFAULT_MODULUS,
            generator: DEFAULT_GENERATOR,
        }
    }
}

/// Computes `base^exponent mod modulus` by square-and-multiply.
///
/// Intermediate products are widened to `u128`, so any `u64` modulus works.
///
/// # Example
///
/// ```rust
/// use kimcloud_proto::ssh::kex_dh::mod_exp;
///
/// assert_eq!(mod_exp(2, 10, 1000), 24);
/// assert_eq!(mod_exp(7, 0, 13), 1);
/// ```
pub fn mod_exp(base: u64, exponent: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }

    let m = modulus as u128;
    let mut result: u128 = 1;
    let mut base = base as u128 % m;
    let mut exponent = exponent;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        exponent >>= 1;
    }

    result as u64
}

/// Shared secret produced by [`DhExchange::compute_shared_secret`].
///
/// Zeroized on drop; consumed by [`CipherPair`](super::crypto::CipherPair).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(u64);

impl SharedSecret {
    /// Wraps a raw secret value.
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw secret value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// One side's ephemeral key pair.
pub struct DhExchange {
    params: DhParams,
    private_exponent: u64,
    public_value: u64,
}

impl DhExchange {
    /// Draws a private exponent uniformly from `[1, P-2]` and computes
    /// `public = G^private mod P`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] if `params` fail [`DhParams::validate`].
    pub fn new<R: RngCore + CryptoRng>(params: DhParams, rng: &mut R) -> CloudResult<Self> {
        params.validate()?;

        let private_exponent = rng.gen_range(1..=params.modulus - 2);
        let public_value = mod_exp(params.generator, private_exponent, params.modulus);

        Ok(Self {
            params,
            private_exponent,
            public_value,
        })
    }

    /// Returns the public value.
    pub fn public_value(&self) -> u64 {
        self.public_value
    }

    /// Returns the group parameters.
    pub fn params(&self) -> DhParams {
        self.params
    }

    /// Computes `peer_public^private mod P`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::KeyExchange`] if `peer_public` is outside
    /// `[1, P-1]`.
    pub fn compute_shared_secret(&self, peer_public: u64) -> CloudResult<SharedSecret> {
        if peer_public == 0 || peer_public >= self.params.modulus {
            return Err(CloudError::KeyExchange(format!(
                "Peer public value {} out of range [1, {}]",
                peer_public,
                self.params.modulus - 1
            )));
        }

        Ok(SharedSecret(mod_exp(
            peer_public,
            self.private_exponent,
            self.params.modulus,
        )))
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_exponent.zeroize();
    }
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange")
            .field("params", &self.params)
            .field("private_exponent", &"<redacted>")
            .field("public_value", &self.public_value)
            .finish()
    }
}

/// KEXDH_INIT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KexDhInit {
    /// Initiator's public value
    pub public_value: u64,
}

impl KexDhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + 4 + PUBLIC_VALUE_LEN);
        buf.put_u8(MessageType::KexdhInit as u8);
        buf.put_u32(PUBLIC_VALUE_LEN as u32);
        buf.put_u64(self.public_value);
        buf.to_vec()
    }

    /// Parses the message.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::KeyExchange`] on a wrong message code or a
    /// missing or mis-sized public value.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        let mut buf = expect_code(data, MessageType::KexdhInit)?;
        let public_value = read_public_value(&mut buf)?;
        Ok(Self { public_value })
    }
}

/// KEXDH_REPLY message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Opaque host key blob
    pub host_key: Vec<u8>,
    /// Responder's public value
    pub public_value: u64,
    /// Opaque signature blob
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Creates a reply carrying the placeholder host key and signature blobs.
    pub fn with_placeholders(public_value: u64) -> Self {
        Self {
            host_key: PLACEHOLDER_HOST_KEY.to_vec(),
            public_value,
            signature: PLACEHOLDER_SIGNATURE.to_vec(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            1 + 4 + self.host_key.len() + 4 + PUBLIC_VALUE_LEN + 4 + self.signature.len(),
        );
        buf.put_u8(MessageType::KexdhReply as u8);
        buf.put_u32(self.host_key.len() as u32);
        buf.put_slice(&self.host_key);
        buf.put_u32(PUBLIC_VALUE_LEN as u32);
        buf.put_u64(self.public_value);
        buf.put_u32(self.signature.len() as u32);
        buf.put_slice(&self.signature);
        buf.to_vec()
    }

    /// Parses the message. Blob contents are not validated.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::KeyExchange`] on a wrong message code or any
    /// missing or truncated field.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        let mut buf = expect_code(data, MessageType::KexdhReply)?;
        let host_key = read_blob(&mut buf, "host key")?;
        let public_value = read_public_value(&mut buf)?;
        let signature = read_blob(&mut buf, "signature")?;
        Ok(Self {
            host_key,
            public_value,
            signature,
        })
    }
}

fn expect_code(data: &[u8], expected: MessageType) -> CloudResult<&[u8]> {
    match data.split_first() {
        Some((&code, rest)) if code == expected as u8 => Ok(rest),
        Some((&code, _)) => Err(CloudError::KeyExchange(format!(
            "Expected {}, got message code {}",
            expected, code
        ))),
        None => Err(CloudError::KeyExchange(format!("Empty {} message", expected))),
    }
}

fn read_blob(buf: &mut &[u8], field: &str) -> CloudResult<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(CloudError::KeyExchange(format!("Missing {} length", field)));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(CloudError::KeyExchange(format!(
            "Truncated {}: declared {} bytes, {} available",
            field,
            len,
            buf.remaining()
        )));
    }
    let blob = buf[..len].to_vec();
    buf.advance(len);
    Ok(blob)
}

fn read_public_value(buf: &mut &[u8]) -> CloudResult<u64> {
    let bytes = read_blob(buf, "public value")?;
    let array: [u8; PUBLIC_VALUE_LEN] = bytes.as_slice().try_into().map_err(|_| {
        CloudError::KeyExchange(format!(
            "Public value must be {} bytes, got {}",
            PUBLIC_VALUE_LEN,
            bytes.len()
        ))
    })?;
    Ok(u64::from_be_bytes(array))
}
