//! Password authentication over the encrypted channel.
//!
//! One round trip per attempt:
//!
//! ```text
//! client                              server
//!   AUTH_REQUEST [ulen][plen][u][p] ->
//!                                  <- AUTH_SUCCESS | AUTH_FAILURE (empty)
//! ```
//!
//! A rejected attempt leaves the connection open; the client may send another
//! request. There is no lockout.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::auth::CredentialStore;
//!
//! let store = CredentialStore::parse("# demo\nhosung:kim\n").unwrap();
//! assert!(store.verify("hosung", "kim"));
//! assert!(!store.verify("hosung", "wrong"));
//! ```

use crate::ssh::logging;
use crate::ssh::message::FrameType;
use crate::ssh::transport::TransportSession;
use bytes::{Buf, BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroize;

/// Maximum username and password length in bytes.
pub const MAX_CREDENTIAL_LEN: usize = 256;

/// AUTH_REQUEST payload.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Username
    pub username: String,
    password: String,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Serializes the payload. Lengths are not checked here.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.username.len() + self.password.len());
        buf.put_u32(self.username.len() as u32);
        buf.put_u32(self.password.len() as u32);
        buf.put_slice(self.username.as_bytes());
        buf.put_slice(self.password.as_bytes());
        buf.to_vec()
    }

    /// Parses the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] if either length exceeds
    /// [`MAX_CREDENTIAL_LEN`], the fields are truncated, or either field is
    /// not UTF-8.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        let mut buf = data;
        if buf.remaining() < 8 {
            return Err(CloudError::ProtocolViolation(format!(
                "AUTH_REQUEST too short: {} bytes",
                data.len()
            )));
        }

        let username_len = buf.get_u32() as usize;
        let password_len = buf.get_u32() as usize;

        if username_len > MAX_CREDENTIAL_LEN || password_len > MAX_CREDENTIAL_LEN {
            return Err(CloudError::ProtocolViolation(format!(
                "Credential too long: username {} bytes, password {} bytes (max {})",
                username_len, password_len, MAX_CREDENTIAL_LEN
            )));
        }

        if buf.remaining() < username_len + password_len {
            return Err(CloudError::ProtocolViolation(
                "AUTH_REQUEST fields truncated".to_string(),
            ));
        }

        let username = std::str::from_utf8(&buf[..username_len])
            .map_err(|_| CloudError::ProtocolViolation("Username is not UTF-8".to_string()))?
            .to_string();
        buf.advance(username_len);

        let password = std::str::from_utf8(&buf[..password_len])
            .map_err(|_| CloudError::ProtocolViolation("Password is not UTF-8".to_string()))?
            .to_string();

        Ok(Self { username, password })
    }
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for AuthRequest {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Read-only username to password table.
///
/// Built once at startup and shared between connection workers behind an
/// `Arc`; lookups never lock.
#[derive(Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from username/password pairs. Later duplicates win.
    pub fn from_pairs<I, U, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: pairs
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    /// The two demo accounts.
    pub fn with_defaults() -> Self {
        Self::from_pairs([("hosung", "kim"), ("admin", "password")])
    }

    /// Parses `username:password` lines.
    ///
    /// Blank lines and lines starting with `#` are skipped. The password is
    /// everything after the first colon.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] naming the first malformed line.
    pub fn parse(text: &str) -> CloudResult<Self> {
        let mut users = HashMap::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (username, password) = line.split_once(':').ok_or_else(|| {
                CloudError::Config(format!(
                    "Credential line {}: expected username:password",
                    index + 1
                ))
            })?;

            if username.is_empty() || username.len() > MAX_CREDENTIAL_LEN {
                return Err(CloudError::Config(format!(
                    "Credential line {}: username must be 1..={} bytes",
                    index + 1,
                    MAX_CREDENTIAL_LEN
                )));
            }
            if password.len() > MAX_CREDENTIAL_LEN {
                return Err(CloudError::Config(format!(
                    "Credential line {}: password longer than {} bytes",
                    index + 1,
                    MAX_CREDENTIAL_LEN
                )));
            }

            users.insert(username.to_string(), password.to_string());
        }

        Ok(Self { users })
    }

    /// Reads and parses a credential file.
    pub async fn load(path: impl AsRef<Path>) -> CloudResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse(&text)
    }

    /// Returns true if the username exists and the password matches.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(stored) => stored.as_bytes().ct_eq(password.as_bytes()).into(),
            None => false,
        }
    }

    /// Returns true if the username exists.
    pub fn contains_user(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns true if there are no accounts.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("users", &self.users.len())
            .finish()
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        for password in self.users.values_mut() {
            password.zeroize();
        }
    }
}

/// Server side: answers AUTH_REQUEST frames until one succeeds.
///
/// Returns the authenticated username.
///
/// # Errors
///
/// Transport errors, DISCONNECT or any frame other than AUTH_REQUEST end the
/// loop; the session is closed in every error case.
pub async fn serve_authentication<S>(
    session: &mut TransportSession<S>,
    store: &CredentialStore,
) -> CloudResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = session.recv_frame().await?;

        match frame.frame_type {
            FrameType::AuthRequest => {}
            FrameType::Disconnect => {
                session.close().await;
                return Err(CloudError::ProtocolViolation(
                    "Peer disconnected before authenticating".to_string(),
                ));
            }
            other => {
                session.close().await;
                return Err(CloudError::ProtocolViolation(format!(
                    "Expected AUTH_REQUEST, got {}",
                    other
                )));
            }
        }

        let request = match AuthRequest::from_bytes(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                logging::log_authentication_failed(session.peer(), "<malformed>", &e.to_string());
                session.send_frame(FrameType::AuthFailure, &[]).await?;
                continue;
            }
        };

        if store.verify(&request.username, request.password()) {
            session.send_frame(FrameType::AuthSuccess, &[]).await?;
            session.mark_authenticated()?;
            logging::log_authentication_success(session.peer(), &request.username);
            return Ok(request.username.clone());
        }

        logging::log_authentication_failed(session.peer(), &request.username, "invalid credentials");
        session.send_frame(FrameType::AuthFailure, &[]).await?;
    }
}

/// Client side: sends one AUTH_REQUEST and waits for the verdict.
///
/// # Errors
///
/// Returns [`CloudError::AuthFailure`] if the server rejected the
/// credentials; the session stays open and the call may be repeated. Any
/// other error closes the session.
pub async fn authenticate<S>(
    session: &mut TransportSession<S>,
    username: &str,
    password: &str,
) -> CloudResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = AuthRequest::new(username, password);
    session
        .send_frame(FrameType::AuthRequest, &request.to_bytes())
        .await?;

    let reply = session.recv_frame().await?;
    match reply.frame_type {
        FrameType::AuthSuccess => {
            session.mark_authenticated()?;
            logging::log_authentication_success(session.peer(), username);
            Ok(())
        }
        FrameType::AuthFailure => {
            logging::log_authentication_failed(session.peer(), username, "rejected by server");
            Err(CloudError::AuthFailure(format!(
                "Server rejected credentials for '{}'",
                username
            )))
        }
        other => {
            session.close().await;
            Err(CloudError::ProtocolViolation(format!(
                "Expected AUTH_SUCCESS or AUTH_FAILURE, got {}",
                other
            )))
        }
    }
}
