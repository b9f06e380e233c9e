//! File upload client.
//!
//! # Example
//!
//! ```rust,no_run
//! use kimcloud_proto::ssh::client::FileClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = FileClient::connect("127.0.0.1:2222").await?;
//! client.authenticate("hosung", "kim").await?;
//!
//! let report = client.upload("notes.txt").await?;
//! println!("sent {} bytes as {}", report.bytes_sent, report.remote_name);
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth;
use crate::ssh::config::ClientConfig;
use crate::ssh::message::FrameType;
use crate::ssh::transfer::{send_file, UploadReport};
use crate::ssh::transport::{Role, State, TransportSession};
use kimcloud_platform::{CloudError, CloudResult};
use rand::rngs::OsRng;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Client side of one connection.
#[derive(Debug)]
pub struct FileClient<S = TcpStream> {
    session: TransportSession<S>,
    config: ClientConfig,
    username: Option<String>,
}

impl FileClient<TcpStream> {
    /// Connects with the default configuration and completes the handshake.
    pub async fn connect(addr: &str) -> CloudResult<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Connects with a custom configuration and completes the handshake.
    pub async fn connect_with_config(addr: &str, config: ClientConfig) -> CloudResult<Self> {
        config.validate()?;
        let stream = TcpStream::connect(addr).await?;
        info!(server = addr, "Connected");
        Self::handshake_over(stream, addr, config).await
    }
}

impl<S> FileClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake over an already connected stream.
    pub async fn handshake_over(
        stream: S,
        peer_label: &str,
        config: ClientConfig,
    ) -> CloudResult<Self> {
        config.validate()?;
        let mut session = TransportSession::new(stream, Role::Initiator, config.transport_config()?)
            .with_peer_label(peer_label);
        session.handshake(&mut OsRng).await?;

        Ok(Self {
            session,
            config,
            username: None,
        })
    }

    /// Returns the session state.
    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Returns the authenticated username.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the transport session.
    pub fn session(&self) -> &TransportSession<S> {
        &self.session
    }

    /// Authenticates with a username and password.
    ///
    /// # Errors
    ///
    /// [`CloudError::AuthFailure`] leaves the connection usable; call again
    /// with other credentials.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> CloudResult<()> {
        auth::authenticate(&mut self.session, username, password).await?;
        self.username = Some(username.to_string());
        Ok(())
    }

    /// Uploads one file. The server stores it as `{username}_{file name}`.
    ///
    /// # Errors
    ///
    /// [`CloudError::FileIo`] leaves the connection usable. Anything else
    /// closes it.
    pub async fn upload(&mut self, path: impl AsRef<Path>) -> CloudResult<UploadReport> {
        if self.username.is_none() {
            return Err(CloudError::ProtocolViolation(
                "Upload requires authentication".to_string(),
            ));
        }
        send_file(&mut self.session, path.as_ref(), self.config.chunk_size).await
    }

    /// Uploads files one after another over this connection.
    ///
    /// Per-file [`CloudError::FileIo`] failures are collected and the next
    /// file is tried. A fatal error stops the batch and is returned.
    pub async fn upload_all<P>(&mut self, paths: &[P]) -> CloudResult<Vec<CloudResult<UploadReport>>>
    where
        P: AsRef<Path>,
    {
        let mut results = Vec::with_capacity(paths.len());

        for path in paths {
            match self.upload(path).await {
                Ok(report) => results.push(Ok(report)),
                Err(e) if e.is_recoverable() && self.state() != State::Closed => {
                    warn!(path = %path.as_ref().display(), error = %e, "Upload skipped");
                    results.push(Err(e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }

    /// Sends DISCONNECT and closes the connection.
    pub async fn disconnect(mut self) -> CloudResult<()> {
        let result = self.session.send_frame(FrameType::Disconnect, &[]).await;
        self.session.close().await;
        result
    }
}
