//! File server.
//!
//! Accepts TCP connections and runs one worker task per connection. A worker
//! drives its session through the handshake and authentication, then serves
//! FILE_START requests until the peer disconnects or an error closes the
//! connection. Workers share only the read-only credential store and the
//! upload directory.
//!
//! # Example
//!
//! ```rust,no_run
//! use kimcloud_proto::ssh::auth::CredentialStore;
//! use kimcloud_proto::ssh::config::ServerConfig;
//! use kimcloud_proto::ssh::server::FileServer;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::builder()
//!     .with_bind_addr("127.0.0.1:2222")
//!     .with_upload_dir("./uploads")
//!     .build()?;
//!
//! let server = FileServer::bind(config, CredentialStore::with_defaults()).await?;
//! println!("Listening on {}", server.local_addr()?);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{serve_authentication, CredentialStore};
use crate::ssh::config::ServerConfig;
use crate::ssh::logging;
use crate::ssh::message::FrameType;
use crate::ssh::transfer::{receive_file, ReceivedFile};
use crate::ssh::transport::{Role, State, TransportConfig, TransportSession};
use kimcloud_platform::{CloudError, CloudResult};
use rand::rngs::OsRng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// State shared by all connection workers.
#[derive(Debug)]
pub struct ServerContext {
    /// Accounts allowed to upload
    pub credentials: CredentialStore,
    /// Where uploads are written
    pub upload_dir: PathBuf,
    /// Handshake parameters
    pub transport: TransportConfig,
}

/// What one connection did before it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Authenticated username
    pub username: String,
    /// Files received on this connection
    pub files: Vec<ReceivedFile>,
}

/// Listening file server.
#[derive(Debug)]
pub struct FileServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl FileServer {
    /// Validates the configuration, creates the upload directory and binds.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] for an invalid configuration and
    /// [`CloudError::Io`] if the directory cannot be created or the address
    /// cannot be bound.
    pub async fn bind(config: ServerConfig, credentials: CredentialStore) -> CloudResult<Self> {
        config.validate()?;
        let transport = config.transport_config()?;

        tokio::fs::create_dir_all(&config.upload_dir).await?;
        let listener = TcpListener::bind(&config.bind_addr).await?;

        info!(
            addr = %listener.local_addr()?,
            upload_dir = %config.upload_dir.display(),
            accounts = credentials.len(),
            "File server listening"
        );

        Ok(Self {
            listener,
            context: Arc::new(ServerContext {
                credentials,
                upload_dir: config.upload_dir,
                transport,
            }),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> CloudResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the shared worker context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Accepts one connection and spawns its worker.
    ///
    /// The returned handle resolves to the worker's outcome, which has also
    /// been logged.
    pub async fn accept_one(&self) -> CloudResult<JoinHandle<CloudResult<SessionSummary>>> {
        let (stream, peer_addr) = self.listener.accept().await?;
        info!(peer = %peer_addr, "Connection accepted");

        let context = Arc::clone(&self.context);
        Ok(tokio::spawn(async move {
            let session = TransportSession::new(stream, Role::Responder, context.transport.clone())
                .with_peer_label(peer_addr.to_string());

            let result = serve_connection(session, context).await;
            match &result {
                Ok(summary) => info!(
                    peer = %peer_addr,
                    username = %summary.username,
                    files = summary.files.len(),
                    "Connection finished"
                ),
                Err(e) => error!(peer = %peer_addr, error = %e, "Connection failed"),
            }
            result
        }))
    }

    /// Accepts connections forever. Accept errors are logged and skipped.
    pub async fn run(&self) -> CloudResult<()> {
        loop {
            if let Err(e) = self.accept_one().await {
                logging::log_error("accept", &e.to_string());
            }
        }
    }
}

/// Runs one connection from handshake to disconnect.
pub async fn serve_connection<S>(
    mut session: TransportSession<S>,
    context: Arc<ServerContext>,
) -> CloudResult<SessionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.handshake(&mut OsRng).await?;
    let username = serve_authentication(&mut session, &context.credentials).await?;

    let mut files = Vec::new();
    loop {
        let frame = session.recv_frame().await?;

        match frame.frame_type {
            FrameType::FileStart => {
                match receive_file(&mut session, &context.upload_dir, &username, &frame.payload)
                    .await
                {
                    Ok(received) => files.push(received),
                    Err(e) if e.is_recoverable() && session.state() != State::Closed => {
                        warn!(peer = %session.peer(), error = %e, "Transfer rejected");
                    }
                    Err(e) => return Err(e),
                }
            }
            FrameType::FileEnd => {
                session.send_frame(FrameType::FileData, &[]).await?;
            }
            FrameType::Disconnect => {
                info!(peer = %session.peer(), username = %username, "Peer disconnected");
                session.close().await;
                return Ok(SessionSummary { username, files });
            }
            other => {
                session.close().await;
                return Err(CloudError::ProtocolViolation(format!(
                    "Unexpected {} after authentication",
                    other
                )));
            }
        }
    }
}
