//! Client and server configuration.
//!
//! Provides configuration structures and builders for [`FileServer`] and
//! [`FileClient`].
//!
//! [`FileServer`]: crate::ssh::server::FileServer
//! [`FileClient`]: crate::ssh::client::FileClient

use crate::ssh::envelope::MAX_CHUNK_SIZE;
use crate::ssh::kex::AlgorithmLists;
use crate::ssh::kex_dh::DhParams;
use crate::ssh::transfer::DEFAULT_CHUNK_SIZE;
use crate::ssh::transport::TransportConfig;
use crate::ssh::version::{Version, DEFAULT_VERSION};
use kimcloud_platform::{CloudError, CloudResult};
use std::path::PathBuf;

/// Default listening address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2222";

/// Default upload directory.
pub const DEFAULT_UPLOAD_DIR: &str = "./uploads";

fn validate_transport(version: &str, algorithms: &AlgorithmLists, dh_params: &DhParams) -> CloudResult<()> {
    Version::new(version)?;

    if let Some(category) = algorithms.first_empty_category() {
        return Err(CloudError::Config(format!(
            "Algorithm list '{}' cannot be empty",
            category
        )));
    }

    dh_params.validate()
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:2222")
    pub bind_addr: String,

    /// Directory uploads are written to
    pub upload_dir: PathBuf,

    /// Identification line (without CR LF)
    pub version: String,

    /// Algorithm preferences
    pub algorithms: AlgorithmLists,

    /// Diffie-Hellman group
    pub dh_params: DhParams,
}

impl ServerConfig {
    /// Create builder for server configuration
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> CloudResult<()> {
        if self.bind_addr.is_empty() {
            return Err(CloudError::Config("bind_addr cannot be empty".into()));
        }
        if self.upload_dir.as_os_str().is_empty() {
            return Err(CloudError::Config("upload_dir cannot be empty".into()));
        }
        validate_transport(&self.version, &self.algorithms, &self.dh_params)
    }

    /// Handshake parameters for a responder session.
    pub fn transport_config(&self) -> CloudResult<TransportConfig> {
        Ok(TransportConfig {
            version: Version::new(&self.version)?,
            algorithms: self.algorithms.clone(),
            dh_params: self.dh_params,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            version: DEFAULT_VERSION.to_string(),
            algorithms: AlgorithmLists::default(),
            dh_params: DhParams::default(),
        }
    }
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Identification line (without CR LF)
    pub version: String,

    /// Algorithm preferences
    pub algorithms: AlgorithmLists,

    /// Diffie-Hellman group
    pub dh_params: DhParams,

    /// Bytes per FILE_DATA chunk
    pub chunk_size: u32,
}

impl ClientConfig {
    /// Create builder for client configuration
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> CloudResult<()> {
        if self.chunk_size == 0 || self.chunk_size as usize > MAX_CHUNK_SIZE {
            return Err(CloudError::Config(format!(
                "chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        validate_transport(&self.version, &self.algorithms, &self.dh_params)
    }

    /// Handshake parameters for an initiator session.
    pub fn transport_config(&self) -> CloudResult<TransportConfig> {
        Ok(TransportConfig {
            version: Version::new(&self.version)?,
            algorithms: self.algorithms.clone(),
            dh_params: self.dh_params,
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            algorithms: AlgorithmLists::default(),
            dh_params: DhParams::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerBuilder {
    bind_addr: Option<String>,
    upload_dir: Option<PathBuf>,
    version: Option<String>,
    algorithms: Option<AlgorithmLists>,
    dh_params: Option<DhParams>,
}

impl ServerBuilder {
    /// Create new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listening address
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// Set upload directory
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    /// Set identification line
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set algorithm preferences
    pub fn with_algorithms(mut self, algorithms: AlgorithmLists) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    /// Set Diffie-Hellman group
    pub fn with_dh_params(mut self, params: DhParams) -> Self {
        self.dh_params = Some(params);
        self
    }

    /// Build ServerConfig with validation
    pub fn build(self) -> CloudResult<ServerConfig> {
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            upload_dir: self.upload_dir.unwrap_or(defaults.upload_dir),
            version: self.version.unwrap_or(defaults.version),
            algorithms: self.algorithms.unwrap_or(defaults.algorithms),
            dh_params: self.dh_params.unwrap_or(defaults.dh_params),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientBuilder {
    version: Option<String>,
    algorithms: Option<AlgorithmLists>,
    dh_params: Option<DhParams>,
    chunk_size: Option<u32>,
}

impl ClientBuilder {
    /// Create new client builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set identification line
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set algorithm preferences
    pub fn with_algorithms(mut self, algorithms: AlgorithmLists) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    /// Set Diffie-Hellman group
    pub fn with_dh_params(mut self, params: DhParams) -> Self {
        self.dh_params = Some(params);
        self
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Build ClientConfig with validation
    pub fn build(self) -> CloudResult<ClientConfig> {
        let defaults = ClientConfig::default();
        let config = ClientConfig {
            version: self.version.unwrap_or(defaults.version),
            algorithms: self.algorithms.unwrap_or(defaults.algorithms),
            dh_params: self.dh_params.unwrap_or(defaults.dh_params),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder_defaults() {
        let config = ServerConfig::builder().build().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:2222");
        assert_eq!(config.upload_dir, PathBuf::from("./uploads"));
        assert_eq!(config.version, "KimCloud_Protocol_v1");
    }

    #[test]
    fn test_server_builder_overrides() {
        let config = ServerConfig::builder()
            .with_bind_addr("127.0.0.1:0")
            .with_upload_dir("/tmp/up")
            .with_version("Custom_v3")
            .build()
            .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.transport_config().unwrap().version.as_str(), "Custom_v3");
    }

    #[test]
    fn test_invalid_version_rejected() {
        assert!(ServerConfig::builder().with_version("").build().is_err());
        assert!(ServerConfig::builder().with_version("a\r\nb").build().is_err());
        assert!(ClientConfig::builder()
            .with_version("v".repeat(254))
            .build()
            .is_err());
    }

    #[test]
    fn test_empty_algorithm_list_rejected() {
        let mut algorithms = AlgorithmLists::default();
        algorithms.mac_server_to_client.clear();
        match ClientConfig::builder().with_algorithms(algorithms).build() {
            Err(CloudError::Config(msg)) => assert!(msg.contains("mac_server_to_client")),
            _ => panic!("Expected Config error"),
        }

        // language lists may be empty
        let algorithms = AlgorithmLists::default();
        assert!(algorithms.languages_client_to_server.is_empty());
        assert!(ClientConfig::builder().with_algorithms(algorithms).build().is_ok());
    }

    #[test]
    fn test_bad_dh_params_rejected() {
        let params = DhParams {
            modulus: 3,
            generator: 2,
        };
        assert!(ServerConfig::builder().with_dh_params(params).build().is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert_eq!(ClientConfig::default().chunk_size, 8192);
        assert!(ClientConfig::builder().with_chunk_size(0).build().is_err());
        assert!(ClientConfig::builder()
            .with_chunk_size(MAX_CHUNK_SIZE as u32)
            .build()
            .is_ok());
        assert!(ClientConfig::builder()
            .with_chunk_size(MAX_CHUNK_SIZE as u32 + 1)
            .build()
            .is_err());
    }
}
