//! Protocol version exchange.
//!
//! Both peers send an identification line immediately after connecting:
//!
//! ```text
//! identification-string CR LF
//! ```
//!
//! Example: `KimCloud_Protocol_v1\r\n`
//!
//! The received line must match our own identification byte for byte.
//! There is no version negotiation and no tolerance for extra comments.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::version::Version;
//!
//! let ours = Version::default();
//! assert_eq!(ours.to_wire_format(), b"KimCloud_Protocol_v1\r\n");
//!
//! let peer = Version::parse("KimCloud_Protocol_v1\r\n").unwrap();
//! assert!(ours.verify_peer(&peer).is_ok());
//! ```

use kimcloud_platform::{CloudError, CloudResult};

/// Maximum length of an identification line including CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Identification string used when none is configured.
pub const DEFAULT_VERSION: &str = "KimCloud_Protocol_v1";

/// Protocol identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    identification: String,
}

impl Version {
    /// Creates a version from an identification string (without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] if the string is empty, contains CR, LF
    /// or NUL, or does not fit in [`MAX_VERSION_LENGTH`] once CR LF is added.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kimcloud_proto::ssh::version::Version;
    ///
    /// let version = Version::new("KimCloud_Protocol_v2").unwrap();
    /// assert_eq!(version.as_str(), "KimCloud_Protocol_v2");
    /// assert!(Version::new("bad\r\nline").is_err());
    /// ```
    pub fn new(identification: &str) -> CloudResult<Self> {
        if identification.is_empty() {
            return Err(CloudError::Config(
                "Version string must not be empty".to_string(),
            ));
        }

        if identification.len() + 2 > MAX_VERSION_LENGTH {
            return Err(CloudError::Config(format!(
                "Version string too long: {} bytes (max {})",
                identification.len(),
                MAX_VERSION_LENGTH - 2
            )));
        }

        if identification.contains(['\r', '\n', '\0']) {
            return Err(CloudError::Config(
                "Version string contains CR, LF or NUL".to_string(),
            ));
        }

        Ok(Self {
            identification: identification.to_string(),
        })
    }

    /// Parses a received identification line.
    ///
    /// A trailing `\r\n` (or bare `\n`) is stripped.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] if the line is too long,
    /// empty, or contains NUL or stray line terminators.
    pub fn parse(line: &str) -> CloudResult<Self> {
        if line.len() > MAX_VERSION_LENGTH {
            return Err(CloudError::ProtocolViolation(format!(
                "Version line too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        let stripped = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if stripped.is_empty() || stripped.contains(['\r', '\n', '\0']) {
            return Err(CloudError::ProtocolViolation(format!(
                "Invalid version line: {:?}",
                line
            )));
        }

        Ok(Self {
            identification: stripped.to_string(),
        })
    }

    /// Returns the identification string without CR LF.
    pub fn as_str(&self) -> &str {
        &self.identification
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.identification).into_bytes()
    }

    /// Checks that the peer sent exactly our identification string.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] on any difference.
    pub fn verify_peer(&self, peer: &Version) -> CloudResult<()> {
        if self.identification.as_bytes() != peer.identification.as_bytes() {
            return Err(CloudError::ProtocolViolation(format!(
                "Version mismatch: expected '{}', got '{}'",
                self.identification, peer.identification
            )));
        }
        Ok(())
    }
}

impl Default for Version {
    fn default() -> Self {
        Self {
            identification: DEFAULT_VERSION.to_string(),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identification)
    }
}
