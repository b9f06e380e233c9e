//! # KimCloud Platform
//!
//! Shared types for the KimCloud secure file transfer stack.
//!
//! This crate provides the unified error type (`CloudError`) and result
//! alias (`CloudResult`) used by every protocol layer.
//!
//! # Examples
//!
//! ```
//! use kimcloud_platform::{CloudError, CloudResult};
//!
//! fn check_chunk(len: usize) -> CloudResult<usize> {
//!     if len == 0 {
//!         return Err(CloudError::ProtocolViolation("empty chunk".to_string()));
//!     }
//!     Ok(len)
//! }
//!
//! # fn main() -> CloudResult<()> {
//! assert_eq!(check_chunk(8192)?, 8192);
//! assert!(check_chunk(0).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{CloudError, CloudResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
