//! Error types for virtscale.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use crate::types::vm::VmStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for virtscale operations.
pub type Result<T> = std::result::Result<T, VirtscaleError>;

/// Main error type for virtscale.
#[derive(Error, Debug)]
pub enum VirtscaleError {
    // Hypervisor connection errors
    #[error("Hypervisor connection failed ({uri}): {reason}")]
    Connection { uri: String, reason: String },

    #[error("Domain not found: {name}")]
    DomainNotFound { name: String },

    #[error("VM already exists: {name}")]
    AlreadyExists { name: String },

    // State machine errors
    #[error("Cannot {operation} VM {vm}: invalid state {status}")]
    InvalidState { vm: String, operation: &'static str, status: VmStatus },

    // Resource errors
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Permission denied at {path:?}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    // Cgroup v2 sysfs errors
    #[error("Cgroup write failed at {path:?}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Errors surfaced by the hypervisor library itself
    #[error("Hypervisor error {code}: {message}")]
    Hypervisor { code: i32, message: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VirtscaleError {
    /// Classify an io error against a sysfs/cgroup path.
    ///
    /// EACCES becomes `PermissionDenied`; everything else is a `Cgroup` error
    /// carrying the filename and underlying errno.
    pub fn from_sysfs_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { path, source }
        } else {
            Self::Cgroup { path, source }
        }
    }

    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
