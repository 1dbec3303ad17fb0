//! Error types for the beak engine
//!
//! One enum covers every failure the archive core can surface. Variants map
//! one-to-one onto the process exit codes reported by the command line
//! front end, so callers can classify failures without string matching.

use thiserror::Error;

/// Type alias for Results in the beak library
pub type Result<T> = std::result::Result<T, BeakError>;

/// Main error type for all beak operations
#[derive(Debug, Error)]
pub enum BeakError {
    /// I/O errors on the origin or a storage file system
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A tar header, segment name, or index record is malformed
    #[error("Parse error: {0}")]
    Parse(String),

    /// A segment's recorded size disagrees with its listing, or a checksum fails
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// An external tool exited non-zero
    #[error("Subprocess {tool} failed: {message}")]
    Subprocess {
        /// The external tool that was invoked
        tool: String,
        /// Captured failure description
        message: String,
    },

    /// Requested path or point-in-time does not resolve
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tar feature or subcommand outside the supported subset
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// UTF-8 conversion error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Path conversion error
    #[error("Path conversion error: {0:?}")]
    PathConversion(std::ffi::OsString),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl BeakError {
    /// Create a parse error with a custom message
    pub fn parse(msg: impl Into<String>) -> Self {
        BeakError::Parse(msg.into())
    }

    /// Create an integrity error with a custom message
    pub fn integrity(msg: impl Into<String>) -> Self {
        BeakError::Integrity(msg.into())
    }

    /// Create a not-found error with a custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        BeakError::NotFound(msg.into())
    }

    /// Create an unsupported error with a custom message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        BeakError::Unsupported(msg.into())
    }

    /// Create a subprocess error for a failed external tool
    pub fn subprocess(tool: impl Into<String>, message: impl Into<String>) -> Self {
        BeakError::Subprocess {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Check if this error means a path or point-in-time did not resolve
    ///
    /// The virtual file system layers map these to ENOENT.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BeakError::NotFound(_))
    }

    /// Check if this error indicates corrupted or tampered data
    pub fn is_corruption(&self) -> bool {
        matches!(self, BeakError::Integrity(_))
    }

    /// Process exit code for this error
    ///
    /// `0` is reserved for success; every error kind has a stable non-zero
    /// code.
    pub fn exit_code(&self) -> i32 {
        match self {
            BeakError::Io(_) => 1,
            BeakError::Parse(_) => 2,
            BeakError::Integrity(_) => 3,
            BeakError::Subprocess { .. } => 4,
            BeakError::NotFound(_) => 5,
            BeakError::Unsupported(_) => 6,
            BeakError::WalkDir(_) => 1,
            BeakError::Utf8(_) => 2,
            BeakError::PathConversion(_) => 2,
            BeakError::InvalidConfiguration(_) => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BeakError::not_found("point in time @9");
        assert_eq!(err.to_string(), "Not found: point in time @9");
    }

    #[test]
    fn test_error_classification() {
        assert!(BeakError::not_found("x").is_not_found());
        assert!(BeakError::integrity("checksum").is_corruption());
        assert!(!BeakError::parse("bad record").is_corruption());
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(BeakError::parse("x").exit_code(), 2);
        assert_eq!(BeakError::integrity("x").exit_code(), 3);
        assert_eq!(BeakError::subprocess("rclone", "exit 1").exit_code(), 4);
        assert_eq!(BeakError::unsupported("diff").exit_code(), 6);
    }
}
