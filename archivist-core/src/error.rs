/*!
Error types for the Archivist core engine.
*/

use thiserror::Error;

/// Result type used throughout the Archivist core.
pub type Result<T> = std::result::Result<T, ArchivistError>;

/// Errors that can occur while collecting, archiving and delivering files.
#[derive(Error, Debug)]
pub enum ArchivistError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// User input that cannot be accepted in the current state
    #[error("Invalid input: {0}")]
    InputValidation(String),

    /// Inbound transfer failures
    #[error("Download failed: {0}")]
    Download(String),

    /// Outbound transfer failures
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Archive codec failures while writing
    #[error("Failed to build archive {archive}: {reason}")]
    ArchiveBuild { archive: String, reason: String },

    /// Archive could not be re-read with its build credentials
    #[error("Verification failed for archive {archive}: {reason}")]
    ArchiveVerify { archive: String, reason: String },

    /// Session registry errors
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job was cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,
}

impl ArchivistError {
    /// Create a new input validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::InputValidation(msg.into())
    }

    /// Create a new download error
    pub fn download<S: Into<String>>(msg: S) -> Self {
        Self::Download(msg.into())
    }

    /// Create a new upload error
    pub fn upload<S: Into<String>>(msg: S) -> Self {
        Self::Upload(msg.into())
    }

    /// Create a new archive build error
    pub fn build<A: Into<String>, R: ToString>(archive: A, reason: R) -> Self {
        Self::ArchiveBuild {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new archive verification error
    pub fn verify<A: Into<String>, R: ToString>(archive: A, reason: R) -> Self {
        Self::ArchiveVerify {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new session error
    pub fn session<S: Into<String>>(msg: S) -> Self {
        Self::Session(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is the cooperative cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
