/*!
Archive codecs for building and verifying one archive per file group.

This module defines the codec abstraction (port) and one adapter per
supported container format. The pipeline selects a codec once, when the
user picks a format, and then only talks to the [`ArchiveCodec`] trait.
*/

pub mod sevenz;
pub mod tarball;
pub mod zipfile;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::{ArchivistError, Result};

pub use sevenz::SevenZipCodec;
pub use tarball::TarCodec;
pub use zipfile::ZipCodec;

/// Supported archive container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[serde(rename = "7z")]
    SevenZ,
    Zip,
    Tar,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 3] = [ArchiveFormat::SevenZ, ArchiveFormat::Zip, ArchiveFormat::Tar];

    /// Parse user text, ignoring case and surrounding whitespace
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "7z" => Some(Self::SevenZ),
            "zip" => Some(Self::Zip),
            "tar" => Some(Self::Tar),
            _ => None,
        }
    }

    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            Self::SevenZ => "7z",
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }

    /// Whether a session using this format must collect a password
    pub fn requires_password(&self) -> bool {
        self.codec().supports_password()
    }

    /// Detect the format from an archive file name
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    /// The codec implementing this format
    pub fn codec(&self) -> Box<dyn ArchiveCodec> {
        match self {
            Self::SevenZ => Box::new(SevenZipCodec::new()),
            Self::Zip => Box::new(ZipCodec::new()),
            Self::Tar => Box::new(TarCodec::new()),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = ArchivistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| {
            ArchivistError::validation(format!("Unknown archive format '{s}'. Choose 7z, zip, or tar."))
        })
    }
}

/// Archive codec abstraction
///
/// Implementations write a set of files into one container and can re-open
/// that container to prove it is readable with the same credentials.
/// Codecs are blocking; callers on an async runtime should run them on a
/// blocking thread.
pub trait ArchiveCodec: Send + Sync {
    /// The format produced by this codec
    fn format(&self) -> ArchiveFormat;

    /// Whether the codec can encrypt its output
    fn supports_password(&self) -> bool;

    /// Write `files` into a new archive at `output`
    ///
    /// Every entry is stored under the base name of its source path.
    ///
    /// # Errors
    /// * `ArchivistError::ArchiveBuild` - If any file cannot be read or written
    fn build(&self, files: &[PathBuf], output: &Path, password: Option<&str>) -> Result<()> {
        self.build_cancellable(files, output, password, &CancellationToken::new())
    }

    /// Like [`ArchiveCodec::build`], but stops reading sources once `cancel`
    /// is tripped and removes the partial archive
    ///
    /// # Errors
    /// * `ArchivistError::Cancelled` - If `cancel` was tripped before the archive was finished
    /// * `ArchivistError::ArchiveBuild` - If any file cannot be read or written
    fn build_cancellable(
        &self,
        files: &[PathBuf],
        output: &Path,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Re-open `archive` and read every entry to the end
    ///
    /// # Returns
    /// The number of entries read
    ///
    /// # Errors
    /// * `ArchivistError::ArchiveVerify` - If the archive is corrupt or the password is wrong
    fn verify(&self, archive: &Path, password: Option<&str>) -> Result<usize>;
}

/// Entry name for a source file: its base name, directories discarded
pub(crate) fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ArchivistError::validation(format!("Path has no file name: {}", path.display()))
        })
}

/// Display name used in error messages for an archive path
pub(crate) fn archive_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Source reader that fails once its token is cancelled
pub(crate) struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub(crate) fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("archive build cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Error for a failed build; a cancelled build also drops its partial output
pub(crate) fn build_failure(output: &Path, cancel: &CancellationToken, reason: impl ToString) -> ArchivistError {
    if cancel.is_cancelled() {
        if let Err(e) = std::fs::remove_file(output) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(archive = %output.display(), error = %e, "failed to remove partial archive");
            }
        }
        ArchivistError::Cancelled
    } else {
        ArchivistError::build(archive_label(output), reason)
    }
}

/// Treat an empty password the same as no password
pub(crate) fn effective_password(password: Option<&str>) -> Option<&str> {
    password.filter(|p| !p.is_empty())
}
