/*!
Zip archive codec with optional AES-256 encryption.
*/

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use zip::result::{ZipError, ZipResult};
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use super::{
    archive_label, build_failure, effective_password, entry_name, ArchiveCodec, ArchiveFormat,
    CancellableReader,
};
use crate::{ArchivistError, Result};

/// Members at or above this size need the zip64 extensions
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Zip codec
///
/// Entries are xz-compressed unless another method is chosen with
/// [`ZipCodec::with_method`]. When a password is supplied every entry is
/// encrypted with WinZip AES-256.
/// Verification decrypts and reads every entry, which checks the CRC (or the
/// AES authentication code) of each member.
///
/// # Example
/// ```rust,no_run
/// use archivist_core::archive::{ArchiveCodec, ZipCodec};
/// use std::path::{Path, PathBuf};
///
/// let codec = ZipCodec::new();
/// let files = vec![PathBuf::from("/work/7/report.pdf")];
/// codec.build(&files, Path::new("/work/7/docs_1.zip"), Some("secret"))?;
/// codec.verify(Path::new("/work/7/docs_1.zip"), Some("secret"))?;
/// # Ok::<(), archivist_core::ArchivistError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZipCodec {
    method: CompressionMethod,
}

impl ZipCodec {
    /// Create a zip codec using xz (LZMA-family) compression
    pub fn new() -> Self {
        Self {
            method: CompressionMethod::Xz,
        }
    }

    /// Create a zip codec with an explicit compression method
    pub fn with_method(method: CompressionMethod) -> Self {
        Self { method }
    }

    fn write_entries(
        &self,
        files: &[PathBuf],
        output: &Path,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> ZipResult<()> {
        let file = File::create(output)?;
        let mut writer = ZipWriter::new(file);

        let mut options = SimpleFileOptions::default().compression_method(self.method);
        if let Some(pass) = password {
            options = options.with_aes_encryption(AesMode::Aes256, pass);
        }

        for path in files {
            if cancel.is_cancelled() {
                return Err(ZipError::Io(io::Error::other("archive build cancelled")));
            }
            let name = entry_name(path).map_err(|e| ZipError::Io(io::Error::other(e.to_string())))?;
            let source = File::open(path)?;
            let size = source.metadata()?.len();

            writer.start_file(name, options.large_file(size >= ZIP64_THRESHOLD))?;
            io::copy(&mut CancellableReader::new(source, cancel), &mut writer)?;
        }

        writer.finish()?;
        Ok(())
    }
}

impl Default for ZipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveCodec for ZipCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn supports_password(&self) -> bool {
        true
    }

    fn build_cancellable(
        &self,
        files: &[PathBuf],
        output: &Path,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let password = effective_password(password);
        debug!(
            archive = %output.display(),
            files = files.len(),
            encrypted = password.is_some(),
            "writing zip archive"
        );

        self.write_entries(files, output, password, cancel)
            .map_err(|e| build_failure(output, cancel, e))
    }

    fn verify(&self, archive: &Path, password: Option<&str>) -> Result<usize> {
        let label = archive_label(archive);
        let password = effective_password(password);

        let file = File::open(archive).map_err(|e| ArchivistError::verify(&label, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| ArchivistError::verify(&label, e))?;

        for index in 0..zip.len() {
            let entry = match password {
                Some(pass) => zip.by_index_decrypt(index, pass.as_bytes()),
                None => zip.by_index(index),
            };
            let mut entry = entry.map_err(|e| ArchivistError::verify(&label, e))?;
            io::copy(&mut entry, &mut io::sink()).map_err(|e| ArchivistError::verify(&label, e))?;
        }

        Ok(zip.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        let nested = dir.join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        let a = dir.join("alpha.txt");
        let b = nested.join("beta.txt");
        std::fs::write(&a, b"alpha contents ".repeat(64)).unwrap();
        std::fs::write(&b, b"beta contents").unwrap();
        vec![a, b]
    }

    #[test]
    fn test_build_and_verify_with_password() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("docs_1.zip");

        let codec = ZipCodec::new();
        codec.build(&files, &output, Some("secret")).unwrap();
        assert_eq!(codec.verify(&output, Some("secret")).unwrap(), 2);
    }

    #[test]
    fn test_default_method_is_xz_under_encryption() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("docs_1.zip");

        let codec = ZipCodec::new();
        codec.build(&files, &output, Some("secret")).unwrap();
        assert_eq!(codec.verify(&output, Some("secret")).unwrap(), 2);

        let mut zip = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        for index in 0..zip.len() {
            let entry = zip.by_index_decrypt(index, b"secret").unwrap();
            assert_eq!(entry.compression(), CompressionMethod::Xz);
            assert!(entry.encrypted());
        }
    }

    #[test]
    fn test_entries_use_base_names() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("docs_1.zip");

        ZipCodec::new().build(&files, &output, None).unwrap();

        let zip = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["alpha.txt", "beta.txt"]);
    }

    #[test]
    fn test_wrong_or_missing_password_fails() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("docs_1.zip");

        let codec = ZipCodec::new();
        codec.build(&files, &output, Some("secret")).unwrap();

        assert!(matches!(
            codec.verify(&output, Some("wrong")),
            Err(ArchivistError::ArchiveVerify { .. })
        ));
        assert!(matches!(
            codec.verify(&output, None),
            Err(ArchivistError::ArchiveVerify { .. })
        ));
    }

    #[test]
    fn test_corrupted_member_fails_crc() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("payload.txt");
        std::fs::write(&payload, b"0123456789abcdefghijklmnopqrstuvwxyz").unwrap();
        let output = dir.path().join("plain_1.zip");

        let codec = ZipCodec::with_method(CompressionMethod::Stored);
        codec.build(&[payload], &output, None).unwrap();
        assert!(codec.verify(&output, None).is_ok());

        let mut bytes = std::fs::read(&output).unwrap();
        let offset = bytes
            .windows(10)
            .position(|w| w == b"0123456789")
            .expect("stored payload present");
        bytes[offset + 3] ^= 0xFF;
        std::fs::write(&output, &bytes).unwrap();

        assert!(codec.verify(&output, None).is_err());
    }

    #[test]
    fn test_missing_source_is_build_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("docs_1.zip");

        let result = ZipCodec::new().build(&[dir.path().join("absent.bin")], &output, None);
        match result {
            Err(ArchivistError::ArchiveBuild { archive, .. }) => assert_eq!(archive, "docs_1.zip"),
            other => panic!("Expected ArchiveBuild error, got {other:?}"),
        }
    }
}
