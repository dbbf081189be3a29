/*!
7z archive codec with optional AES-256 content encryption.
*/

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use sevenz_rust2::{
    AesEncoderOptions, Password, SevenZArchiveEntry, SevenZMethod, SevenZReader, SevenZWriter,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    archive_label, build_failure, effective_password, entry_name, ArchiveCodec, ArchiveFormat,
    CancellableReader,
};
use crate::{ArchivistError, Result};

/// 7z codec
///
/// Entries are LZMA2-compressed; with a password the content stream is
/// additionally AES-256 encrypted. Verification decodes every entry, so
/// both a wrong password and a damaged stream surface as errors.
#[derive(Debug, Clone, Default)]
pub struct SevenZipCodec;

impl SevenZipCodec {
    pub fn new() -> Self {
        Self
    }
}

fn write_entries(
    files: &[PathBuf],
    output: &Path,
    password: Option<&str>,
    cancel: &CancellationToken,
) -> std::result::Result<(), String> {
    let mut writer = SevenZWriter::create(output).map_err(|e| e.to_string())?;

    if let Some(pass) = password {
        writer.set_content_methods(vec![
            AesEncoderOptions::new(Password::from(pass)).into(),
            SevenZMethod::LZMA2.into(),
        ]);
    }

    for path in files {
        if cancel.is_cancelled() {
            return Err("archive build cancelled".into());
        }
        let name = entry_name(path).map_err(|e| e.to_string())?;
        let source = File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
        writer
            .push_archive_entry(
                SevenZArchiveEntry::from_path(path, name),
                Some(CancellableReader::new(source, cancel)),
            )
            .map_err(|e| e.to_string())?;
    }

    writer.finish().map_err(|e| e.to_string())?;
    Ok(())
}

impl ArchiveCodec for SevenZipCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::SevenZ
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
            "writing 7z archive"
        );

        write_entries(files, output, password, cancel)
            .map_err(|reason| build_failure(output, cancel, reason))
    }

    fn verify(&self, archive: &Path, password: Option<&str>) -> Result<usize> {
        let label = archive_label(archive);
        let password = effective_password(password)
            .map(Password::from)
            .unwrap_or_else(Password::empty);

        let mut reader =
            SevenZReader::open(archive, password).map_err(|e| ArchivistError::verify(&label, e))?;

        let mut entries = 0usize;
        reader
            .for_each_entries(|_entry, data| {
                io::copy(data, &mut io::sink())?;
                entries += 1;
                Ok(true)
            })
            .map_err(|e| ArchivistError::verify(&label, e))?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        let a = dir.join("notes.md");
        let b = dir.join("data.csv");
        std::fs::write(&a, b"# notes\n".repeat(100)).unwrap();
        std::fs::write(&b, b"id,value\n1,2\n3,4\n").unwrap();
        vec![a, b]
    }

    #[test]
    fn test_build_and_verify_without_password() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("notes_1.7z");

        let codec = SevenZipCodec::new();
        codec.build(&files, &output, None).unwrap();
        assert_eq!(codec.verify(&output, None).unwrap(), 2);
    }

    #[test]
    fn test_build_and_verify_with_password() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("notes_1.7z");

        let codec = SevenZipCodec::new();
        codec.build(&files, &output, Some("hunter2")).unwrap();
        assert_eq!(codec.verify(&output, Some("hunter2")).unwrap(), 2);
    }

    #[test]
    fn test_wrong_or_missing_password_fails() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("notes_1.7z");

        let codec = SevenZipCodec::new();
        codec.build(&files, &output, Some("hunter2")).unwrap();

        assert!(codec.verify(&output, Some("hunter3")).is_err());
        assert!(codec.verify(&output, None).is_err());
    }

    #[test]
    fn test_corrupted_signature_fails() {
        let dir = TempDir::new().unwrap();
        let files = write_inputs(dir.path());
        let output = dir.path().join("notes_1.7z");

        let codec = SevenZipCodec::new();
        codec.build(&files, &output, None).unwrap();

        let mut bytes = std::fs::read(&output).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&output, &bytes).unwrap();

        assert!(matches!(
            codec.verify(&output, None),
            Err(ArchivistError::ArchiveVerify { .. })
        ));
    }

    #[test]
    fn test_corrupted_packed_stream_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("noise.bin");
        let mut state = 0x9e37_79b9_u32;
        let noise: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        std::fs::write(&source, &noise).unwrap();

        let codec = SevenZipCodec::new();
        for password in [None, Some("hunter2")] {
            let output = dir.path().join("noise_1.7z");
            codec.build(&[source.clone()], &output, password).unwrap();
            assert_eq!(codec.verify(&output, password).unwrap(), 1);

            // Packed streams sit between the 32-byte start header and the next header
            let mut bytes = std::fs::read(&output).unwrap();
            let next_header = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
            assert!(next_header > 4096);
            bytes[32 + next_header / 2] ^= 0x5A;
            std::fs::write(&output, &bytes).unwrap();

            assert!(
                matches!(
                    codec.verify(&output, password),
                    Err(ArchivistError::ArchiveVerify { .. })
                ),
                "corruption undetected with password {password:?}"
            );
        }
    }
}
