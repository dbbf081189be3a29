/*!
Uncompressed tar codec.
*/

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, Header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{archive_label, build_failure, entry_name, ArchiveCodec, ArchiveFormat, CancellableReader};
use crate::{ArchivistError, Result};

/// Tar codec
///
/// Tar has no encryption; a password passed to [`ArchiveCodec::build`] is
/// ignored. Verification walks every header (checksums included) and reads
/// each member's body to the end.
#[derive(Debug, Clone, Default)]
pub struct TarCodec;

impl TarCodec {
    pub fn new() -> Self {
        Self
    }
}

fn write_entries(files: &[PathBuf], output: &Path, cancel: &CancellationToken) -> io::Result<()> {
    let file = File::create(output)?;
    let mut builder = Builder::new(file);

    for path in files {
        if cancel.is_cancelled() {
            return Err(io::Error::other("archive build cancelled"));
        }
        let name = entry_name(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let source = File::open(path)?;
        let mut header = Header::new_gnu();
        header.set_metadata(&source.metadata()?);
        builder.append_data(&mut header, name, CancellableReader::new(source, cancel))?;
    }

    let file = builder.into_inner()?;
    file.sync_all()
}

fn read_entries(archive: &Path) -> io::Result<usize> {
    let mut tar = Archive::new(File::open(archive)?);
    let mut count = 0usize;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let expected = entry.size();
        let read = io::copy(&mut entry, &mut io::sink())?;
        if read != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("member truncated: read {read} of {expected} bytes"),
            ));
        }
        count += 1;
    }
    Ok(count)
}

impl ArchiveCodec for TarCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Tar
    }

    fn supports_password(&self) -> bool {
        false
    }

    fn build_cancellable(
        &self,
        files: &[PathBuf],
        output: &Path,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if password.is_some_and(|p| !p.is_empty()) {
            warn!(archive = %output.display(), "tar does not support passwords; ignoring");
        }
        debug!(archive = %output.display(), files = files.len(), "writing tar archive");

        write_entries(files, output, cancel).map_err(|e| build_failure(output, cancel, e))
    }

    fn verify(&self, archive: &Path, _password: Option<&str>) -> Result<usize> {
        read_entries(archive).map_err(|e| ArchivistError::verify(archive_label(archive), e))
    }
}
