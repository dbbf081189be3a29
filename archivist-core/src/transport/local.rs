/*!
Local filesystem transport adapter.
*/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{FileRef, Progress, Transport};
use crate::{ArchivistError, Result, UserId};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Local filesystem transport
///
/// A [`FileRef`] id is read as a source path on disk. Uploads are copied
/// into `<outbox>/<user id>/`, and notifications go to the log (and
/// optionally to stdout).
///
/// # Example
/// ```rust,no_run
/// use archivist_core::transport::LocalTransport;
///
/// let transport = LocalTransport::new("/var/archivist/outbox").with_echo(true);
/// // upload(UserId(7), "docs_1.zip") copies to "/var/archivist/outbox/7/docs_1.zip"
/// ```
#[derive(Debug, Clone)]
pub struct LocalTransport {
    outbox: PathBuf,
    echo: bool,
}

impl LocalTransport {
    /// Create a transport delivering uploads under `outbox`
    pub fn new<P: AsRef<Path>>(outbox: P) -> Self {
        Self {
            outbox: outbox.as_ref().to_path_buf(),
            echo: false,
        }
    }

    /// Print notifications to stdout as well as the log
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Directory receiving uploads for `user`
    pub fn outbox_for(&self, user: UserId) -> PathBuf {
        self.outbox.join(user.to_string())
    }
}

/// Pick a name inside `dir` that no existing file uses
///
/// `report.pdf` becomes `report (1).pdf`, `report (2).pdf`, ...
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = original.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

async fn copy_with_progress(source: &Path, dest: &Path, progress: &mut Progress) -> std::io::Result<u64> {
    let mut reader = File::open(source).await?;
    let total = reader.metadata().await?.len();
    let mut writer = File::create(dest).await?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    progress.report(0, total);
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        copied += read as u64;
        progress.report(copied, total);
    }
    writer.flush().await?;
    Ok(copied)
}

#[async_trait]
impl Transport for LocalTransport {
    async fn download(&self, source: &FileRef, dest_dir: &Path, progress: &mut Progress) -> Result<PathBuf> {
        let source_path = PathBuf::from(&source.id);
        let name = match &source.name {
            Some(name) => name.clone(),
            None => source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ArchivistError::download(format!("{} has no file name", source.id)))?,
        };
        // Sender-supplied names must not escape the working directory
        let name = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchivistError::download(format!("invalid file name '{name}'")))?;

        let dest = unique_destination(dest_dir, &name).await;
        let bytes = copy_with_progress(&source_path, &dest, progress)
            .await
            .map_err(|e| {
                ArchivistError::download(format!("{}: {e}", source_path.display()))
            });
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&dest).await;
                return Err(e);
            }
        };

        debug!(source = %source_path.display(), dest = %dest.display(), bytes, "file staged");
        Ok(dest)
    }

    async fn upload(&self, user: UserId, local_path: &Path, progress: &mut Progress) -> Result<()> {
        let name = local_path
            .file_name()
            .ok_or_else(|| ArchivistError::upload(format!("{} has no file name", local_path.display())))?;

        let dir = self.outbox_for(user);
        fs::create_dir_all(&dir).await.map_err(|e| {
            ArchivistError::upload(format!("Failed to create directory {}: {e}", dir.display()))
        })?;

        let dest = dir.join(name);
        let bytes = copy_with_progress(local_path, &dest, progress)
            .await
            .map_err(|e| ArchivistError::upload(format!("{}: {e}", local_path.display())))?;

        debug!(user = %user, dest = %dest.display(), bytes, "file delivered");
        Ok(())
    }

    async fn notify(&self, user: UserId, text: &str) {
        info!(user = %user, "{text}");
        if self.echo {
            println!("{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_download_copies_into_dest_dir() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("report.pdf");
        std::fs::write(&source, b"pdf bytes").unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let transport = LocalTransport::new(temp.path().join("outbox"));
        let file = FileRef::new(source.to_string_lossy());
        let staged = transport
            .download(&file, &work, &mut Progress::silent())
            .await
            .unwrap();

        assert_eq!(staged, work.join("report.pdf"));
        assert_eq!(std::fs::read(&staged).unwrap(), b"pdf bytes");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_download_avoids_name_collisions() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("a/photo.jpg");
        let second = temp.path().join("b/photo.jpg");
        for path in [&first, &second] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, path.to_string_lossy().as_bytes()).unwrap();
        }
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let transport = LocalTransport::new(temp.path().join("outbox"));
        let mut progress = Progress::silent();
        let one = transport
            .download(&FileRef::new(first.to_string_lossy()), &work, &mut progress)
            .await
            .unwrap();
        let two = transport
            .download(&FileRef::new(second.to_string_lossy()), &work, &mut progress)
            .await
            .unwrap();

        assert_eq!(one, work.join("photo.jpg"));
        assert_eq!(two, work.join("photo (1).jpg"));
    }

    #[tokio::test]
    async fn test_download_strips_directories_from_sender_name() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("x.bin");
        std::fs::write(&source, b"x").unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let transport = LocalTransport::new(temp.path().join("outbox"));
        let file = FileRef::new(source.to_string_lossy()).with_name("../../etc/evil.bin");
        let staged = transport
            .download(&file, &work, &mut Progress::silent())
            .await
            .unwrap();

        assert_eq!(staged, work.join("evil.bin"));
    }

    #[tokio::test]
    async fn test_download_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path().join("outbox"));
        let file = FileRef::new(temp.path().join("absent.txt").to_string_lossy());

        let result = transport
            .download(&file, temp.path(), &mut Progress::silent())
            .await;

        assert!(matches!(result, Err(ArchivistError::Download(_))));
        assert!(!temp.path().join("absent.txt").exists());
    }

    #[tokio::test]
    async fn test_upload_goes_to_user_outbox() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("docs_1.zip");
        std::fs::write(&archive, b"zip bytes").unwrap();

        let transport = LocalTransport::new(temp.path().join("outbox"));
        transport
            .upload(UserId(7), &archive, &mut Progress::silent())
            .await
            .unwrap();

        let delivered = temp.path().join("outbox/7/docs_1.zip");
        assert_eq!(std::fs::read(delivered).unwrap(), b"zip bytes");
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path().join("outbox"));

        let result = transport
            .upload(UserId(7), &temp.path().join("gone.zip"), &mut Progress::silent())
            .await;

        assert!(matches!(result, Err(ArchivistError::Upload(_))));
    }
}
