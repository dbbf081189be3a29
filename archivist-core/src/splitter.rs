/*!
Splitting oversized archives into fixed-size numbered parts.

Parts are named by appending `.partNNN` (1-based, zero padded to three
digits) to the archive path. No manifest is written; reassembly is plain
concatenation in ascending suffix order.
*/

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::{ArchivistError, Result};

/// Path of the `index`-th part (1-based) of `path`
pub fn part_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".part{index:03}"));
    PathBuf::from(name)
}

/// Split `path` into parts of `chunk_size` bytes and delete the original.
///
/// Every part except the last is exactly `chunk_size` bytes. An empty file
/// produces a single empty part.
///
/// # Returns
/// The part paths in ascending order
///
/// # Errors
/// * `ArchivistError::InputValidation` - If `chunk_size` is zero
/// * `ArchivistError::Io` - If reading the archive or writing a part fails
pub async fn split_file(path: &Path, chunk_size: u64) -> Result<Vec<PathBuf>> {
    if chunk_size == 0 {
        return Err(ArchivistError::validation("split chunk size must be greater than zero"));
    }

    let total = fs::metadata(path).await?.len();
    let part_count = total.div_ceil(chunk_size).max(1);
    debug!(
        archive = %path.display(),
        bytes = total,
        chunk_size,
        parts = part_count,
        "splitting archive"
    );

    let mut source = BufReader::new(File::open(path).await?);
    let mut parts = Vec::with_capacity(part_count as usize);

    for index in 1..=part_count as usize {
        let part = part_path(path, index);
        let mut sink = BufWriter::new(File::create(&part).await?);

        let mut limited = (&mut source).take(chunk_size);
        let written = io::copy(&mut limited, &mut sink).await?;
        sink.flush().await?;

        let expected = chunk_size.min(total - (index as u64 - 1) * chunk_size);
        if written != expected {
            return Err(ArchivistError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} shrank while splitting: part {index} got {written} of {expected} bytes",
                    path.display()
                ),
            )));
        }
        parts.push(part);
    }

    drop(source);
    fs::remove_file(path).await?;

    info!(archive = %path.display(), parts = parts.len(), "archive split");
    Ok(parts)
}

/// Split `path` only when it is strictly larger than `threshold`.
///
/// Files at or under the threshold are returned unchanged as the only part.
pub async fn split_if_oversized(path: &Path, threshold: u64) -> Result<Vec<PathBuf>> {
    let size = fs::metadata(path).await?.len();
    if size > threshold {
        split_file(path, threshold).await
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// Concatenate `parts` in the given order into `output`.
///
/// # Returns
/// Total bytes written
pub async fn join_parts(parts: &[PathBuf], output: &Path) -> Result<u64> {
    if parts.is_empty() {
        return Err(ArchivistError::validation("no parts to join"));
    }

    let mut sink = BufWriter::new(File::create(output).await?);
    let mut total = 0u64;
    for part in parts {
        let mut source = File::open(part).await?;
        total += io::copy(&mut source, &mut sink).await?;
    }
    sink.flush().await?;
    Ok(total)
}
