//! Configuration for the archival pipeline
//!
//! This module holds the size thresholds and working-directory layout used by
//! the session state machine and the job runner. Every value has a default
//! and can be overridden from the environment, a JSON file, or the CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ArchivistError, Result, UserId};

/// Archives larger than this are split into parts of this size (2 GiB)
pub const DEFAULT_SPLIT_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Per-group byte cap applied before splitting is considered (20 GiB)
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Per-group file count cap
pub const DEFAULT_MAX_FILES_PER_ARCHIVE: usize = 200;

/// Minimum wall time between two progress callbacks
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Default root under which per-user working directories are created
pub const DEFAULT_WORK_ROOT: &str = "./temp";

/// Runtime settings for the archival pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory holding one working directory per user
    pub work_root: PathBuf,
    /// Archives strictly larger than this are split into parts of this size
    pub split_size: u64,
    /// Cumulative byte cap for one file group
    pub max_archive_size: u64,
    /// File count cap for one file group
    pub max_files_per_archive: usize,
    /// Minimum interval between progress callbacks, in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            split_size: DEFAULT_SPLIT_SIZE,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            max_files_per_archive: DEFAULT_MAX_FILES_PER_ARCHIVE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    /// Create a default configuration rooted at the given directory
    pub fn with_work_root<P: AsRef<Path>>(work_root: P) -> Self {
        Self {
            work_root: work_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Build a configuration from `ARCHIVIST_*` environment variables
    ///
    /// Recognised variables:
    /// - `ARCHIVIST_WORK_DIR`
    /// - `ARCHIVIST_SPLIT_SIZE`
    /// - `ARCHIVIST_MAX_ARCHIVE_SIZE`
    /// - `ARCHIVIST_MAX_FILES_PER_ARCHIVE`
    /// - `ARCHIVIST_PROGRESS_INTERVAL_MS`
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("ARCHIVIST_WORK_DIR") {
            config.work_root = PathBuf::from(dir);
        }
        if let Some(value) = lookup("ARCHIVIST_SPLIT_SIZE") {
            config.split_size = parse_number("ARCHIVIST_SPLIT_SIZE", &value)?;
        }
        if let Some(value) = lookup("ARCHIVIST_MAX_ARCHIVE_SIZE") {
            config.max_archive_size = parse_number("ARCHIVIST_MAX_ARCHIVE_SIZE", &value)?;
        }
        if let Some(value) = lookup("ARCHIVIST_MAX_FILES_PER_ARCHIVE") {
            config.max_files_per_archive =
                parse_number("ARCHIVIST_MAX_FILES_PER_ARCHIVE", &value)?;
        }
        if let Some(value) = lookup("ARCHIVIST_PROGRESS_INTERVAL_MS") {
            config.progress_interval_ms = parse_number("ARCHIVIST_PROGRESS_INTERVAL_MS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file; missing fields keep defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.split_size == 0 {
            return Err(ArchivistError::config("split_size must be greater than zero"));
        }
        if self.max_archive_size == 0 {
            return Err(ArchivistError::config(
                "max_archive_size must be greater than zero",
            ));
        }
        if self.max_files_per_archive == 0 {
            return Err(ArchivistError::config(
                "max_files_per_archive must be greater than zero",
            ));
        }
        if self.work_root.as_os_str().is_empty() {
            return Err(ArchivistError::config("work_root must not be empty"));
        }
        Ok(())
    }

    /// The exclusively owned working directory of one user
    pub fn user_dir(&self, user: UserId) -> PathBuf {
        self.work_root.join(user.to_string())
    }

    /// Progress throttle interval as a [`Duration`]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ArchivistError::config(format!("{key} must be a non-negative integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.split_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.max_archive_size, 20 * 1024 * 1024 * 1024);
        assert_eq!(config.max_files_per_archive, 200);
        assert_eq!(config.progress_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_user_dir_is_namespaced_by_user() {
        let config = PipelineConfig::with_work_root("/var/archivist");
        assert_eq!(
            config.user_dir(UserId(42)),
            PathBuf::from("/var/archivist/42")
        );
        assert_ne!(config.user_dir(UserId(1)), config.user_dir(UserId(2)));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("ARCHIVIST_WORK_DIR", "/srv/work"),
            ("ARCHIVIST_SPLIT_SIZE", "1048576"),
            ("ARCHIVIST_MAX_FILES_PER_ARCHIVE", " 10 "),
        ]))
        .unwrap();

        assert_eq!(config.work_root, PathBuf::from("/srv/work"));
        assert_eq!(config.split_size, 1_048_576);
        assert_eq!(config.max_files_per_archive, 10);
        assert_eq!(config.max_archive_size, DEFAULT_MAX_ARCHIVE_SIZE);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = PipelineConfig::from_lookup(lookup_from(&[("ARCHIVIST_SPLIT_SIZE", "2GB")]));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("ARCHIVIST_SPLIT_SIZE"));
    }

    #[test]
    fn test_validate_zero_limits() {
        let mut config = PipelineConfig::default();
        config.split_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.max_archive_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.max_files_per_archive = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archivist.json");
        std::fs::write(&path, r#"{"split_size": 4096, "work_root": "/tmp/arch"}"#).unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.split_size, 4096);
        assert_eq!(config.work_root, PathBuf::from("/tmp/arch"));
        assert_eq!(config.max_files_per_archive, DEFAULT_MAX_FILES_PER_ARCHIVE);
    }
}
