/*!
Transport adapters for moving files in and out of a user's session.

The messaging layer that receives files and delivers archives is not part of
the core. It is reached through the [`Transport`] port: a download
primitive, an upload primitive, and a best-effort text reply. Both transfer
primitives report progress through a throttled [`Progress`] callback.
*/

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

use crate::{Result, UserId};

pub use local::LocalTransport;

/// Opaque reference to an inbound file held by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Transport-specific identifier (message file id, source path, ...)
    pub id: String,
    /// File name suggested by the sender, if any
    pub name: Option<String>,
}

impl FileRef {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Transport abstraction for inbound files, outbound files and status text
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stage one inbound file inside `dest_dir`
    ///
    /// # Returns
    /// The local path of the staged file
    ///
    /// # Errors
    /// * `ArchivistError::Download` - If the transfer fails
    async fn download(&self, source: &FileRef, dest_dir: &Path, progress: &mut Progress) -> Result<PathBuf>;

    /// Deliver one local file to the user
    ///
    /// # Errors
    /// * `ArchivistError::Upload` - If the transfer fails
    async fn upload(&self, user: UserId, local_path: &Path, progress: &mut Progress) -> Result<()>;

    /// Send a status message; failures are swallowed by the implementation
    async fn notify(&self, user: UserId, text: &str);
}

/// Direction of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Download,
    Upload,
}

impl TransferKind {
    fn action(&self) -> &'static str {
        match self {
            Self::Download => "Downloading",
            Self::Upload => "Uploading",
        }
    }
}

/// One throttled progress sample of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub user: UserId,
    pub kind: TransferKind,
    pub name: String,
    pub current: u64,
    pub total: u64,
}

impl ProgressUpdate {
    /// Completion percentage; an unknown total counts as complete
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.current as f64 * 100.0 / self.total as f64
        }
    }
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {:.2}%", self.kind.action(), self.name, self.percent())
    }
}

type ProgressSink = Box<dyn FnMut(u64, u64) + Send>;

/// Throttled `on_progress(current, total)` callback
///
/// Transports call [`Progress::report`] as often as they like; the sink is
/// invoked at most once per interval.
pub struct Progress {
    interval: Duration,
    last: Option<Instant>,
    sink: ProgressSink,
}

impl Progress {
    pub fn new<F>(interval: Duration, sink: F) -> Self
    where
        F: FnMut(u64, u64) + Send + 'static,
    {
        Self {
            interval,
            last: None,
            sink: Box::new(sink),
        }
    }

    /// A progress callback that discards every sample
    pub fn silent() -> Self {
        Self::new(Duration::MAX, |_, _| {})
    }

    /// Progress that publishes [`ProgressUpdate`]s on a channel
    pub fn publishing(
        interval: Duration,
        user: UserId,
        kind: TransferKind,
        name: impl Into<String>,
        tx: Option<broadcast::Sender<ProgressUpdate>>,
    ) -> Self {
        let name = name.into();
        Self::new(interval, move |current, total| {
            let update = ProgressUpdate {
                user,
                kind,
                name: name.clone(),
                current,
                total,
            };
            trace!(user = %user, progress = %update, "transfer progress");
            // Dropped when nobody is subscribed
            if let Some(tx) = &tx {
                let _ = tx.send(update);
            }
        })
    }

    /// Report progress; returns whether the sink was invoked
    pub fn report(&mut self, current: u64, total: u64) -> bool {
        self.report_at(Instant::now(), current, total)
    }

    fn report_at(&mut self, now: Instant, current: u64, total: u64) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        (self.sink)(current, total);
        true
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("interval", &self.interval)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
