/*!
Background archive job: group, build, verify, split and upload.

A [`JobRunner`] is spawned once per completed session. It owns nothing but
clones of the shared handles it needs, reports every step to the user
through the transport, and returns a [`JobReport`] describing what happened
to each group.
*/

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveCodec, ArchiveFormat};
use crate::config::PipelineConfig;
use crate::grouper::{group_files, FileGroup, StagedFile};
use crate::session::{remove_work_dir, SessionRegistry, SessionState, UserId};
use crate::splitter::split_if_oversized;
use crate::transport::{Progress, ProgressUpdate, TransferKind, Transport};
use crate::{ArchivistError, Result};

#[cfg(feature = "metrics")]
use crate::observability::{ArchivistMetrics, StepTimer};

/// Everything a job needs, captured from the session when it was closed
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub session_id: Uuid,
    pub user: UserId,
    pub format: ArchiveFormat,
    pub filename: String,
    pub password: Option<String>,
    pub files: Vec<StagedFile>,
    pub work_dir: PathBuf,
}

impl JobSpec {
    /// Archive file name for the 1-based group `index`
    pub fn archive_name(&self, index: usize) -> String {
        format!("{}_{}.{}", self.filename, index, self.format.extension())
    }
}

/// Pipeline step at which a group failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Verify,
    Split,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::Verify => "verify",
            Self::Split => "split",
            Self::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Delivered { parts: usize, bytes: u64 },
    Failed { stage: Stage, reason: String },
}

/// What happened to one file group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub index: usize,
    pub archive_name: String,
    pub files: usize,
    pub status: GroupStatus,
}

impl GroupOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, GroupStatus::Delivered { .. })
    }
}

/// Result of one archive job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub user: UserId,
    pub format: ArchiveFormat,
    pub files: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub groups: Vec<GroupOutcome>,
    pub cancelled: bool,
}

impl JobReport {
    fn new(spec: &JobSpec) -> Self {
        Self {
            job_id: spec.job_id,
            user: spec.user,
            format: spec.format,
            files: spec.files.len(),
            started_at: Utc::now(),
            finished_at: None,
            groups: Vec::new(),
            cancelled: false,
        }
    }

    pub fn delivered(&self) -> usize {
        self.groups.iter().filter(|g| g.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.groups.len() - self.delivered()
    }

    /// True when the job ran to the end and every group was delivered
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Finished: {} of {} archives delivered.",
            self.delivered(),
            self.groups.len()
        )
    }
}

/// Scoped ownership of a session's working directory
///
/// Releasing the lease removes the session entry and deletes the directory,
/// but only while the entry still belongs to the leasing session. A
/// cancelled session has already been removed by the canceller, so the
/// lease then does nothing.
pub struct WorkspaceLease {
    registry: SessionRegistry,
    user: UserId,
    session_id: Uuid,
    work_dir: PathBuf,
    released: bool,
}

impl WorkspaceLease {
    pub fn new(registry: SessionRegistry, user: UserId, session_id: Uuid, work_dir: PathBuf) -> Self {
        Self {
            registry,
            user,
            session_id,
            work_dir,
            released: false,
        }
    }

    /// Release the lease; returns whether this call removed the workspace
    pub async fn release(mut self) -> bool {
        self.released = true;
        if self.registry.finish(self.user, self.session_id).is_some() {
            remove_work_dir(&self.work_dir).await;
            true
        } else {
            false
        }
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.registry.finish(self.user, self.session_id).is_some() {
            warn!(user = %self.user, dir = %self.work_dir.display(), "job exited early; cleaning up workspace");
            if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(user = %self.user, error = %e, "failed to remove working directory");
                }
            }
        }
    }
}

/// Runs one archive job to completion or cancellation
pub struct JobRunner<T: Transport> {
    transport: Arc<T>,
    config: Arc<PipelineConfig>,
    registry: SessionRegistry,
    cancel: CancellationToken,
    progress_tx: Option<broadcast::Sender<ProgressUpdate>>,
}

impl<T: Transport> JobRunner<T> {
    pub fn new(
        transport: Arc<T>,
        config: Arc<PipelineConfig>,
        registry: SessionRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            registry,
            cancel,
            progress_tx: None,
        }
    }

    /// Publish upload progress on `tx`
    pub fn with_progress(mut self, tx: broadcast::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Run the job
    ///
    /// Never fails: per-group errors are reported and recorded in the
    /// returned [`JobReport`].
    pub async fn run(self, spec: JobSpec) -> JobReport {
        let lease = WorkspaceLease::new(
            self.registry.clone(),
            spec.user,
            spec.session_id,
            spec.work_dir.clone(),
        );
        let mut report = JobReport::new(&spec);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = ArchivistMetrics::global() {
            metrics.record_job_started();
        }

        let groups = group_files(
            &spec.files,
            self.config.max_archive_size,
            self.config.max_files_per_archive,
        );
        info!(
            user = %spec.user,
            job_id = %spec.job_id,
            files = spec.files.len(),
            groups = groups.len(),
            format = %spec.format,
            "archive job started"
        );
        self.say(
            spec.user,
            &format!(
                "Starting to archive {} files into {} archives...",
                spec.files.len(),
                groups.len()
            ),
        )
        .await;

        let codec: Arc<dyn ArchiveCodec> = Arc::from(spec.format.codec());
        for (i, group) in groups.iter().enumerate() {
            match self.process_group(&spec, codec.clone(), i + 1, group).await {
                Ok(outcome) => report.groups.push(outcome),
                Err(_) => {
                    report.cancelled = true;
                    break;
                }
            }
        }
        report.finished_at = Some(Utc::now());

        if report.cancelled {
            info!(user = %spec.user, job_id = %spec.job_id, "archive job cancelled");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = ArchivistMetrics::global() {
                metrics.record_job_cancelled();
            }
            // No-op unless the entry is still ours; the canceller deletes the directory
            lease.release().await;
            return report;
        }

        lease.release().await;
        info!(
            user = %spec.user,
            job_id = %spec.job_id,
            delivered = report.delivered(),
            failed = report.failed(),
            "archive job finished"
        );
        self.say(spec.user, &report.summary()).await;
        report
    }

    /// Build, verify, split and upload one group
    ///
    /// # Errors
    /// * `ArchivistError::Cancelled` - Only; every other failure is folded
    ///   into the returned outcome
    async fn process_group(
        &self,
        spec: &JobSpec,
        codec: Arc<dyn ArchiveCodec>,
        index: usize,
        group: &FileGroup,
    ) -> Result<GroupOutcome> {
        self.check_cancelled()?;

        let archive_name = spec.archive_name(index);
        let archive_path = spec.work_dir.join(&archive_name);
        let outcome = |status| GroupOutcome {
            index,
            archive_name: archive_name.clone(),
            files: group.len(),
            status,
        };

        debug!(user = %spec.user, archive = %archive_name, files = group.len(), bytes = group.total_size, "building archive");
        #[cfg(feature = "metrics")]
        let timer = StepTimer::start();

        let build = {
            let codec = codec.clone();
            let files = group.paths();
            let output = archive_path.clone();
            let password = spec.password.clone();
            let cancel = self.cancel.clone();
            self.blocking(move || codec.build_cancellable(&files, &output, password.as_deref(), &cancel))
                .await
        };
        if let Err(e) = build {
            let status = self.group_failed(spec, &archive_name, &archive_path, Stage::Build, e).await?;
            return Ok(outcome(status));
        }

        let verify = {
            let archive = archive_path.clone();
            let password = spec.password.clone();
            self.blocking(move || codec.verify(&archive, password.as_deref()))
                .await
        };
        let verify = verify.and_then(|entries| {
            if entries == group.len() {
                Ok(())
            } else {
                Err(ArchivistError::verify(
                    &archive_name,
                    format!("expected {} entries, found {entries}", group.len()),
                ))
            }
        });
        if let Err(e) = verify {
            let status = self.group_failed(spec, &archive_name, &archive_path, Stage::Verify, e).await?;
            return Ok(outcome(status));
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = ArchivistMetrics::global() {
            let size = std::fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
            metrics.record_archive_built(size, timer.elapsed());
        }
        info!(user = %spec.user, archive = %archive_name, "archive verified");
        self.say(spec.user, &format!("Archive {archive_name} created and verified."))
            .await;

        let parts = match self
            .cancellable(split_if_oversized(&archive_path, self.config.split_size))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                let status = self.group_failed(spec, &archive_name, &archive_path, Stage::Split, e).await?;
                return Ok(outcome(status));
            }
        };

        let status = self.upload_parts(spec, &parts).await?;
        Ok(outcome(status))
    }

    /// Upload parts in order; a failed part does not stop the others
    async fn upload_parts(&self, spec: &JobSpec, parts: &[PathBuf]) -> Result<GroupStatus> {
        self.registry
            .set_state(spec.user, spec.session_id, SessionState::Uploading);

        let mut delivered = 0usize;
        let mut bytes = 0u64;
        let mut failures = Vec::new();

        for part in parts {
            self.check_cancelled()?;
            let name = file_name(part);
            let size = tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);

            self.say(spec.user, &format!("Starting upload of {name}...")).await;
            let mut progress = Progress::publishing(
                self.config.progress_interval(),
                spec.user,
                TransferKind::Upload,
                name.clone(),
                self.progress_tx.clone(),
            );

            #[cfg(feature = "metrics")]
            let timer = StepTimer::start();
            let result = self
                .cancellable(self.transport.upload(spec.user, part, &mut progress))
                .await;

            match result {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = ArchivistMetrics::global() {
                        metrics.record_upload(timer.elapsed());
                    }
                    if let Err(e) = tokio::fs::remove_file(part).await {
                        warn!(user = %spec.user, part = %name, error = %e, "failed to delete uploaded part");
                    }
                    delivered += 1;
                    bytes += size;
                    self.say(spec.user, &format!("Upload of {name} completed.")).await;
                }
                Err(ArchivistError::Cancelled) => return Err(ArchivistError::Cancelled),
                Err(e) => {
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = ArchivistMetrics::global() {
                        metrics.record_upload_error(timer.elapsed());
                    }
                    error!(user = %spec.user, part = %name, error = %e, "upload failed");
                    let e = match e {
                        ArchivistError::Upload(_) => e,
                        other => ArchivistError::upload(other.to_string()),
                    };
                    self.say(spec.user, &e.to_string()).await;
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        self.registry
            .set_state(spec.user, spec.session_id, SessionState::Archiving);

        if failures.is_empty() {
            Ok(GroupStatus::Delivered {
                parts: delivered,
                bytes,
            })
        } else {
            Ok(GroupStatus::Failed {
                stage: Stage::Upload,
                reason: failures.join("; "),
            })
        }
    }

    /// Report a failed group and discard its partial archive
    ///
    /// Passes `Cancelled` through unchanged.
    async fn group_failed(
        &self,
        spec: &JobSpec,
        archive_name: &str,
        archive_path: &Path,
        stage: Stage,
        err: ArchivistError,
    ) -> Result<GroupStatus> {
        if err.is_cancelled() {
            return Err(err);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = ArchivistMetrics::global() {
            metrics.record_archive_failure();
        }
        error!(user = %spec.user, archive = %archive_name, stage = %stage, error = %err, "archive failed");

        if let Err(e) = tokio::fs::remove_file(archive_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(user = %spec.user, archive = %archive_name, error = %e, "failed to remove partial archive");
            }
        }

        let reason = match &err {
            ArchivistError::ArchiveBuild { reason, .. } | ArchivistError::ArchiveVerify { reason, .. } => {
                reason.clone()
            }
            other => other.to_string(),
        };
        self.say(spec.user, &format!("Error with archive {archive_name}: {reason}"))
            .await;

        Ok(GroupStatus::Failed { stage, reason })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ArchivistError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Race `fut` against the job's cancellation token
    async fn cancellable<F, R>(&self, fut: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ArchivistError::Cancelled),
            result = fut => result,
        }
    }

    /// Run blocking codec work off the runtime, cancellable
    ///
    /// A cancelled call stops waiting immediately. Builds watch the same
    /// token and stop at their next source read; a verify runs to the end and
    /// its result is discarded.
    async fn blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(f);
        self.cancellable(async move {
            handle
                .await
                .map_err(|e| ArchivistError::session(format!("archive worker failed: {e}")))?
        })
        .await
    }

    /// Best-effort status message, skipped once the job is cancelled
    async fn say(&self, user: UserId, text: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.transport.notify(user, text) => {}
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
