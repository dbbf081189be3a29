/*!
Per-user conversational state machine.

Each user has at most one [`UserSession`] collecting an archive format, a
base filename, an optional password and a list of staged files. The
[`SessionManager`] drives those sessions from inbound events, owns the
shared [`SessionRegistry`], and hands a finished session to a background
[`JobRunner`].

```text
IDLE --start--> WAITING_FOR_FORMAT --valid format--> WAITING_FOR_FILENAME
WAITING_FOR_FILENAME --name (7z/zip)--> WAITING_FOR_PASSWORD --password--> WAITING_FOR_FILES
WAITING_FOR_FILENAME --name (tar)--> WAITING_FOR_FILES
WAITING_FOR_FILES --file--> WAITING_FOR_FILES
WAITING_FOR_FILES --done (files > 0)--> ARCHIVING <--> UPLOADING
any non-IDLE --cancel--> IDLE
```
*/

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::ArchiveFormat;
use crate::config::PipelineConfig;
use crate::grouper::StagedFile;
use crate::job::{JobReport, JobRunner, JobSpec};
use crate::transport::{FileRef, Progress, ProgressUpdate, TransferKind, Transport};
use crate::{ArchivistError, Result};

/// Progress updates buffered per subscriber
pub const PROGRESS_CAPACITY: usize = 64;

pub(crate) const PROMPT_FORMAT: &str = "Select archive format: 7z, zip, or tar.";
pub(crate) const INVALID_FORMAT: &str = "Invalid format. Choose 7z, zip, or tar.";
pub(crate) const PROMPT_FILENAME: &str = "Provide a custom filename for the archive (e.g., myarchive).";
pub(crate) const INVALID_FILENAME: &str =
    "Invalid filename. Use a plain name without slashes (e.g., myarchive).";
pub(crate) const PROMPT_PASSWORD: &str = "Provide a password for the archive.";
pub(crate) const EMPTY_PASSWORD: &str = "Password must not be empty.";
pub(crate) const TAR_NO_PASSWORD: &str =
    "Password protection is not available for tar. Send your files now.";
pub(crate) const PROMPT_FILES: &str = "Send your files now.";
pub(crate) const DOWNLOAD_STARTED: &str = "Starting download...";
pub(crate) const DOWNLOAD_COMPLETED: &str = "Download completed.";
pub(crate) const NO_FILES: &str = "No files received.";
pub(crate) const ARCHIVING_STARTED: &str = "Archiving started...";
pub(crate) const JOB_RUNNING: &str =
    "An archive job is already running. Send /cancel to stop it first.";
pub(crate) const CANCELLED: &str = "Operation cancelled.";
pub(crate) const NOTHING_TO_CANCEL: &str = "No operation to cancel.";

/// Messaging-platform user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Conversation state of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    WaitingForFormat,
    WaitingForFilename,
    WaitingForPassword,
    WaitingForFiles,
    Archiving,
    Uploading,
}

impl SessionState {
    /// Whether a background job owns the session
    pub fn is_job_running(&self) -> bool {
        matches!(self, Self::Archiving | Self::Uploading)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::WaitingForFormat => "WAITING_FOR_FORMAT",
            Self::WaitingForFilename => "WAITING_FOR_FILENAME",
            Self::WaitingForPassword => "WAITING_FOR_PASSWORD",
            Self::WaitingForFiles => "WAITING_FOR_FILES",
            Self::Archiving => "ARCHIVING",
            Self::Uploading => "UPLOADING",
        };
        f.write_str(name)
    }
}

/// Result of feeding one event to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event was consumed; the text is the reply sent to the user
    Accepted(String),
    /// The event was refused; state is unchanged and the text explains why
    Rejected(String),
    /// The event does not apply to the current state
    Ignored,
}

impl EventOutcome {
    pub fn accepted<S: Into<String>>(text: S) -> Self {
        Self::Accepted(text.into())
    }

    pub fn rejected<S: Into<String>>(text: S) -> Self {
        Self::Rejected(text.into())
    }

    /// Reply text, if the outcome carries one
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Accepted(text) | Self::Rejected(text) => Some(text),
            Self::Ignored => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Inbound event delivered by the messaging layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Start,
    Text(String),
    File(FileRef),
    Done,
    Cancel,
}

/// Cancellation handle of the job attached to a session
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

/// All per-user data for one archive request
#[derive(Debug, Clone)]
pub struct UserSession {
    pub id: Uuid,
    pub user: UserId,
    pub state: SessionState,
    pub format: Option<ArchiveFormat>,
    pub filename: Option<String>,
    pub password: Option<String>,
    pub files: Vec<StagedFile>,
    pub total_size: u64,
    pub work_dir: PathBuf,
    pub job: Option<JobHandle>,
}

impl UserSession {
    pub fn new(user: UserId, work_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            state: SessionState::Idle,
            format: None,
            filename: None,
            password: None,
            files: Vec::new(),
            total_size: 0,
            work_dir,
            job: None,
        }
    }

    /// Begin collecting a new request
    pub fn open(&mut self) -> EventOutcome {
        if self.state != SessionState::Idle {
            return EventOutcome::Ignored;
        }
        self.state = SessionState::WaitingForFormat;
        EventOutcome::accepted(PROMPT_FORMAT)
    }

    /// Apply a plain text message to the session
    pub fn apply_text(&mut self, text: &str) -> EventOutcome {
        match self.state {
            SessionState::WaitingForFormat => match ArchiveFormat::parse(text) {
                Some(format) => {
                    self.format = Some(format);
                    self.state = SessionState::WaitingForFilename;
                    EventOutcome::accepted(PROMPT_FILENAME)
                }
                None => EventOutcome::rejected(INVALID_FORMAT),
            },
            SessionState::WaitingForFilename => {
                if let Err(e) = validate_filename(text) {
                    debug!(user = %self.user, error = %e, "filename rejected");
                    return EventOutcome::rejected(INVALID_FILENAME);
                }
                self.filename = Some(text.to_string());
                if self.format.is_some_and(|f| f.requires_password()) {
                    self.state = SessionState::WaitingForPassword;
                    EventOutcome::accepted(PROMPT_PASSWORD)
                } else {
                    self.state = SessionState::WaitingForFiles;
                    EventOutcome::accepted(TAR_NO_PASSWORD)
                }
            }
            SessionState::WaitingForPassword => {
                if text.is_empty() {
                    return EventOutcome::rejected(EMPTY_PASSWORD);
                }
                self.password = Some(text.to_string());
                self.state = SessionState::WaitingForFiles;
                EventOutcome::accepted(PROMPT_FILES)
            }
            _ => EventOutcome::Ignored,
        }
    }

    /// Record a staged file; only valid while collecting files
    pub fn add_file(&mut self, file: StagedFile) -> bool {
        if self.state != SessionState::WaitingForFiles {
            return false;
        }
        self.total_size += file.size;
        self.files.push(file);
        true
    }

    /// Move to `ARCHIVING` and produce the job description
    ///
    /// # Errors
    /// * `ArchivistError::InputValidation` - If no files were received
    /// * `ArchivistError::Session` - If the session is not collecting files
    pub fn start_archiving(&mut self, cancel: CancellationToken) -> Result<JobSpec> {
        if self.state != SessionState::WaitingForFiles {
            return Err(ArchivistError::session(format!(
                "cannot start archiving from {}",
                self.state
            )));
        }
        if self.files.is_empty() {
            return Err(ArchivistError::validation(NO_FILES));
        }
        let (Some(format), Some(filename)) = (self.format, self.filename.clone()) else {
            return Err(ArchivistError::session("format or filename missing"));
        };

        let job_id = Uuid::new_v4();
        self.state = SessionState::Archiving;
        self.job = Some(JobHandle { id: job_id, cancel });

        Ok(JobSpec {
            job_id,
            session_id: self.id,
            user: self.user,
            format,
            filename,
            password: self.password.clone(),
            files: self.files.clone(),
            work_dir: self.work_dir.clone(),
        })
    }
}

/// Check a user-supplied archive base name
///
/// The name is used verbatim as a path component, so it must be non-empty
/// and must not contain separators or be a relative directory reference.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ArchivistError::validation("filename must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(ArchivistError::validation(format!(
            "filename '{name}' must not contain path separators"
        )));
    }
    if name == "." || name == ".." {
        return Err(ArchivistError::validation(format!("filename '{name}' is reserved")));
    }
    Ok(())
}

/// Shared map of active sessions
///
/// Every read-modify-write happens under one short-lived lock; the lock is
/// never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<UserId, UserSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, UserSession>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a session, returning the one it replaces
    pub fn insert(&self, session: UserSession) -> Option<UserSession> {
        self.lock().insert(session.user, session)
    }

    pub fn remove(&self, user: UserId) -> Option<UserSession> {
        self.lock().remove(&user)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.lock().contains_key(&user)
    }

    /// Current state; a user without a session is `IDLE`
    pub fn state(&self, user: UserId) -> SessionState {
        self.lock()
            .get(&user)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Snapshot of a user's session
    pub fn get(&self, user: UserId) -> Option<UserSession> {
        self.lock().get(&user).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `f` against the user's session, if any
    pub fn with_session<R>(&self, user: UserId, f: impl FnOnce(&mut UserSession) -> R) -> Option<R> {
        self.lock().get_mut(&user).map(f)
    }

    /// Run `f` only if the user's current session is `session_id`
    pub fn with_owned_session<R>(
        &self,
        user: UserId,
        session_id: Uuid,
        f: impl FnOnce(&mut UserSession) -> R,
    ) -> Option<R> {
        self.lock()
            .get_mut(&user)
            .filter(|s| s.id == session_id)
            .map(f)
    }

    /// Set the state of session `session_id`; false if it is gone
    pub fn set_state(&self, user: UserId, session_id: Uuid, state: SessionState) -> bool {
        self.with_owned_session(user, session_id, |s| s.state = state)
            .is_some()
    }

    /// Remove session `session_id` if it is still the user's session
    pub fn finish(&self, user: UserId, session_id: Uuid) -> Option<UserSession> {
        let mut sessions = self.lock();
        if sessions.get(&user).is_some_and(|s| s.id == session_id) {
            sessions.remove(&user)
        } else {
            None
        }
    }
}

/// Drives user sessions from inbound events
///
/// # Example
/// ```rust,no_run
/// use archivist_core::{LocalTransport, PipelineConfig, SessionManager, UserId};
///
/// # async fn run() -> archivist_core::Result<()> {
/// let manager = SessionManager::new(PipelineConfig::default(), LocalTransport::new("./outbox"));
/// let user = UserId(42);
/// manager.start(user).await?;
/// manager.handle_text(user, "zip").await;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager<T: Transport> {
    config: Arc<PipelineConfig>,
    transport: Arc<T>,
    registry: SessionRegistry,
    tasks: Mutex<HashMap<UserId, JoinHandle<JobReport>>>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(config: PipelineConfig, transport: T) -> Self {
        Self::with_shared(Arc::new(config), Arc::new(transport))
    }

    pub fn with_shared(config: Arc<PipelineConfig>, transport: Arc<T>) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            config,
            transport,
            registry: SessionRegistry::new(),
            tasks: Mutex::new(HashMap::new()),
            progress_tx,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Current state of a user's conversation
    pub fn state(&self, user: UserId) -> SessionState {
        self.registry.state(user)
    }

    /// Subscribe to throttled transfer progress
    ///
    /// Updates are only kept for live subscribers, and a subscriber that
    /// falls more than [`PROGRESS_CAPACITY`] updates behind skips the oldest.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<UserId, JoinHandle<JobReport>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch one inbound event
    pub async fn handle(&self, user: UserId, event: InboundEvent) -> Result<EventOutcome> {
        match event {
            InboundEvent::Start => self.start(user).await,
            InboundEvent::Text(text) => Ok(self.handle_text(user, &text).await),
            InboundEvent::File(file) => Ok(self.handle_file(user, &file).await),
            InboundEvent::Done => Ok(self.done(user).await),
            InboundEvent::Cancel => Ok(self.cancel(user).await),
        }
    }

    async fn reply(&self, user: UserId, outcome: EventOutcome) -> EventOutcome {
        if let Some(text) = outcome.reply() {
            self.transport.notify(user, text).await;
        }
        outcome
    }

    /// Open a new session for `user`
    ///
    /// A session still in setup is discarded and replaced. A session whose
    /// job is running is left alone.
    ///
    /// # Errors
    /// * `ArchivistError::Io` - If the working directory cannot be created
    pub async fn start(&self, user: UserId) -> Result<EventOutcome> {
        if self.registry.state(user).is_job_running() {
            return Ok(self.reply(user, EventOutcome::rejected(JOB_RUNNING)).await);
        }

        let work_dir = self.config.user_dir(user);
        if let Some(previous) = self.registry.remove(user) {
            info!(user = %user, session = %previous.id, state = %previous.state, "discarding unfinished session");
            remove_work_dir(&previous.work_dir).await;
        }
        tokio::fs::create_dir_all(&work_dir).await?;

        let mut session = UserSession::new(user, work_dir);
        let outcome = session.open();
        info!(user = %user, session = %session.id, "session started");
        self.registry.insert(session);

        Ok(self.reply(user, outcome).await)
    }

    /// Feed a text message to the user's session
    pub async fn handle_text(&self, user: UserId, text: &str) -> EventOutcome {
        let outcome = self
            .registry
            .with_session(user, |s| {
                let before = s.state;
                let outcome = s.apply_text(text);
                if s.state != before {
                    debug!(user = %user, from = %before, to = %s.state, "session advanced");
                }
                outcome
            })
            .unwrap_or(EventOutcome::Ignored);
        self.reply(user, outcome).await
    }

    /// Download and stage one inbound file
    ///
    /// The registry lock is released while the download runs. A download
    /// finishing after its session was cancelled or replaced is discarded.
    pub async fn handle_file(&self, user: UserId, file: &FileRef) -> EventOutcome {
        let target = self.registry.with_session(user, |s| {
            (s.state == SessionState::WaitingForFiles).then(|| (s.id, s.work_dir.clone()))
        });
        let Some(Some((session_id, work_dir))) = target else {
            return EventOutcome::Ignored;
        };

        self.transport.notify(user, DOWNLOAD_STARTED).await;
        let name = file.name.clone().unwrap_or_else(|| file.id.clone());
        let mut progress = Progress::publishing(
            self.config.progress_interval(),
            user,
            TransferKind::Download,
            name,
            Some(self.progress_tx.clone()),
        );

        let staged = match self.transport.download(file, &work_dir, &mut progress).await {
            Ok(path) => stage(&path, &work_dir).await,
            Err(e) => Err(e),
        };
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                error!(user = %user, file = %file.id, error = %e, "download failed");
                let text = match e {
                    ArchivistError::Download(_) => e.to_string(),
                    other => ArchivistError::download(other.to_string()).to_string(),
                };
                return self.reply(user, EventOutcome::rejected(text)).await;
            }
        };

        let path = staged.path.clone();
        let accepted = self
            .registry
            .with_owned_session(user, session_id, |s| s.add_file(staged))
            .unwrap_or(false);

        if accepted {
            debug!(user = %user, path = %path.display(), "file staged");
            self.reply(user, EventOutcome::accepted(DOWNLOAD_COMPLETED)).await
        } else {
            info!(user = %user, path = %path.display(), "discarding download for inactive session");
            let _ = tokio::fs::remove_file(&path).await;
            EventOutcome::Ignored
        }
    }

    /// Close the file list and launch the archive job
    pub async fn done(&self, user: UserId) -> EventOutcome {
        let cancel = CancellationToken::new();
        let spec = self
            .registry
            .with_session(user, |s| s.start_archiving(cancel.clone()));

        let spec = match spec {
            Some(Ok(spec)) => spec,
            Some(Err(ArchivistError::InputValidation(msg))) => {
                return self.reply(user, EventOutcome::Rejected(msg)).await;
            }
            Some(Err(_)) | None => return EventOutcome::Ignored,
        };

        info!(
            user = %user,
            job = %spec.job_id,
            files = spec.files.len(),
            format = %spec.format,
            "archive job queued"
        );

        let runner = JobRunner::new(
            self.transport.clone(),
            self.config.clone(),
            self.registry.clone(),
            cancel,
        )
        .with_progress(self.progress_tx.clone());

        let outcome = self.reply(user, EventOutcome::accepted(ARCHIVING_STARTED)).await;
        let handle = tokio::spawn(runner.run(spec));
        if let Some(stale) = self.tasks().insert(user, handle) {
            debug!(user = %user, finished = stale.is_finished(), "replacing previous job handle");
        }
        outcome
    }

    /// Abort whatever the user's session is doing and discard it
    ///
    /// Waits for a running job to stop before the working directory is
    /// removed.
    pub async fn cancel(&self, user: UserId) -> EventOutcome {
        let Some(session) = self.registry.remove(user) else {
            return self.reply(user, EventOutcome::rejected(NOTHING_TO_CANCEL)).await;
        };

        if let Some(job) = &session.job {
            info!(user = %user, job = %job.id, "cancelling archive job");
            job.cancel.cancel();
            let task = self.tasks().remove(&user);
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(user = %user, error = %e, "archive job ended abnormally");
                }
            }
        }

        remove_work_dir(&session.work_dir).await;
        info!(user = %user, session = %session.id, "session cancelled");
        self.reply(user, EventOutcome::accepted(CANCELLED)).await
    }

    /// Wait for the user's most recent job and return its report
    pub async fn wait(&self, user: UserId) -> Option<JobReport> {
        let task = self.tasks().remove(&user)?;
        match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(user = %user, error = %e, "archive job ended abnormally");
                None
            }
        }
    }
}

async fn stage(path: &Path, work_dir: &Path) -> Result<StagedFile> {
    if !path.starts_with(work_dir) {
        let _ = tokio::fs::remove_file(path).await;
        return Err(ArchivistError::download(format!(
            "{} was staged outside the working directory",
            path.display()
        )));
    }
    let size = tokio::fs::metadata(path).await?.len();
    Ok(StagedFile::new(path.to_path_buf(), size))
}

pub(crate) async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "working directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove working directory"),
    }
}
