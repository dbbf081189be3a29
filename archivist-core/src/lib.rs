/*!
# Archivist Core Engine

Per-user archive pipeline for a chat-driven file archiver.

A user picks a container format (7z, zip or tar), a base filename and, for
formats that support it, a password. The files they send are staged in a
private working directory. On "done" a background job:

- groups the files under a byte cap and a file-count cap
- builds one archive per group and re-opens it to verify it
- splits archives larger than the transfer limit into numbered parts
- uploads every part and reports progress and results to the user

## Architecture

- [`session`] holds the conversation state machine and the shared registry
- [`job`] runs the build/verify/split/upload pipeline
- [`archive`] and [`transport`] are the two ports; codecs and transports are
  adapters behind traits

## Usage

```rust,no_run
use archivist_core::{FileRef, LocalTransport, PipelineConfig, SessionManager, UserId};

# async fn run() -> archivist_core::Result<()> {
let manager = SessionManager::new(PipelineConfig::default(), LocalTransport::new("./outbox"));
let user = UserId(42);

manager.start(user).await?;
manager.handle_text(user, "zip").await;
manager.handle_text(user, "docs").await;
manager.handle_text(user, "secret").await;
manager.handle_file(user, &FileRef::new("/data/report.pdf")).await;
manager.done(user).await;

let report = manager.wait(user).await;
# Ok(())
# }
```
*/

pub mod archive;
pub mod config;
pub mod error;
pub mod grouper;
pub mod job;
pub mod observability;
pub mod session;
pub mod splitter;
pub mod transport;

#[cfg(test)]
mod error_tests;

pub use archive::{ArchiveCodec, ArchiveFormat, SevenZipCodec, TarCodec, ZipCodec};
pub use config::PipelineConfig;
pub use error::{ArchivistError, Result};
pub use grouper::{group_files, FileGroup, StagedFile};
pub use job::{GroupOutcome, GroupStatus, JobReport, JobRunner, JobSpec, Stage, WorkspaceLease};
pub use session::{
    EventOutcome, InboundEvent, SessionManager, SessionRegistry, SessionState, UserId, UserSession,
};
pub use splitter::{join_parts, part_path, split_file, split_if_oversized};
pub use transport::{FileRef, LocalTransport, Progress, ProgressUpdate, TransferKind, Transport};
