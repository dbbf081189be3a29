/*!
Archivist CLI - Command-line interface for the Archivist archive pipeline.

Runs one archive session locally (files in, archives out to an outbox
directory) and provides standalone tools to verify archives and to split or
rejoin oversized ones.
*/

use anyhow::{bail, Context};
use archivist_core::{
    config::DEFAULT_SPLIT_SIZE, join_parts, observability, split_file, ArchiveFormat,
    EventOutcome, FileRef, GroupStatus, JobReport, LocalTransport, PipelineConfig, SessionManager,
    UserId,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

/// User id under which local sessions run
const LOCAL_USER: UserId = UserId(0);

#[derive(Parser)]
#[command(name = "archivist")]
#[command(about = "Archive, verify, split and deliver files")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "ARCHIVIST_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive files, verify the archives and deliver them to an outbox
    Pack {
        /// Archive format: 7z, zip or tar
        #[arg(short, long)]
        format: ArchiveFormat,
        /// Base name of the archives (NAME_1.zip, NAME_2.zip, ...)
        #[arg(short, long)]
        name: String,
        /// Password for 7z and zip archives
        #[arg(short, long, env = "ARCHIVIST_PASSWORD")]
        password: Option<String>,
        /// Directory receiving the finished archives
        #[arg(short, long, default_value = "./outbox")]
        outbox: PathBuf,
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Root of the per-user working directories
        #[arg(long, env = "ARCHIVIST_WORK_DIR")]
        work_dir: Option<PathBuf>,
        /// Split archives larger than this many bytes
        #[arg(long)]
        split_size: Option<u64>,
        /// Byte cap of one archive group
        #[arg(long)]
        max_archive_size: Option<u64>,
        /// File count cap of one archive group
        #[arg(long)]
        max_files: Option<usize>,
        /// Print the job report as JSON instead of a table
        #[arg(long)]
        json: bool,
        /// Print Prometheus metrics after the job
        #[arg(long)]
        metrics: bool,
        /// Files to archive
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Verify an archive by reading every entry
    Verify {
        /// Archive to check
        archive: PathBuf,
        /// Password used when the archive was built
        #[arg(short, long, env = "ARCHIVIST_PASSWORD")]
        password: Option<String>,
        /// Format, when it cannot be inferred from the extension
        #[arg(short, long)]
        format: Option<ArchiveFormat>,
    },
    /// Split a file into numbered .partNNN chunks
    Split {
        /// File to split (removed afterwards)
        file: PathBuf,
        /// Chunk size in bytes
        #[arg(short, long, default_value_t = DEFAULT_SPLIT_SIZE)]
        size: u64,
    },
    /// Reassemble parts produced by `split`
    Join {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Parts in order
        #[arg(required = true)]
        parts: Vec<PathBuf>,
    },
}

#[derive(Tabled)]
struct GroupRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Archive")]
    archive: String,
    #[tabled(rename = "Files")]
    files: usize,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Details")]
    details: String,
}

#[derive(Tabled)]
struct PartRow {
    #[tabled(rename = "Part")]
    part: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    match cli.command {
        Commands::Pack {
            format,
            name,
            password,
            outbox,
            config,
            work_dir,
            split_size,
            max_archive_size,
            max_files,
            json,
            metrics,
            files,
        } => {
            let mut pipeline = match config {
                Some(path) => PipelineConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => PipelineConfig::from_env()?,
            };
            if let Some(dir) = work_dir {
                pipeline.work_root = dir;
            }
            if let Some(size) = split_size {
                pipeline.split_size = size;
            }
            if let Some(size) = max_archive_size {
                pipeline.max_archive_size = size;
            }
            if let Some(count) = max_files {
                pipeline.max_files_per_archive = count;
            }
            pipeline.validate()?;

            let report = pack(pipeline, format, &name, password, outbox, files).await?;
            print_report(&report, json)?;
            if metrics {
                print_metrics();
            }
            if !report.is_success() {
                bail!("{} of {} archives failed", report.failed(), report.groups.len());
            }
        }
        Commands::Verify {
            archive,
            password,
            format,
        } => verify_archive(&archive, password.as_deref(), format).await?,
        Commands::Split { file, size } => split(&file, size).await?,
        Commands::Join { output, parts } => {
            let bytes = join_parts(&parts, &output).await?;
            println!(
                "✓ Joined {} parts into {} ({})",
                parts.len(),
                output.display(),
                format_size(bytes)
            );
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    if json {
        observability::init_observability(true)?;
        return Ok(());
    }

    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

/// Run one session end to end: the same events a chat user would send
async fn pack(
    config: PipelineConfig,
    format: ArchiveFormat,
    name: &str,
    password: Option<String>,
    outbox: PathBuf,
    files: Vec<PathBuf>,
) -> Result<JobReport, anyhow::Error> {
    let transport = LocalTransport::new(&outbox).with_echo(true);
    let manager = SessionManager::new(config, transport);
    let user = LOCAL_USER;

    manager.start(user).await?;
    expect_accepted(manager.handle_text(user, format.extension()).await)?;
    expect_accepted(manager.handle_text(user, name).await)?;

    if format.requires_password() {
        let Some(password) = password else {
            manager.cancel(user).await;
            bail!("--password is required for {format} archives");
        };
        expect_accepted(manager.handle_text(user, &password).await)?;
    } else if password.is_some() {
        warn!("{format} archives cannot be encrypted; ignoring --password");
    }

    for path in &files {
        let source = FileRef::new(path.to_string_lossy());
        if let EventOutcome::Rejected(reason) = manager.handle_file(user, &source).await {
            error!(file = %path.display(), "{reason}");
        }
    }

    if let EventOutcome::Rejected(reason) = manager.done(user).await {
        manager.cancel(user).await;
        bail!(reason);
    }

    let report = tokio::select! {
        report = manager.wait(user) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; cancelling job");
            manager.cancel(user).await;
            None
        }
    };

    let report = report.context("archive job did not produce a report")?;
    info!(
        job_id = %report.job_id,
        outbox = %outbox.join(user.to_string()).display(),
        "job complete"
    );
    Ok(report)
}

fn expect_accepted(outcome: EventOutcome) -> Result<(), anyhow::Error> {
    match outcome {
        EventOutcome::Accepted(_) => Ok(()),
        EventOutcome::Rejected(reason) => bail!(reason),
        EventOutcome::Ignored => bail!("session is not accepting input"),
    }
}

fn print_report(report: &JobReport, json: bool) -> Result<(), anyhow::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let rows: Vec<GroupRow> = report
        .groups
        .iter()
        .map(|group| {
            let (status, details) = match &group.status {
                GroupStatus::Delivered { parts, bytes } => (
                    "✓ delivered".to_string(),
                    format!("{parts} part(s), {}", format_size(*bytes)),
                ),
                GroupStatus::Failed { stage, reason } => {
                    (format!("✗ {stage} failed"), reason.clone())
                }
            };
            GroupRow {
                index: group.index,
                archive: group.archive_name.clone(),
                files: group.files,
                status,
                details,
            }
        })
        .collect();

    println!("{}", Table::new(rows));
    let elapsed = report
        .finished_at
        .map(|end| (end - report.started_at).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    println!(
        "Job {} started {}: {} ({elapsed:.1}s)",
        report.job_id,
        format_timestamp(report.started_at),
        report.summary()
    );
    Ok(())
}

fn print_metrics() {
    match archivist_core::observability::ArchivistMetrics::global().map(|m| m.gather_metrics()) {
        Some(Ok(text)) => println!("{text}"),
        Some(Err(e)) => warn!("Failed to gather metrics: {}", e),
        None => warn!("Metrics are not available"),
    }
}

async fn verify_archive(
    archive: &Path,
    password: Option<&str>,
    format: Option<ArchiveFormat>,
) -> Result<(), anyhow::Error> {
    let format = format
        .or_else(|| ArchiveFormat::from_path(archive))
        .with_context(|| format!("cannot infer format of {}; pass --format", archive.display()))?;
    info!("Verifying {} as {}", archive.display(), format);

    let path = archive.to_path_buf();
    let password = password.map(str::to_owned);
    let result =
        tokio::task::spawn_blocking(move || format.codec().verify(&path, password.as_deref()))
            .await?;

    match result {
        Ok(entries) => {
            println!("✓ {} is valid ({entries} entries)", archive.display());
            Ok(())
        }
        Err(e) => {
            error!("✗ {}", e);
            Err(e.into())
        }
    }
}

async fn split(file: &Path, size: u64) -> Result<(), anyhow::Error> {
    let parts = split_file(file, size).await?;

    let rows: Vec<PartRow> = parts
        .iter()
        .map(|part| PartRow {
            part: part.display().to_string(),
            size: std::fs::metadata(part)
                .map(|m| format_size(m.len()))
                .unwrap_or_else(|_| "Unknown".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
