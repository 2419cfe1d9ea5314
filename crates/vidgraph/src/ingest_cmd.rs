//! CLI commands for uploads and jobs: `ingest`, `status`, `jobs`, `extract`.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use vidgraph_core::models::{StagedFile, UploadJob, UploadMeta};

use crate::config::Config;
use crate::extraction::ExtractionWorker;
use crate::receiver::{file_stream, normalize_content_type};
use crate::services::Services;

/// Upper bound for `ingest --wait`.
const WAIT_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Content type implied by a file extension.
pub fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" | "qt" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "ogv" | "ogg" => "video/ogg",
        _ => return None,
    };
    Some(content_type)
}

fn resolve_content_type(path: &Path, explicit: Option<&str>) -> Result<String> {
    match explicit {
        Some(ct) => Ok(ct.to_string()),
        None => match guess_content_type(path) {
            Some(ct) => Ok(ct.to_string()),
            None => bail!(
                "Cannot infer a content type for {}; pass --content-type",
                path.display()
            ),
        },
    }
}

fn print_job(job: &UploadJob) {
    println!("id:           {}", job.id);
    println!("status:       {}", job.status);
    println!("filename:     {}", job.source_filename);
    println!("content_type: {}", job.content_type);
    println!("size_bytes:   {}", job.size_bytes);
    if let Some(ref hash) = job.content_hash {
        println!("content_hash: {}", hash);
    }
    println!("attempts:     {}", job.attempts);
    println!("created_at:   {}", job.created_at.format("%Y-%m-%dT%H:%M:%SZ"));
    println!("updated_at:   {}", job.updated_at.format("%Y-%m-%dT%H:%M:%SZ"));
    if let Some(ref err) = job.last_error {
        println!("error:        {} ({})", err.message, err.kind);
    }
}

/// `vidgraph ingest <file>`.
///
/// Without `--wait` the file is only staged: no pipeline is started, the
/// job stays STAGED and the next `vidgraph serve` runs it.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    content_type: Option<&str>,
    wait: bool,
) -> Result<()> {
    let content_type = resolve_content_type(path, content_type)?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let size = file.metadata().await?.len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let services = Services::open(config).await?;
    let meta = UploadMeta {
        filename,
        content_type,
        declared_size: Some(size),
    };

    // Without --wait nothing would outlive this process to run the
    // pipeline, so the job is only staged.
    let submitted = if wait {
        services.coordinator.submit(file_stream(file), meta).await
    } else {
        services.coordinator.stage(file_stream(file), meta).await
    };
    let submission = match submitted {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {} ({})", e, e.kind());
            std::process::exit(1);
        }
    };

    if submission.deduplicated {
        println!("Content already being ingested by job {}", submission.job_id);
    } else {
        println!("Submitted job {} ({})", submission.job_id, submission.status);
    }

    if wait {
        let job = services
            .coordinator
            .wait(&submission.job_id, WAIT_LIMIT)
            .await?;
        println!();
        print_job(&job);
        services.close().await;
        if job.last_error.is_some() {
            std::process::exit(1);
        }
    } else {
        services.close().await;
    }
    Ok(())
}

/// `vidgraph status <id>`.
pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let job = services.coordinator.status(id).await?;
    services.close().await;

    match job {
        Some(job) => {
            print_job(&job);
            Ok(())
        }
        None => {
            eprintln!("Error: job not found: {}", id);
            std::process::exit(1);
        }
    }
}

/// `vidgraph jobs`: most recent first.
pub async fn run_jobs(config: &Config, limit: usize) -> Result<()> {
    let services = Services::open(config).await?;
    let jobs = services.coordinator.list(limit).await?;
    services.close().await;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:>12}  FILENAME", "ID", "STATUS", "BYTES");
    for job in &jobs {
        let error = job
            .last_error
            .as_ref()
            .map(|e| format!("  [{}]", e.kind))
            .unwrap_or_default();
        println!(
            "{:<36}  {:<10}  {:>12}  {}{}",
            job.id,
            job.status.as_str(),
            job.size_bytes,
            job.source_filename,
            error
        );
    }
    Ok(())
}

/// `vidgraph extract <file>`: run the configured extractor on a local file
/// and print the delta as JSON without staging or writing anything.
pub async fn run_extract(config: &Config, path: &Path, content_type: Option<&str>) -> Result<()> {
    let content_type = resolve_content_type(path, content_type)
        .unwrap_or_else(|_| "application/octet-stream".to_string());
    let size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?
        .len();

    let staged = StagedFile {
        content_hash: "0".repeat(64),
        path: path.to_path_buf(),
        size_bytes: size,
        content_type: normalize_content_type(&content_type),
    };

    let worker = ExtractionWorker::from_config(config);
    match worker.extract(&staged).await {
        Ok(delta) => {
            println!("{}", serde_json::to_string_pretty(&delta)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {} ({})", e, e.kind());
            std::process::exit(1);
        }
    }
}
