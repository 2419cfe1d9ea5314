//! Ingestion coordinator.
//!
//! Drives each upload through receive → extract → write and owns all
//! cross-job state: the job table, in-flight deduplication, the concurrency
//! limit, cancellation requests and transition notifications.
//!
//! # Job lifecycle
//!
//! ```text
//! submit ──▶ RECEIVED ──stage──▶ STAGED ──▶ EXTRACTING ──▶ WRITING ──▶ COMPLETE
//!                │                  │            │             │
//!                └──────────────────┴────────────┴─────────────┴──▶ FAILED
//! ```
//!
//! `submit` returns as soon as the upload is staged; the rest runs on a
//! spawned task. Each stage retries transient errors
//! ([`ErrorKind::is_transient`](vidgraph_core::ErrorKind::is_transient)) with
//! the configured backoff; any other error fails the job at once. A panic
//! inside a pipeline is caught and recorded as `internal`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use vidgraph_core::error::IngestError;
use vidgraph_core::models::{JobStatus, JobUpdate, StagedFile, UploadJob, UploadMeta};
use vidgraph_core::retry::RetryPolicy;
use vidgraph_core::store::JobStore;

use crate::extraction::ExtractionWorker;
use crate::receiver::UploadReceiver;
use crate::writer::GraphWriter;

/// The three pipeline components a coordinator drives.
pub struct Pipeline {
    pub receiver: UploadReceiver,
    pub worker: ExtractionWorker,
    pub writer: GraphWriter,
}

/// Result of [`Coordinator::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub status: JobStatus,
    /// The content matched an in-flight job; `job_id` is that job.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResumeReport {
    pub resumed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Arc<dyn JobStore>,
    pipeline: Pipeline,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    admission: tokio::sync::Mutex<()>,
    cancelled: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    changes: watch::Sender<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Extract,
    Write,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Write => "write",
        }
    }
}

impl Coordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        pipeline: Pipeline,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                jobs,
                pipeline,
                retry,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                admission: tokio::sync::Mutex::new(()),
                cancelled: Mutex::new(HashSet::new()),
                running: Mutex::new(HashSet::new()),
                changes,
            }),
        }
    }

    pub fn receiver(&self) -> &UploadReceiver {
        &self.inner.pipeline.receiver
    }

    pub fn worker(&self) -> &ExtractionWorker {
        &self.inner.pipeline.worker
    }

    pub fn writer(&self) -> &GraphWriter {
        &self.inner.pipeline.writer
    }

    /// Stage an upload and start its pipeline.
    ///
    /// Type and declared size are checked before a job exists. A staging
    /// failure marks the new job FAILED and is returned. If another
    /// non-terminal job already holds the same content, the new record is
    /// dropped and that job's id is returned. If the returned future is
    /// dropped before the upload is staged, the job is marked FAILED.
    pub async fn submit<S, E>(&self, stream: S, meta: UploadMeta) -> Result<Submission, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.admit(stream, meta, true).await
    }

    /// Like [`submit`](Self::submit) but leaves the job STAGED without
    /// starting its pipeline; [`resume_unfinished`](Self::resume_unfinished)
    /// picks it up later.
    pub async fn stage<S, E>(&self, stream: S, meta: UploadMeta) -> Result<Submission, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.admit(stream, meta, false).await
    }

    async fn admit<S, E>(
        &self,
        stream: S,
        meta: UploadMeta,
        start: bool,
    ) -> Result<Submission, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let inner = &self.inner;
        inner.pipeline.receiver.precheck(&meta)?;

        let job = UploadJob::received(&meta);
        inner.jobs.insert(&job).await?;
        inner.notify();
        let guard = ReceivingGuard::new(inner, &job.id);
        tracing::info!(
            job_id = %job.id,
            filename = %job.source_filename,
            content_type = %job.content_type,
            "upload received"
        );

        let staged = match inner.pipeline.receiver.receive(stream, &meta).await {
            Ok(staged) => staged,
            Err(err) => {
                guard.settle();
                inner.fail(&job.id, &err).await;
                inner.forget(&job.id);
                return Err(err);
            }
        };

        let _admission = inner.admission.lock().await;

        if let Some(existing) = inner.jobs.find_active_by_hash(&staged.content_hash).await? {
            inner.jobs.remove(&job.id).await?;
            guard.settle();
            inner.forget(&job.id);
            inner.notify();
            tracing::info!(
                job_id = %existing.id,
                content_hash = %staged.content_hash,
                "content already in flight, returning existing job"
            );
            return Ok(Submission {
                job_id: existing.id,
                status: existing.status,
                deduplicated: true,
            });
        }

        if inner.is_cancelled(&job.id) {
            guard.settle();
            inner.fail(&job.id, &IngestError::Cancelled).await;
            inner.forget(&job.id);
            return Ok(Submission {
                job_id: job.id,
                status: JobStatus::Failed,
                deduplicated: false,
            });
        }

        let staged_job = inner
            .transition(&job.id, JobStatus::Staged, &JobUpdate::staged(&staged))
            .await?;
        guard.settle();
        let submission = Submission {
            job_id: staged_job.id.clone(),
            status: staged_job.status,
            deduplicated: false,
        };
        if start {
            Inner::spawn_pipeline(inner, staged_job, staged);
        } else {
            inner.forget(&job.id);
        }
        Ok(submission)
    }

    pub async fn status(&self, job_id: &str) -> anyhow::Result<Option<UploadJob>> {
        self.inner.jobs.get(job_id).await
    }

    /// Most recent jobs first.
    pub async fn list(&self, limit: usize) -> anyhow::Result<Vec<UploadJob>> {
        self.inner.jobs.list_recent(limit).await
    }

    /// Request cancellation. Honoured at the job's next stage transition;
    /// a terminal job is returned unchanged.
    pub async fn cancel(&self, job_id: &str) -> anyhow::Result<Option<UploadJob>> {
        let job = match self.inner.jobs.get(job_id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        if job.status.is_terminal() {
            return Ok(Some(job));
        }
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string());

        // The job may have finished, or been dropped as a duplicate, since
        // it was read; nothing would clear the request then.
        match self.inner.jobs.get(job_id).await? {
            Some(current) if !current.status.is_terminal() => {
                tracing::info!(job_id, status = %current.status, "cancellation requested");
                Ok(Some(current))
            }
            current => {
                self.inner.forget_cancel(job_id);
                Ok(current.or(Some(job)))
            }
        }
    }

    /// Wait until the job is terminal or `timeout` elapses; returns the
    /// latest snapshot either way.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> anyhow::Result<UploadJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.inner.changes.subscribe();
        loop {
            rx.borrow_and_update();
            let job = self
                .inner
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job not found: {}", job_id))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Elapsed, or the sender is gone.
                _ => return Ok(job),
            }
        }
    }

    /// Re-run jobs a previous process left unfinished.
    ///
    /// RECEIVED jobs lost their upload stream and are failed. Jobs past
    /// staging are re-run from their current stage when the artifact is
    /// still on disk, and failed otherwise.
    pub async fn resume_unfinished(&self) -> anyhow::Result<ResumeReport> {
        let inner = &self.inner;
        let mut report = ResumeReport::default();
        for job in inner.jobs.list_unfinished().await? {
            if inner.is_running(&job.id) {
                continue;
            }
            let opened = match (job.status, job.content_hash.as_deref()) {
                (JobStatus::Received, _) | (_, None) => Err(IngestError::io(
                    "upload was interrupted before staging completed",
                )),
                (_, Some(hash)) => inner.pipeline.receiver.open(hash, &job.content_type).await,
            };
            match opened {
                Ok(staged) => {
                    tracing::info!(job_id = %job.id, status = %job.status, "resuming job");
                    Inner::spawn_pipeline(inner, job, staged);
                    report.resumed += 1;
                }
                Err(err) => {
                    inner.fail(&job.id, &err).await;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }

    fn is_running(&self, job_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }

    fn forget_cancel(&self, job_id: &str) {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    fn forget(&self, job_id: &str) {
        self.forget_cancel(job_id);
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        update: &JobUpdate,
    ) -> Result<UploadJob, IngestError> {
        let job = self.jobs.transition(job_id, to, update).await?;
        self.notify();
        tracing::debug!(job_id, status = %to, "job transition");
        Ok(job)
    }

    /// Enter `to` unless the job was cancelled.
    async fn advance(&self, job_id: &str, to: JobStatus) -> Result<UploadJob, IngestError> {
        if self.is_cancelled(job_id) {
            return Err(IngestError::Cancelled);
        }
        self.transition(job_id, to, &JobUpdate::next_stage()).await
    }

    async fn fail(&self, job_id: &str, err: &IngestError) {
        match self
            .jobs
            .transition(job_id, JobStatus::Failed, &JobUpdate::failed(err))
            .await
        {
            Ok(_) => {
                self.notify();
                tracing::warn!(job_id, kind = %err.kind(), error = %err, "job failed");
            }
            Err(e) => {
                tracing::error!(job_id, kind = %err.kind(), error = %e, "could not record job failure");
            }
        }
    }

    fn spawn_pipeline(this: &Arc<Self>, job: UploadJob, staged: StagedFile) {
        {
            let mut running = this.running.lock().unwrap_or_else(|e| e.into_inner());
            if !running.insert(job.id.clone()) {
                return;
            }
        }
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let _permit = Arc::clone(&inner.permits).acquire_owned().await.ok();

            // Nested task so a panic surfaces as a JoinError instead of
            // tearing down this supervisor.
            let run = tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.run_pipeline(job, staged).await }
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(join) => Err(IngestError::Internal(format!("pipeline task failed: {}", join))),
            };
            if let Err(err) = outcome {
                inner.fail(&job_id, &err).await;
            }
            inner.forget(&job_id);
        });
    }

    async fn run_pipeline(&self, job: UploadJob, staged: StagedFile) -> Result<(), IngestError> {
        let id = job.id.as_str();

        if job.status == JobStatus::Staged {
            self.advance(id, JobStatus::Extracting).await?;
        }

        // A job resumed in WRITING has no delta on record; extraction is
        // deterministic, so it is run again without counting as an attempt.
        let resumed_in_write = job.status == JobStatus::Writing;
        let worker = &self.pipeline.worker;
        let delta = self
            .with_retry(id, Stage::Extract, !resumed_in_write, || worker.extract(&staged))
            .await?;

        if !resumed_in_write {
            self.advance(id, JobStatus::Writing).await?;
        }

        let writer = &self.pipeline.writer;
        let report = self
            .with_retry(id, Stage::Write, true, || writer.apply(&delta))
            .await?;

        // The write is committed: completion is no longer cancellable.
        self.transition(id, JobStatus::Complete, &JobUpdate::default())
            .await?;
        tracing::info!(
            job_id = id,
            content_hash = %staged.content_hash,
            nodes_created = report.nodes_created,
            nodes_updated = report.nodes_updated,
            relationships_created = report.relationships_created,
            relationships_updated = report.relationships_updated,
            "job complete"
        );
        Ok(())
    }

    /// Run one stage, retrying transient errors per the retry policy.
    async fn with_retry<T, F, Fut>(
        &self,
        job_id: &str,
        stage: Stage,
        record: bool,
        mut op: F,
    ) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if record {
                self.jobs.record_attempt(job_id).await?;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.retry.allows_retry_after(attempt) => {
                    let delay = self
                        .retry
                        .jittered_delay_before(attempt + 1, rand::random::<f64>());
                    tracing::warn!(
                        job_id,
                        stage = stage.as_str(),
                        attempt,
                        kind = %err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.is_cancelled(job_id) {
                        return Err(IngestError::Cancelled);
                    }
                }
                Err(err) => {
                    tracing::debug!(job_id, stage = stage.as_str(), attempt, kind = %err.kind(), "stage failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Marks a RECEIVED job FAILED if `submit` is dropped (client disconnect)
/// before the job is staged, discarded or failed explicitly.
struct ReceivingGuard {
    inner: Arc<Inner>,
    job_id: String,
    armed: bool,
}

impl ReceivingGuard {
    fn new(inner: &Arc<Inner>, job_id: &str) -> Self {
        Self {
            inner: Arc::clone(inner),
            job_id: job_id.to_string(),
            armed: true,
        }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for ReceivingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let job_id = std::mem::take(&mut self.job_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let err = IngestError::io("upload aborted before staging completed");
                    inner.fail(&job_id, &err).await;
                    inner.forget(&job_id);
                });
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, "upload abandoned without a runtime; job left RECEIVED");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vidgraph_core::delta::{no_props, GraphDelta};
    use vidgraph_core::error::ErrorKind;
    use vidgraph_core::extract::Extractor;
    use vidgraph_core::store::memory::{InMemoryGraphStore, InMemoryJobStore};
    use vidgraph_core::store::GraphStore;

    /// Extractor scripted per call: fail with `error` for the first
    /// `failures` calls, optionally sleeping first.
    struct Scripted {
        failures: u32,
        error: fn() -> IngestError,
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Extractor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.failures {
                return Err((self.error)());
            }
            Ok(GraphDelta::builder()
                .node(&format!("video:{}", staged.content_hash), "Video", no_props())
                .build())
        }
    }

    fn scripted(failures: u32, error: fn() -> IngestError, delay: Duration) -> Arc<Scripted> {
        Arc::new(Scripted {
            failures,
            error,
            delay,
            calls: AtomicU32::new(0),
        })
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            jitter: 0.2,
        }
    }

    fn coordinator(
        root: &std::path::Path,
        extractor: Arc<Scripted>,
        attempts: u32,
    ) -> (Coordinator, Arc<InMemoryGraphStore>) {
        let graph = Arc::new(InMemoryGraphStore::new());
        let pipeline = Pipeline {
            receiver: UploadReceiver::new(root, 1 << 20, vec!["video/webm".to_string()]),
            worker: ExtractionWorker::new(extractor, Duration::from_secs(5)),
            writer: GraphWriter::new(graph.clone(), RetryPolicy::none()),
        };
        let jobs = Arc::new(InMemoryJobStore::new(100));
        (Coordinator::new(jobs, pipeline, fast_retry(attempts), 4), graph)
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures::stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    fn meta() -> UploadMeta {
        UploadMeta {
            filename: "clip.webm".to_string(),
            content_type: "video/webm".to_string(),
            declared_size: None,
        }
    }

    #[tokio::test]
    async fn happy_path_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (c, graph) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let sub = c.submit(body(b"video bytes"), meta()).await.unwrap();
        assert!(!sub.deduplicated);
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(graph.stats().await.unwrap().nodes, 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_fail_with_exact_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = scripted(
            u32::MAX,
            || IngestError::ExtractionTimeout(Duration::from_millis(1)),
            Duration::ZERO,
        );
        let (c, _) = coordinator(dir.path(), extractor.clone(), 3);
        let sub = c.submit(body(b"slow video"), meta()).await.unwrap();
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::ExtractionTimeout);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn corrupt_input_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = scripted(
            u32::MAX,
            || IngestError::CorruptInput("garbage".into()),
            Duration::ZERO,
        );
        let (c, _) = coordinator(dir.path(), extractor.clone(), 5);
        let sub = c.submit(body(b"garbage"), meta()).await.unwrap();
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_duplicate_returns_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = scripted(0, || IngestError::Cancelled, Duration::from_millis(300));
        let (c, _) = coordinator(dir.path(), extractor, 3);
        let first = c.submit(body(b"same bytes"), meta()).await.unwrap();
        let second = c.submit(body(b"same bytes"), meta()).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(c.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_fails_at_next_transition() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = scripted(0, || IngestError::Cancelled, Duration::from_millis(200));
        let (c, graph) = coordinator(dir.path(), extractor, 3);
        let sub = c.submit(body(b"to cancel"), meta()).await.unwrap();
        c.cancel(&sub.job_id).await.unwrap().unwrap();
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(graph.stats().await.unwrap().nodes, 0);
    }

    #[tokio::test]
    async fn rejected_type_creates_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let mut m = meta();
        m.content_type = "text/plain".to_string();
        let err = c.submit(body(b"hello"), m).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);
        assert!(c.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn staging_failure_marks_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let mut m = meta();
        m.declared_size = Some(100);
        let err = c.submit(body(b"short"), m).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        let jobs = c.list(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn abandoned_upload_fails_job_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let stalled = body(b"partial bytes").chain(futures::stream::pending());
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), c.submit(stalled, meta())).await;
        assert!(outcome.is_err());

        let jobs = c.list(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = c.wait(&jobs[0].id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::IoFailure);

        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cancel_of_finished_job_leaves_no_request_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let sub = c.submit(body(b"quick"), meta()).await.unwrap();
        c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();

        let job = c.cancel(&sub.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(!c.inner.is_cancelled(&sub.job_id));
        assert!(c.cancel("no-such-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_duplicate_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = scripted(0, || IngestError::Cancelled, Duration::from_millis(500));
        let (c, _) = coordinator(dir.path(), extractor, 3);
        let first = c.submit(body(b"same bytes"), meta()).await.unwrap();

        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let held = body(b"same bytes").chain(futures::stream::once(async move {
            let _ = released.await;
            Ok::<Bytes, std::io::Error>(Bytes::new())
        }));
        let c2 = c.clone();
        let second = tokio::spawn(async move { c2.submit(held, meta()).await });

        let receiving = loop {
            let jobs = c.list(10).await.unwrap();
            if let Some(job) = jobs.into_iter().find(|j| j.status == JobStatus::Received) {
                break job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        c.cancel(&receiving.id).await.unwrap().unwrap();
        assert!(c.inner.is_cancelled(&receiving.id));

        release.send(()).unwrap();
        let sub = second.await.unwrap().unwrap();
        assert!(sub.deduplicated);
        assert_eq!(sub.job_id, first.job_id);
        assert!(!c.inner.is_cancelled(&receiving.id));
    }

    #[tokio::test]
    async fn staged_only_job_runs_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (c, graph) = coordinator(dir.path(), scripted(0, || IngestError::Cancelled, Duration::ZERO), 3);
        let sub = c.stage(body(b"later"), meta()).await.unwrap();
        assert_eq!(sub.status, JobStatus::Staged);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = c.status(&sub.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Staged);
        assert_eq!(graph.stats().await.unwrap().nodes, 0);

        let report = c.resume_unfinished().await.unwrap();
        assert_eq!(report.resumed, 1);
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(graph.stats().await.unwrap().nodes, 1);
    }

    struct Panicking;

    #[async_trait]
    impl Extractor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn extract(&self, _staged: &StagedFile) -> Result<GraphDelta, IngestError> {
            panic!("extractor bug");
        }
    }

    #[tokio::test]
    async fn panic_is_recorded_as_internal() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(InMemoryGraphStore::new());
        let pipeline = Pipeline {
            receiver: UploadReceiver::new(dir.path(), 1 << 20, vec!["video/webm".to_string()]),
            worker: ExtractionWorker::new(Arc::new(Panicking), Duration::from_secs(5)),
            writer: GraphWriter::new(graph, RetryPolicy::none()),
        };
        let c = Coordinator::new(Arc::new(InMemoryJobStore::new(10)), pipeline, fast_retry(3), 1);
        let sub = c.submit(body(b"boom"), meta()).await.unwrap();
        let job = c.wait(&sub.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Internal);
    }
}
