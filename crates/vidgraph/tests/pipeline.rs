//! End-to-end pipeline tests against a real SQLite database.
//!
//! Each test gets its own temporary directory holding the database and the
//! staged uploads.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use vidgraph::config::Config;
use vidgraph::coordinator::{Coordinator, Pipeline};
use vidgraph::extraction::ExtractionWorker;
use vidgraph::extractor_container::ContainerExtractor;
use vidgraph::receiver::UploadReceiver;
use vidgraph::services::Services;
use vidgraph::sqlite_jobs::SqliteJobStore;
use vidgraph::writer::GraphWriter;
use vidgraph_core::delta::{GraphDelta, WriteReport};
use vidgraph_core::error::{ErrorKind, IngestError};
use vidgraph_core::extract::Extractor;
use vidgraph_core::models::{JobStatus, JobUpdate, StagedFile, UploadJob, UploadMeta};
use vidgraph_core::retry::RetryPolicy;
use vidgraph_core::store::memory::InMemoryJobStore;
use vidgraph_core::store::{GraphEdge, GraphNode, GraphSnapshot, GraphStats, GraphStore, JobStore};

const WAIT: Duration = Duration::from_secs(30);

fn webm_meta(name: &str) -> UploadMeta {
    UploadMeta {
        filename: name.to_string(),
        content_type: "video/webm".to_string(),
        declared_size: None,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        jitter: 0.5,
    }
}

async fn open(tmp: &TempDir) -> (Config, Services) {
    let mut config = Config::minimal(tmp.path());
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    let services = Services::open(&config).await.unwrap();
    (config, services)
}

#[tokio::test]
async fn ten_megabyte_upload_completes_and_is_queryable() {
    let tmp = TempDir::new().unwrap();
    let (config, services) = open(&tmp).await;

    let data = common::webm_file(10 * 1024 * 1024, 7);
    assert_eq!(data.len(), 10 * 1024 * 1024);
    let hash = common::sha256_hex(&data);

    let sub = services
        .coordinator
        .submit(common::chunked(&data), webm_meta("big.webm"))
        .await
        .unwrap();
    assert_eq!(sub.status, JobStatus::Staged);

    let job = services.coordinator.wait(&sub.job_id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete, "{:?}", job.last_error);
    assert_eq!(job.content_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(job.size_bytes, data.len() as u64);

    let video_key = format!("video:{}", hash);
    let video = services.graph.get_node(&video_key).await.unwrap().unwrap();
    assert_eq!(video.label, "Video");
    assert_eq!(
        video.properties["container"],
        vidgraph_core::PropertyValue::Text("webm".to_string())
    );
    assert_eq!(
        video.properties["duration_secs"],
        vidgraph_core::PropertyValue::Float(12.5)
    );

    let edges = services.graph.neighbors(&video_key).await.unwrap();
    let has_track = edges.iter().filter(|e| e.relation_type == "HAS_TRACK").count();
    assert_eq!(has_track, 2);
    assert!(edges
        .iter()
        .any(|e| e.relation_type == "PACKAGED_AS" && e.to_key == "container:webm"));

    let codecs = services.graph.nodes_by_label("Codec", 10).await.unwrap();
    let keys: Vec<&str> = codecs.iter().map(|n| n.natural_key.as_str()).collect();
    assert!(keys.contains(&"codec:v_vp8"));
    assert!(keys.contains(&"codec:a_opus"));

    assert_eq!(common::object_count(&config.storage.root), 1);
}

#[tokio::test]
async fn overlapping_natural_keys_from_parallel_jobs() {
    let tmp = TempDir::new().unwrap();
    let (_config, services) = open(&tmp).await;

    let mut ids = Vec::new();
    for seed in 0..4u8 {
        let data = common::webm_file(256 * 1024, seed);
        let sub = services
            .coordinator
            .submit(common::chunked(&data), webm_meta(&format!("clip{}.webm", seed)))
            .await
            .unwrap();
        ids.push(sub.job_id);
    }
    for id in &ids {
        let job = services.coordinator.wait(id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete, "{:?}", job.last_error);
    }

    // Shared container and codecs exist once each.
    assert_eq!(
        services.graph.nodes_by_label("Container", 10).await.unwrap().len(),
        1
    );
    assert_eq!(
        services.graph.nodes_by_label("Codec", 10).await.unwrap().len(),
        2
    );
    assert_eq!(
        services.graph.nodes_by_label("Video", 10).await.unwrap().len(),
        4
    );
    // Each video: 1 Video + 2 Track; shared: 1 Container + 2 Codec.
    let stats = services.graph.stats().await.unwrap();
    assert_eq!(stats.nodes, 4 * 3 + 3);
}

#[tokio::test]
async fn identical_content_twice_in_flight_is_deduplicated() {
    let tmp = TempDir::new().unwrap();
    let (config, services) = open(&tmp).await;
    let data = common::webm_file(512 * 1024, 1);

    let first = services
        .coordinator
        .submit(common::chunked(&data), webm_meta("a.webm"))
        .await
        .unwrap();
    let second = services
        .coordinator
        .submit(common::chunked(&data), webm_meta("b.webm"))
        .await
        .unwrap();

    // The first pipeline may already be done by the time the second upload
    // is staged; only an in-flight job is reused.
    if second.deduplicated {
        assert_eq!(second.job_id, first.job_id);
    }
    for id in [&first.job_id, &second.job_id] {
        let job = services.coordinator.wait(id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
    }
    assert_eq!(common::object_count(&config.storage.root), 1);
}

#[tokio::test]
async fn corrupt_upload_fails_without_retry() {
    let tmp = TempDir::new().unwrap();
    let (_config, services) = open(&tmp).await;
    let garbage = vec![0x42u8; 4096];

    let sub = services
        .coordinator
        .submit(common::chunked(&garbage), webm_meta("garbage.webm"))
        .await
        .unwrap();
    let job = services.coordinator.wait(&sub.job_id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.unwrap().kind, ErrorKind::CorruptInput);
    assert_eq!(services.graph.stats().await.unwrap(), GraphStats::default());
}

#[tokio::test]
async fn oversize_upload_leaves_no_artifact() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path());
    config.upload.max_bytes = 100 * 1024;
    let services = Services::open(&config).await.unwrap();

    let data = common::webm_file(300 * 1024, 3);
    let err = services
        .coordinator
        .submit(common::chunked(&data), webm_meta("big.webm"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeExceeded);

    let jobs = services.coordinator.list(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(common::object_count(&config.storage.root), 0);
    let leftovers = std::fs::read_dir(config.storage.root.join("tmp"))
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

/// Graph store that is always unavailable and records when it was called.
struct Unavailable {
    calls: Mutex<Vec<Instant>>,
}

#[async_trait]
impl GraphStore for Unavailable {
    async fn apply_delta(&self, _delta: &GraphDelta) -> Result<WriteReport, IngestError> {
        self.calls.lock().unwrap().push(Instant::now());
        Err(IngestError::StoreUnavailable("connection refused".to_string()))
    }
    async fn get_node(&self, _key: &str) -> Result<Option<GraphNode>, IngestError> {
        Ok(None)
    }
    async fn neighbors(&self, _key: &str) -> Result<Vec<GraphEdge>, IngestError> {
        Ok(Vec::new())
    }
    async fn nodes_by_label(&self, _l: &str, _n: usize) -> Result<Vec<GraphNode>, IngestError> {
        Ok(Vec::new())
    }
    async fn snapshot(&self, _n: usize) -> Result<GraphSnapshot, IngestError> {
        Ok(GraphSnapshot::default())
    }
    async fn stats(&self) -> Result<GraphStats, IngestError> {
        Ok(GraphStats::default())
    }
}

#[tokio::test]
async fn unavailable_store_exhausts_retries_with_backoff() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Unavailable {
        calls: Mutex::new(Vec::new()),
    });
    let policy = fast_retry(4);
    let pipeline = Pipeline {
        receiver: UploadReceiver::new(tmp.path(), 1 << 24, vec!["video/webm".to_string()]),
        worker: ExtractionWorker::new(Arc::new(ContainerExtractor::new()), Duration::from_secs(10)),
        writer: GraphWriter::new(store.clone(), RetryPolicy::none()),
    };
    let coordinator = Coordinator::new(
        Arc::new(InMemoryJobStore::new(100)),
        pipeline,
        policy.clone(),
        2,
    );

    let data = common::webm_file(64 * 1024, 9);
    let sub = coordinator
        .submit(common::chunked(&data), webm_meta("clip.webm"))
        .await
        .unwrap();
    let job = coordinator.wait(&sub.job_id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 4);
    assert_eq!(job.last_error.unwrap().kind, ErrorKind::StoreUnavailable);

    let calls = store.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    for (i, pair) in calls.windows(2).enumerate() {
        let attempt = i as u32 + 2;
        let gap = pair[1] - pair[0];
        assert!(
            gap >= policy.min_delay_before(attempt),
            "gap before attempt {} was {:?}",
            attempt,
            gap
        );
    }
}

/// Fails with corrupt input until `fail_until` calls have been made.
struct FailsFirst {
    inner: ContainerExtractor,
    fail_until: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Extractor for FailsFirst {
    fn name(&self) -> &str {
        "fails-first"
    }

    async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_until {
            return Err(IngestError::CorruptInput("flaky parser".to_string()));
        }
        self.inner.extract(staged).await
    }
}

#[tokio::test]
async fn resubmission_after_failure_starts_a_new_job_on_the_same_artifact() {
    let tmp = TempDir::new().unwrap();
    let (config, services) = open(&tmp).await;
    let pipeline = Pipeline {
        receiver: UploadReceiver::from_config(&config),
        worker: ExtractionWorker::new(
            Arc::new(FailsFirst {
                inner: ContainerExtractor::new(),
                fail_until: 1,
                calls: AtomicU32::new(0),
            }),
            Duration::from_secs(10),
        ),
        writer: GraphWriter::new(services.graph.clone(), RetryPolicy::none()),
    };
    let coordinator = Coordinator::new(
        Arc::new(SqliteJobStore::new(services.pool.clone())),
        pipeline,
        fast_retry(3),
        2,
    );

    let data = common::webm_file(128 * 1024, 5);
    let first = coordinator
        .submit(common::chunked(&data), webm_meta("clip.webm"))
        .await
        .unwrap();
    let failed = coordinator.wait(&first.job_id, WAIT).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    let second = coordinator
        .submit(common::chunked(&data), webm_meta("clip.webm"))
        .await
        .unwrap();
    assert_ne!(second.job_id, first.job_id);
    assert!(!second.deduplicated);
    assert_eq!(second.status, JobStatus::Staged);

    let done = coordinator.wait(&second.job_id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Complete);
    assert_eq!(done.content_hash, failed.content_hash);
    assert_eq!(common::object_count(&config.storage.root), 1);
}

#[tokio::test]
async fn resume_reruns_staged_jobs_and_fails_interrupted_uploads() {
    let tmp = TempDir::new().unwrap();
    let (_config, services) = open(&tmp).await;
    let jobs = SqliteJobStore::new(services.pool.clone());

    // A job a previous process staged but never processed.
    let data = common::webm_file(64 * 1024, 11);
    let staged = services
        .coordinator
        .receiver()
        .receive(common::chunked(&data), &webm_meta("left.webm"))
        .await
        .unwrap();
    let staged_job = UploadJob::received(&webm_meta("left.webm"));
    jobs.insert(&staged_job).await.unwrap();
    jobs.transition(&staged_job.id, JobStatus::Staged, &JobUpdate::staged(&staged))
        .await
        .unwrap();

    // An upload cut off while streaming.
    let interrupted = UploadJob::received(&webm_meta("cut.webm"));
    jobs.insert(&interrupted).await.unwrap();

    let report = services.coordinator.resume_unfinished().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.failed, 1);

    let done = services.coordinator.wait(&staged_job.id, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Complete);

    let lost = services.coordinator.status(&interrupted.id).await.unwrap().unwrap();
    assert_eq!(lost.status, JobStatus::Failed);
    assert_eq!(lost.last_error.unwrap().kind, ErrorKind::IoFailure);
}

#[tokio::test]
async fn jobs_survive_reopening_the_database() {
    let tmp = TempDir::new().unwrap();
    let (config, services) = open(&tmp).await;
    let data = common::webm_file(64 * 1024, 13);
    let sub = services
        .coordinator
        .submit(common::chunked(&data), webm_meta("clip.webm"))
        .await
        .unwrap();
    services.coordinator.wait(&sub.job_id, WAIT).await.unwrap();
    services.close().await;

    let reopened = Services::open(&config).await.unwrap();
    let job = reopened.coordinator.status(&sub.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(reopened.graph.nodes_by_label("Video", 10).await.unwrap().len(), 1);
}
