//! Durable [`JobStore`] on the `upload_jobs` table.
//!
//! A transition is one conditional statement:
//!
//! ```sql
//! UPDATE upload_jobs SET status = ?, … WHERE id = ? AND status IN (<predecessors>)
//! ```
//!
//! so of two racing callers only one can move a job out of a given state.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use vidgraph_core::error::ErrorKind;
use vidgraph_core::models::{JobError, JobStatus, JobUpdate, UploadJob};
use vidgraph_core::store::JobStore;

const COLUMNS: &str = "id, source_filename, content_type, size_bytes, content_hash, status, \
                       attempts, created_at, updated_at, error_kind, error_message";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn job_from_row(row: &SqliteRow) -> Result<UploadJob> {
    let status: String = row.get("status");
    let size: i64 = row.get("size_bytes");
    let attempts: i64 = row.get("attempts");
    let error_kind: Option<String> = row.get("error_kind");
    let error_message: Option<String> = row.get("error_message");
    Ok(UploadJob {
        id: row.get("id"),
        source_filename: row.get("source_filename"),
        content_type: row.get("content_type"),
        size_bytes: size.max(0) as u64,
        content_hash: row.get("content_hash"),
        status: status.parse()?,
        attempts: attempts.max(0) as u32,
        created_at: millis_to_datetime(row.get("created_at")),
        updated_at: millis_to_datetime(row.get("updated_at")),
        last_error: error_kind.map(|kind| JobError {
            kind: ErrorKind::parse(&kind),
            message: error_message.unwrap_or_default(),
        }),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &UploadJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_jobs (id, source_filename, content_type, size_bytes, content_hash,
                                     status, attempts, created_at, updated_at,
                                     error_kind, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.source_filename)
        .bind(&job.content_type)
        .bind(job.size_bytes as i64)
        .bind(&job.content_hash)
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .bind(job.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(job.last_error.as_ref().map(|e| e.message.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UploadJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM upload_jobs WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition(&self, id: &str, to: JobStatus, update: &JobUpdate) -> Result<UploadJob> {
        let from = to.predecessors();
        if from.is_empty() {
            bail!("no transition leads to {}", to);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE upload_jobs SET
                status = ?,
                content_hash = COALESCE(?, content_hash),
                size_bytes = COALESCE(?, size_bytes),
                attempts = COALESCE(?, attempts),
                error_kind = COALESCE(?, error_kind),
                error_message = COALESCE(?, error_message),
                updated_at = ?
            WHERE id = ? AND status IN ({})
            RETURNING {}
            "#,
            placeholders, COLUMNS
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(update.content_hash.as_deref())
            .bind(update.size_bytes.map(|s| s as i64))
            .bind(update.attempts.map(|a| a as i64))
            .bind(update.error.as_ref().map(|e| e.kind.as_str()))
            .bind(update.error.as_ref().map(|e| e.message.as_str()))
            .bind(Utc::now().timestamp_millis())
            .bind(id);
        for status in &from {
            query = query.bind(status.as_str());
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => job_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => bail!(
                    "invalid transition for job {}: {} -> {}",
                    id,
                    current.status,
                    to
                ),
                None => Err(anyhow!("job not found: {}", id)),
            },
        }
    }

    async fn record_attempt(&self, id: &str) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE upload_jobs SET attempts = attempts + 1, updated_at = ? WHERE id = ? RETURNING attempts",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        attempts
            .map(|a| a as u32)
            .ok_or_else(|| anyhow!("job not found: {}", id))
    }

    async fn find_active_by_hash(&self, content_hash: &str) -> Result<Option<UploadJob>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM upload_jobs
            WHERE content_hash = ? AND status NOT IN ('COMPLETE', 'FAILED')
            ORDER BY created_at ASC LIMIT 1
            "#,
            COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<UploadJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_jobs WHERE status NOT IN ('COMPLETE', 'FAILED') ORDER BY created_at ASC",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<UploadJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_jobs ORDER BY created_at DESC LIMIT ?",
            COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM upload_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use vidgraph_core::error::IngestError;
    use vidgraph_core::models::UploadMeta;

    async fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::minimal(dir.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations_on(&pool).await.unwrap();
        (dir, SqliteJobStore::new(pool))
    }

    fn job(name: &str) -> UploadJob {
        UploadJob::received(&UploadMeta {
            filename: name.to_string(),
            content_type: "video/mp4".to_string(),
            declared_size: Some(1024),
        })
    }

    fn hashed(hash: &str) -> JobUpdate {
        JobUpdate {
            content_hash: Some(hash.to_string()),
            size_bytes: Some(1000),
            attempts: Some(0),
            error: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let (_dir, store) = store().await;
        let j = job("a.mp4");
        store.insert(&j).await.unwrap();
        let loaded = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, j.id);
        assert_eq!(loaded.status, JobStatus::Received);
        assert_eq!(loaded.size_bytes, 1024);
        assert!(loaded.last_error.is_none());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_applies_update_and_checks_edge() {
        let (_dir, store) = store().await;
        let j = job("a.mp4");
        store.insert(&j).await.unwrap();

        let staged = store
            .transition(&j.id, JobStatus::Staged, &hashed("ff00"))
            .await
            .unwrap();
        assert_eq!(staged.status, JobStatus::Staged);
        assert_eq!(staged.content_hash.as_deref(), Some("ff00"));
        assert_eq!(staged.size_bytes, 1000);

        let err = store
            .transition(&j.id, JobStatus::Complete, &JobUpdate::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid transition"));

        let err = store
            .transition("nope", JobStatus::Staged, &JobUpdate::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn only_one_racer_leaves_a_state() {
        let (_dir, store) = store().await;
        let j = job("a.mp4");
        store.insert(&j).await.unwrap();
        store
            .transition(&j.id, JobStatus::Staged, &hashed("aa"))
            .await
            .unwrap();

        let update = JobUpdate::next_stage();
        let (a, b) = tokio::join!(
            store.transition(&j.id, JobStatus::Extracting, &update),
            store.transition(&j.id, JobStatus::Extracting, &update),
        );
        assert!(a.is_ok() ^ b.is_ok());
    }

    #[tokio::test]
    async fn failed_job_keeps_error_and_is_terminal() {
        let (_dir, store) = store().await;
        let j = job("a.mp4");
        store.insert(&j).await.unwrap();
        let err = IngestError::CorruptInput("no EBML header".into());
        let failed = store
            .transition(&j.id, JobStatus::Failed, &JobUpdate::failed(&err))
            .await
            .unwrap();
        let recorded = failed.last_error.unwrap();
        assert_eq!(recorded.kind, ErrorKind::CorruptInput);
        assert!(recorded.message.contains("EBML"));

        assert!(store
            .transition(&j.id, JobStatus::Failed, &JobUpdate::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn attempts_and_active_lookup() {
        let (_dir, store) = store().await;
        let j = job("a.mp4");
        store.insert(&j).await.unwrap();
        store
            .transition(&j.id, JobStatus::Staged, &hashed("beef"))
            .await
            .unwrap();
        assert_eq!(store.record_attempt(&j.id).await.unwrap(), 1);
        assert_eq!(store.record_attempt(&j.id).await.unwrap(), 2);
        assert!(store.record_attempt("missing").await.is_err());

        let active = store.find_active_by_hash("beef").await.unwrap().unwrap();
        assert_eq!(active.id, j.id);
        assert_eq!(active.attempts, 2);

        store
            .transition(&j.id, JobStatus::Failed, &JobUpdate::failed(&IngestError::Cancelled))
            .await
            .unwrap();
        assert!(store.find_active_by_hash("beef").await.unwrap().is_none());
        assert!(store.list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_recent_newest_first_and_remove() {
        let (_dir, store) = store().await;
        let first = job("1.mp4");
        store.insert(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = job("2.mp4");
        store.insert(&second).await.unwrap();

        let recent = store.list_recent(10).await.unwrap();
        assert_eq!(recent[0].id, second.id);
        assert_eq!(recent[1].id, first.id);

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished[0].id, first.id);

        store.remove(&second.id).await.unwrap();
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
    }
}
