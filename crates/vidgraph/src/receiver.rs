//! Upload receiver: validates, streams and stages uploads.
//!
//! Bytes are written to `<root>/tmp/<uuid>.part` chunk by chunk while a
//! running SHA-256 is computed; the upload is never held in memory. When the
//! stream ends the file is fsynced, made read-only and renamed to its
//! content address `<root>/objects/<hash[0..2]>/<hash>`. Identical uploads
//! therefore share one artifact on disk.
//!
//! The partial file is removed on every failure path, including a dropped
//! upload future (client disconnect).

use std::fmt::Display;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use vidgraph_core::error::IngestError;
use vidgraph_core::models::{StagedFile, UploadMeta};

use crate::config::Config;

const READ_CHUNK: usize = 64 * 1024;

/// Strip parameters (`video/webm;codecs=vp8` → `video/webm`) and lowercase.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub struct UploadReceiver {
    root: PathBuf,
    max_bytes: u64,
    allowed_types: Vec<String>,
}

impl UploadReceiver {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64, allowed_types: Vec<String>) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            allowed_types: allowed_types
                .iter()
                .map(|t| normalize_content_type(t))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage.root.clone(),
            config.upload.max_bytes,
            config.upload.allowed_types.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Checks that need no bytes: declared type and declared size.
    pub fn precheck(&self, meta: &UploadMeta) -> Result<(), IngestError> {
        let content_type = normalize_content_type(&meta.content_type);
        if !self.allowed_types.iter().any(|t| *t == content_type) {
            return Err(IngestError::UnsupportedType(meta.content_type.clone()));
        }
        if let Some(declared) = meta.declared_size {
            if declared > self.max_bytes {
                return Err(IngestError::SizeExceeded {
                    limit: self.max_bytes,
                });
            }
        }
        Ok(())
    }

    /// Content-addressed location of `hash`.
    pub fn object_path(&self, hash: &str) -> PathBuf {
        let prefix = hash.get(..2).unwrap_or("00");
        self.root.join("objects").join(prefix).join(hash)
    }

    /// Stage `stream`, returning the handle of the stored artifact.
    pub async fn receive<S, E>(&self, stream: S, meta: &UploadMeta) -> Result<StagedFile, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        self.precheck(meta)?;

        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let part = PartFile(tmp_dir.join(format!("{}.part", Uuid::new_v4())));

        let (content_hash, size_bytes) = self
            .write_part(&part.0, stream, meta.declared_size)
            .await?;
        let path = self.publish(&part.0, &content_hash).await?;
        tracing::debug!(
            content_hash = %content_hash,
            size_bytes,
            path = %path.display(),
            "upload staged"
        );
        Ok(StagedFile {
            content_hash,
            path,
            size_bytes,
            content_type: normalize_content_type(&meta.content_type),
        })
    }

    async fn write_part<S, E>(
        &self,
        tmp_path: &Path,
        stream: S,
        declared_size: Option<u64>,
    ) -> Result<(String, u64), IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| IngestError::io(format!("upload stream failed: {}", e)))?;
            total += chunk.len() as u64;
            if total > self.max_bytes {
                return Err(IngestError::SizeExceeded {
                    limit: self.max_bytes,
                });
            }
            if let Some(declared) = declared_size {
                if total > declared {
                    return Err(IngestError::SizeExceeded { limit: declared });
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        if let Some(declared) = declared_size {
            if total < declared {
                return Err(IngestError::io(format!(
                    "truncated upload: received {} of {} bytes",
                    total, declared
                )));
            }
        }

        file.sync_all().await?;
        Ok((format!("{:x}", hasher.finalize()), total))
    }

    /// Move a complete part file to its content address. When the object
    /// already exists the part file is left for its [`PartFile`] guard.
    async fn publish(&self, tmp_path: &Path, hash: &str) -> Result<PathBuf, IngestError> {
        let final_path = self.object_path(hash);
        if tokio::fs::try_exists(&final_path).await? {
            return Ok(final_path);
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut perms = tokio::fs::metadata(tmp_path).await?.permissions();
        perms.set_readonly(true);
        tokio::fs::set_permissions(tmp_path, perms).await?;
        tokio::fs::rename(tmp_path, &final_path).await?;
        Ok(final_path)
    }

    /// Look up an already staged artifact.
    pub async fn open(&self, hash: &str, content_type: &str) -> Result<StagedFile, IngestError> {
        if !is_content_hash(hash) {
            return Err(IngestError::io(format!("not a content hash: {}", hash)));
        }
        let path = self.object_path(hash);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| IngestError::io(format!("artifact {} unavailable: {}", hash, e)))?;
        Ok(StagedFile {
            content_hash: hash.to_string(),
            path,
            size_bytes: meta.len(),
            content_type: normalize_content_type(content_type),
        })
    }
}

/// A `tmp/<uuid>.part` path that is removed when the guard drops: on
/// error, on a duplicate, or when the upload future itself is dropped.
/// After a successful rename nothing is left at the path.
struct PartFile(PathBuf);

impl Drop for PartFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.0.display(), error = %e, "failed to remove partial upload");
            }
        }
    }
}

/// Read an open file as a stream of chunks (CLI ingest).
pub fn file_stream(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> {
    futures::stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; READ_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidgraph_core::error::ErrorKind;

    fn receiver(root: &Path, max_bytes: u64) -> UploadReceiver {
        UploadReceiver::new(
            root,
            max_bytes,
            vec!["video/webm".to_string(), "video/mp4".to_string()],
        )
    }

    fn meta(declared: Option<u64>) -> UploadMeta {
        UploadMeta {
            filename: "clip.webm".to_string(),
            content_type: "video/webm; codecs=\"vp8\"".to_string(),
            declared_size: declared,
        }
    }

    fn chunks(data: &[u8], size: usize) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        let parts: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(parts)
    }

    fn files_under(dir: &Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        let mut count = 0;
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count += files_under(&path);
            } else {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn same_bytes_twice_give_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let data = vec![7u8; 10_000];

        let a = r.receive(chunks(&data, 999), &meta(Some(10_000))).await.unwrap();
        let b = r.receive(chunks(&data, 4096), &meta(None)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size_bytes, 10_000);
        assert_eq!(a.content_type, "video/webm");
        assert_eq!(files_under(&dir.path().join("objects")), 1);
        assert_eq!(files_under(&dir.path().join("tmp")), 0);
        assert!(std::fs::metadata(&a.path).unwrap().permissions().readonly());
    }

    #[tokio::test]
    async fn oversize_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1000);
        let err = r
            .receive(chunks(&[1u8; 1500], 100), &meta(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeExceeded);
        assert_eq!(files_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn declared_size_is_checked_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1000);
        let err = r.precheck(&meta(Some(5000))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeExceeded);
    }

    #[tokio::test]
    async fn longer_than_declared_is_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let err = r
            .receive(chunks(&[1u8; 300], 100), &meta(Some(200)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeExceeded);
    }

    #[tokio::test]
    async fn shorter_than_declared_is_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let err = r
            .receive(chunks(&[1u8; 100], 10), &meta(Some(200)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(files_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn stream_error_is_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let parts: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err("connection reset".to_string()),
        ];
        let err = r
            .receive(futures::stream::iter(parts), &meta(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(files_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn abandoned_upload_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let stalled = chunks(b"partial bytes", 4).chain(futures::stream::pending());
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            r.receive(stalled, &meta(None)),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(files_under(&dir.path().join("tmp")), 0);
        assert_eq!(files_under(&dir.path().join("objects")), 0);
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let mut m = meta(None);
        m.content_type = "image/png".to_string();
        let err = r.receive(chunks(b"png", 3), &m).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);
    }

    #[tokio::test]
    async fn open_finds_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let r = receiver(dir.path(), 1 << 20);
        let staged = r.receive(chunks(b"hello video", 4), &meta(None)).await.unwrap();
        let opened = r.open(&staged.content_hash, "video/webm").await.unwrap();
        assert_eq!(opened, staged);

        let missing = r.open(&"0".repeat(64), "video/webm").await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::IoFailure);
        assert!(r.open("../../etc/passwd", "video/webm").await.is_err());
    }

    #[tokio::test]
    async fn file_stream_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let collected: Vec<Bytes> = file_stream(file)
            .map(|c| c.unwrap())
            .collect()
            .await;
        let joined: Vec<u8> = collected.concat();
        assert_eq!(joined, data);
    }
}
