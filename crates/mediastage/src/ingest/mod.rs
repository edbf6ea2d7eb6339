//! Ingestion Pipeline
//!
//! Orchestrates one ingestion: cache lookup, fetch, staging, cache fill,
//! quota check, and handoff.
//!
//! Calls for the same object ID run one at a time; a caller that waited
//! behind a successful fetch is answered from the cache. Calls for
//! different IDs only contend on the admission semaphore.

pub mod inflight;
pub mod staging;

pub use inflight::{KeyGuard, KeyedLocks};
pub use staging::{StagedFile, StagingArea, StagingWriter};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{AppendOutcome, MemoryCache};
use crate::error::{Result, StageError};
use crate::fetch::ContentSource;
use crate::quota::QuotaGuard;
use crate::types::{Artifact, ArtifactOrigin, ObjectId};
use crate::upload::Uploader;

/// Default number of fetches admitted at once
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Pipeline for staging remote objects on local disk.
///
/// The pipeline orchestrates:
/// 1. Cache lookup (hit returns without network or disk I/O)
/// 2. Fetch of the remote object as fixed-size chunks
/// 3. Optional preflight against the quota using the advertised length
/// 4. Streaming each chunk to a staging file and mirroring it into the cache
/// 5. Quota check on the finished file
/// 6. Handoff to the configured uploader
///
/// Any failure removes the staging file and the partial cache entry.
pub struct IngestionPipeline {
    cache: Arc<MemoryCache>,
    source: Arc<dyn ContentSource>,
    quota: QuotaGuard,
    staging: StagingArea,
    uploader: Option<Arc<dyn Uploader>>,
    locks: KeyedLocks,
    admission: Arc<Semaphore>,
    preflight: bool,
    request_timeout: Option<Duration>,
}

impl IngestionPipeline {
    pub fn new(
        cache: Arc<MemoryCache>,
        source: Arc<dyn ContentSource>,
        quota: QuotaGuard,
        staging: StagingArea,
    ) -> Self {
        Self {
            cache,
            source,
            quota,
            staging,
            uploader: None,
            locks: KeyedLocks::new(),
            admission: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            preflight: true,
            request_timeout: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Option<Arc<dyn Uploader>>) -> Self {
        self.uploader = uploader;
        self
    }

    /// Limit how many fetches run at once. Zero is treated as one.
    pub fn with_max_concurrent(mut self, permits: usize) -> Self {
        self.admission = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_preflight(mut self, enabled: bool) -> Self {
        self.preflight = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    /// Fetch permits not currently in use
    pub fn available_permits(&self) -> usize {
        self.admission.available_permits()
    }

    /// Ingest a raw object ID, validating it first.
    pub async fn ingest_str(&self, raw: &str) -> Result<Artifact> {
        let id = ObjectId::new(raw)?;
        self.ingest(&id).await
    }

    /// Ingest `id`, from the cache when possible.
    ///
    /// Returns the artifact on success. On error nothing is left behind: no
    /// staging file, no cache entry. Dropping the returned future has the
    /// same effect.
    pub async fn ingest(&self, id: &ObjectId) -> Result<Artifact> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.ingest_locked(id))
                .await
                .map_err(|_| {
                    warn!("Ingestion of {} timed out after {:?}", id, limit);
                    StageError::TimedOut(limit)
                })?,
            None => self.ingest_locked(id).await,
        }
    }

    async fn ingest_locked(&self, id: &ObjectId) -> Result<Artifact> {
        // A fill in progress for this ID is only visible while its lock is
        // held, so lookups go through the lock too.
        let _key = self.locks.lock(id).await;

        if let Some(payload) = self.cache.get(id) {
            info!("Cache hit for {} ({} bytes)", id, payload.len());
            return Ok(Artifact::from_cache(id.clone(), payload));
        }

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| StageError::FetchFailed("Admission gate closed".to_string()))?;

        debug!("Cache miss for {}, fetching from {}", id, self.source.name());
        let result = self.fetch_and_stage(id).await;
        match &result {
            Ok(artifact) => info!(
                "Ingested {} ({} bytes, uploaded: {})",
                id, artifact.size, artifact.uploaded
            ),
            Err(e) => warn!("Ingestion of {} failed: {}", id, e),
        }
        result
    }

    async fn fetch_and_stage(&self, id: &ObjectId) -> Result<Artifact> {
        let content = self.source.fetch(id).await?;

        if self.preflight {
            if let Some(len) = content.content_length {
                self.quota.preflight(len).await?.into_result()?;
            }
        }

        let mut writer = self.staging.begin(id).await?;
        let mut fill = CacheFill::start(&self.cache, id);
        let mut chunks = content.chunks;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            writer.write(&chunk).await?;
            fill.append(&chunk);
        }

        if let Some(expected) = content.content_length {
            if writer.written() != expected {
                return Err(StageError::FetchFailed(format!(
                    "Expected {} bytes for {}, received {}",
                    expected,
                    id,
                    writer.written()
                )));
            }
        }

        // Removed on any early return, including a dropped future.
        let staged = writer.commit().await?;
        debug!("Staged {} at {}", id, staged.path().display());

        self.quota.check_quota().await?.into_result()?;

        let uploaded = match &self.uploader {
            Some(uploader) => {
                uploader.upload(id, staged.path()).await?;
                true
            }
            None => false,
        };

        let payload = if fill.finish() {
            self.cache.get(id)
        } else {
            None
        };
        let size = staged.size();
        let staged_path = staged.keep();

        Ok(Artifact {
            id: id.clone(),
            origin: ArtifactOrigin::Fetched,
            size,
            payload,
            staged_path: Some(staged_path),
            uploaded,
            completed_at: Utc::now(),
        })
    }
}

/// Mirrors a fetch into the cache and removes the entry unless finished.
struct CacheFill<'a> {
    cache: &'a MemoryCache,
    id: &'a ObjectId,
    expected_len: u64,
    active: bool,
    finished: bool,
}

impl<'a> CacheFill<'a> {
    fn start(cache: &'a MemoryCache, id: &'a ObjectId) -> Self {
        // Stale entry from an earlier run must not prefix this payload.
        cache.clear(id);
        Self {
            cache,
            id,
            expected_len: 0,
            active: true,
            finished: false,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        if !self.active {
            return;
        }
        self.expected_len += chunk.len() as u64;
        match self.cache.append(self.id, chunk) {
            AppendOutcome::Stored(len) if len == self.expected_len => {}
            AppendOutcome::Stored(_) => {
                // Dropped by the total budget mid-fill; the rest would be a tail.
                self.cache.clear(self.id);
                self.active = false;
            }
            AppendOutcome::Evicted => {
                debug!("{} exceeds the cache entry limit, staging only", self.id);
                self.active = false;
            }
        }
    }

    /// Keep the entry. Returns whether the full payload is cached.
    fn finish(mut self) -> bool {
        self.finished = true;
        self.active
    }
}

impl Drop for CacheFill<'_> {
    fn drop(&mut self) {
        if !self.finished && self.active {
            self.cache.clear(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingUploader, Script, ScriptedSource, SimulatedUsage};
    use std::path::Path;

    const CEILING: u64 = 10_000;

    struct Harness {
        _dir: tempfile::TempDir,
        source: Arc<ScriptedSource>,
        usage: Arc<SimulatedUsage>,
        pipeline: IngestionPipeline,
    }

    fn harness(source: ScriptedSource, entry_limit: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let usage = Arc::new(SimulatedUsage::new(0));
        let pipeline = IngestionPipeline::new(
            Arc::new(MemoryCache::new(entry_limit, entry_limit * 4)),
            source.clone(),
            QuotaGuard::new(usage.clone(), CEILING),
            StagingArea::new(dir.path().join("staging"), "mp4"),
        );
        Harness {
            _dir: dir,
            source,
            usage,
            pipeline,
        }
    }

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    fn staged_files(root: &Path) -> Vec<String> {
        match std::fs::read_dir(root) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fetch_stages_and_caches() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"0123456789", 3)),
            100,
        );

        let artifact = h.pipeline.ingest(&id("abc")).await.unwrap();

        assert_eq!(artifact.origin, ArtifactOrigin::Fetched);
        assert_eq!(artifact.size, 10);
        assert_eq!(artifact.payload.as_deref(), Some(&b"0123456789"[..]));
        assert!(!artifact.uploaded);
        let path = artifact.staged_path.unwrap();
        assert_eq!(path, h.pipeline.staging().path_for(&id("abc")));
        assert_eq!(std::fs::read(path).unwrap(), b"0123456789");
        assert_eq!(
            h.pipeline.cache().get(&id("abc")).as_deref(),
            Some(&b"0123456789"[..])
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );

        h.pipeline.ingest(&id("abc")).await.unwrap();
        let second = h.pipeline.ingest(&id("abc")).await.unwrap();

        assert!(second.is_cache_hit());
        assert_eq!(second.payload.as_deref(), Some(&b"payload"[..]));
        assert_eq!(h.source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_ignores_quota() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        h.pipeline.ingest(&id("abc")).await.unwrap();

        h.usage.set(CEILING);
        assert!(h.pipeline.ingest(&id("abc")).await.unwrap().is_cache_hit());
    }

    #[tokio::test]
    async fn test_oversized_payload_is_staged_but_not_cached() {
        let payload = vec![7u8; 64];
        let h = harness(
            ScriptedSource::new().with("big", Script::payload(&payload, 16)),
            32,
        );

        let artifact = h.pipeline.ingest(&id("big")).await.unwrap();

        assert_eq!(artifact.size, 64);
        assert!(artifact.payload.is_none());
        assert!(!h.pipeline.cache().contains(&id("big")));
        assert_eq!(std::fs::read(artifact.staged_path.unwrap()).unwrap(), payload);

        // Not cached, so the next call fetches again.
        h.pipeline.ingest(&id("big")).await.unwrap();
        assert_eq!(h.source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_midstream_failure_leaves_nothing() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"0123456789", 3).failing_after(2)),
            100,
        );

        let err = h.pipeline.ingest(&id("abc")).await.unwrap_err();

        assert!(matches!(err, StageError::FetchFailed(_)));
        assert!(h.pipeline.cache().get(&id("abc")).is_none());
        assert!(staged_files(h.pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_is_fetch_failed() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::unreachable("dns error")),
            100,
        );
        let err = h.pipeline.ingest(&id("abc")).await.unwrap_err();
        assert!(matches!(err, StageError::FetchFailed(ref m) if m == "dns error"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_short_body_is_fetch_failed() {
        let h = harness(
            ScriptedSource::new().with(
                "abc",
                Script::payload(b"0123", 2).with_content_length(10),
            ),
            100,
        );
        h.pipeline.ingest(&id("abc")).await.unwrap_err();
        assert!(!h.pipeline.cache().contains(&id("abc")));
        assert!(staged_files(h.pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_quota_exceeded_after_write_removes_file() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        let pipeline = h.pipeline.with_preflight(false);
        h.usage.set(CEILING);

        let err = pipeline.ingest(&id("abc")).await.unwrap_err();

        assert!(matches!(
            err,
            StageError::QuotaExceeded {
                used: CEILING,
                ceiling: CEILING
            }
        ));
        assert!(!err.is_retryable());
        assert!(!pipeline.cache().contains(&id("abc")));
        assert!(staged_files(pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_preflight_refuses_before_download() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        h.usage.set(CEILING - 3);

        let err = h.pipeline.ingest(&id("abc")).await.unwrap_err();

        assert!(matches!(err, StageError::QuotaExceeded { .. }));
        assert!(staged_files(h.pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_usage_just_below_ceiling_passes() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        let pipeline = h.pipeline.with_preflight(false);
        h.usage.set(CEILING - 1);
        pipeline.ingest(&id("abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_receives_staged_file() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        let uploader = Arc::new(RecordingUploader::new());
        let pipeline = h.pipeline.with_uploader(Some(uploader.clone()));

        let artifact = pipeline.ingest(&id("abc")).await.unwrap();

        assert!(artifact.uploaded);
        assert_eq!(uploader.uploads(), vec![(id("abc"), b"payload".to_vec())]);
    }

    #[tokio::test]
    async fn test_upload_failure_cleans_up() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        let pipeline = h
            .pipeline
            .with_uploader(Some(Arc::new(RecordingUploader::failing("bucket gone"))));

        let err = pipeline.ingest(&id("abc")).await.unwrap_err();

        assert!(matches!(err, StageError::UploadFailed(_)));
        assert!(!pipeline.cache().contains(&id("abc")));
        assert!(staged_files(pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_fetch() {
        let h = harness(ScriptedSource::new(), 100);
        let err = h.pipeline.ingest_str("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StageError::InvalidObjectId(_)));
        assert_eq!(h.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_up() {
        let h = harness(
            ScriptedSource::new().with(
                "slow",
                Script::payload(b"0123456789", 2).with_delay(Duration::from_millis(50)),
            ),
            100,
        );
        let pipeline = h
            .pipeline
            .with_request_timeout(Some(Duration::from_millis(80)));

        let err = pipeline.ingest(&id("slow")).await.unwrap_err();

        assert!(matches!(err, StageError::TimedOut(_)));
        assert!(!pipeline.cache().contains(&id("slow")));
        assert!(staged_files(pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_timeout_during_upload_removes_staged_file() {
        let h = harness(
            ScriptedSource::new().with("abc", Script::payload(b"payload", 4)),
            100,
        );
        let uploader = RecordingUploader::new().with_delay(Duration::from_millis(500));
        let pipeline = h
            .pipeline
            .with_uploader(Some(Arc::new(uploader)))
            .with_request_timeout(Some(Duration::from_millis(100)));

        let err = pipeline.ingest(&id("abc")).await.unwrap_err();

        assert!(matches!(err, StageError::TimedOut(_)));
        assert!(!pipeline.cache().contains(&id("abc")));
        assert!(staged_files(pipeline.staging().root()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_same_id_fetches_once() {
        let h = harness(
            ScriptedSource::new().with(
                "abc",
                Script::payload(b"0123456789", 2).with_delay(Duration::from_millis(5)),
            ),
            100,
        );
        let pipeline = Arc::new(h.pipeline);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move { pipeline.ingest(&id("abc")).await })
            })
            .collect();

        let mut hits = 0;
        for task in tasks {
            let artifact = task.await.unwrap().unwrap();
            assert_eq!(artifact.size, 10);
            assert_eq!(artifact.payload.as_deref(), Some(&b"0123456789"[..]));
            if artifact.is_cache_hit() {
                hits += 1;
            }
        }
        assert_eq!(h.source.fetch_count(), 1);
        assert_eq!(hits, 4);
    }

    #[tokio::test]
    async fn test_admission_limits_concurrent_fetches() {
        let mut source = ScriptedSource::new();
        for name in ["a", "b", "c", "d"] {
            source = source.with(
                name,
                Script::payload(b"xxxx", 1).with_delay(Duration::from_millis(20)),
            );
        }
        let h = harness(source, 100);
        let pipeline = Arc::new(h.pipeline.with_max_concurrent(2));

        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move { pipeline.ingest(&id(name)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pipeline.available_permits(), 0);

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(pipeline.available_permits(), 2);
    }
}
