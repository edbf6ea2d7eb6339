//! Long-lived staging service
//!
//! Builds the cache, fetcher, quota guard, uploader and pipeline once from a
//! [`Config`] and keeps the reclaimer running beside them.

use std::sync::Arc;
use std::time::SystemTime;

use futures::stream::{self, StreamExt};

use crate::cache::MemoryCache;
use crate::config::Config;
use crate::error::{Result, StageError};
use crate::fetch::{ContentSource, HttpFetcher};
use crate::ingest::{IngestionPipeline, StagingArea};
use crate::quota::{QuotaGuard, QuotaStatus};
use crate::reclaim::{ReclaimReport, Reclaimer, ReclaimerHandle};
use crate::types::Artifact;
use crate::upload;

pub struct StagingService {
    config: Config,
    pipeline: Arc<IngestionPipeline>,
    reclaimer: Reclaimer,
    reclaimer_handle: Option<ReclaimerHandle>,
}

impl StagingService {
    /// Start with the HTTP fetcher described by `config.fetch`.
    pub async fn start(config: Config) -> Result<Self> {
        let source: Arc<dyn ContentSource> = Arc::new(HttpFetcher::new(&config.fetch)?);
        Self::start_with_source(config, source).await
    }

    /// Start with a caller-supplied content source.
    pub async fn start_with_source(config: Config, source: Arc<dyn ContentSource>) -> Result<Self> {
        config.validate()?;
        let root = config.staging.root.clone();
        tracing::info!("Initializing staging root at: {}", root.display());
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            StageError::PersistFailed(format!(
                "Failed to create staging root {}: {}",
                root.display(),
                e
            ))
        })?;

        let cache = Arc::new(MemoryCache::from_config(&config.cache));
        let quota = QuotaGuard::from_config(&config.quota, &root);
        let uploader = upload::from_config(&config.upload)?;
        if let Some(uploader) = &uploader {
            tracing::info!("Handing off staged files to the {} store", uploader.name());
        }

        let pipeline = IngestionPipeline::new(
            cache,
            source,
            quota,
            StagingArea::new(&root, config.staging.extension.clone()),
        )
        .with_uploader(uploader)
        .with_max_concurrent(config.ingest.max_concurrent)
        .with_preflight(config.quota.preflight)
        .with_request_timeout(config.ingest.request_timeout());

        let reclaimer = Reclaimer::from_config(&config.reclaim, &root);
        let reclaimer_handle = Some(reclaimer.clone().spawn());

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            reclaimer,
            reclaimer_handle,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub async fn ingest(&self, id: &str) -> Result<Artifact> {
        self.pipeline.ingest_str(id).await
    }

    /// Ingest several IDs at once, returning results in input order.
    ///
    /// Concurrency is still bounded by the pipeline's admission gate.
    pub async fn ingest_all<I>(&self, ids: I) -> Vec<(String, Result<Artifact>)>
    where
        I: IntoIterator<Item = String>,
    {
        let ids: Vec<String> = ids.into_iter().collect();
        let width = ids.len().max(1);
        stream::iter(ids)
            .map(|id| async move {
                let result = self.pipeline.ingest_str(&id).await;
                (id, result)
            })
            .buffered(width)
            .collect()
            .await
    }

    /// Run one reclaim sweep now.
    pub async fn reclaim_once(&self) -> Result<ReclaimReport> {
        self.reclaimer
            .sweep(SystemTime::now())
            .await
            .map_err(|e| StageError::PersistFailed(e.to_string()))
    }

    pub async fn quota_status(&self) -> Result<QuotaStatus> {
        self.pipeline.quota().check_quota().await
    }

    /// Stop the reclaimer. In-flight ingestions are not waited on.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.reclaimer_handle.take() {
            handle.shutdown().await;
        }
        tracing::info!("Staging service stopped");
    }
}
