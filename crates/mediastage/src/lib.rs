//! Mediastage - Media ingestion and staging
//!
//! Fetches remote media objects as chunked streams, stages them on local
//! disk, mirrors small ones into a bounded in-memory cache, enforces a disk
//! quota, and reclaims stale staging files on a timer.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod quota;
pub mod reclaim;
pub mod service;
pub mod testing;
pub mod types;
pub mod upload;

pub use cache::MemoryCache;
pub use config::Config;
pub use error::{Result, StageError};
pub use ingest::IngestionPipeline;
pub use quota::{QuotaGuard, QuotaStatus};
pub use reclaim::{Reclaimer, ReclaimerHandle};
pub use service::StagingService;
pub use types::{Artifact, ArtifactOrigin, ObjectId};
