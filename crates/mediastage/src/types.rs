//! Core types for staged media objects
//!
//! Defines the object identifier used as cache key and staging filename,
//! and the artifact handle returned to callers of the ingestion pipeline.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};

/// Longest accepted identifier, in bytes
pub const MAX_OBJECT_ID_LEN: usize = 256;

/// Opaque identifier for a remote media object.
///
/// The ID doubles as a filename inside the staging root, so anything that
/// could escape that directory is rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(StageError::InvalidObjectId("empty id".to_string()));
        }
        if id.len() > MAX_OBJECT_ID_LEN {
            return Err(StageError::InvalidObjectId(format!(
                "id is {} bytes, limit is {MAX_OBJECT_ID_LEN}",
                id.len()
            )));
        }
        if id == "." || id == ".." {
            return Err(StageError::InvalidObjectId(format!("reserved name {id:?}")));
        }
        if let Some(c) = id
            .chars()
            .find(|c| matches!(c, '/' | '\\') || c.is_control())
        {
            return Err(StageError::InvalidObjectId(format!(
                "{id:?} contains forbidden character {c:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename of the completed staging file, e.g. `abc123.mp4`
    pub fn staging_file_name(&self, extension: &str) -> String {
        if extension.is_empty() {
            self.0.clone()
        } else {
            format!("{}.{}", self.0, extension)
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = StageError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ObjectId {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Where an artifact's bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactOrigin {
    /// Served from the memory cache without touching the network
    Cache,
    /// Streamed from the remote source during this call
    Fetched,
}

/// Handle to an ingested object returned by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// The ingested object
    pub id: ObjectId,
    /// Cache hit or fresh fetch
    pub origin: ArtifactOrigin,
    /// Payload length in bytes
    pub size: u64,
    /// Full payload, when it is held in memory
    #[serde(skip)]
    pub payload: Option<Bytes>,
    /// Completed staging file, set for fresh fetches
    pub staged_path: Option<PathBuf>,
    /// Whether the object was handed to the object store
    pub uploaded: bool,
    /// When the pipeline finished with this object
    pub completed_at: DateTime<Utc>,
}

impl Artifact {
    pub fn from_cache(id: ObjectId, payload: Bytes) -> Self {
        Self {
            id,
            origin: ArtifactOrigin::Cache,
            size: payload.len() as u64,
            payload: Some(payload),
            staged_path: None,
            uploaded: false,
            completed_at: Utc::now(),
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.origin == ArtifactOrigin::Cache
    }
}
