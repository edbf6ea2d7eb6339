//! Test utilities for mediastage - in-memory fakes for the I/O edges
//!
//! - [`SimulatedUsage`]: disk usage figure set by the test
//! - [`ScriptedSource`]: content source serving canned chunks, optionally
//!   failing midway or stalling
//! - [`RecordingUploader`]: uploader that keeps what it was handed

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use crate::error::{Result, StageError};
use crate::fetch::{ContentSource, FetchedContent};
use crate::quota::DiskUsage;
use crate::types::ObjectId;
use crate::upload::Uploader;

/// Disk usage controlled by the test.
#[derive(Debug, Default)]
pub struct SimulatedUsage {
    used: AtomicU64,
    failure: Mutex<Option<io::ErrorKind>>,
}

impl SimulatedUsage {
    pub fn new(used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            failure: Mutex::new(None),
        }
    }

    pub fn set(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }

    /// Make every later measurement fail with `kind`.
    pub fn fail_with(&self, kind: io::ErrorKind) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }
}

impl DiskUsage for SimulatedUsage {
    fn used_bytes(&self) -> io::Result<u64> {
        if let Some(kind) = *self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(io::Error::new(kind, "simulated usage failure"));
        }
        Ok(self.used.load(Ordering::SeqCst))
    }
}

/// Canned response for one object
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<Bytes>,
    /// Yield a transport error after this many chunks
    pub fail_after: Option<usize>,
    /// Advertised length; defaults to the sum of the chunks
    pub content_length: Option<u64>,
    /// Pause before each chunk
    pub chunk_delay: Duration,
    /// Fail when opening instead of streaming
    pub open_error: Option<String>,
}

impl Script {
    pub fn payload(payload: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: payload
                .chunks(chunk_size.max(1))
                .map(Bytes::copy_from_slice)
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn unreachable(reason: &str) -> Self {
        Self {
            open_error: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// Content source that serves scripts registered per object ID.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<ObjectId, Script>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: &str, script: Script) -> Self {
        self.set(id, script);
        self
    }

    pub fn set(&self, id: &str, script: Script) {
        if let Ok(id) = ObjectId::new(id) {
            self.scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, script);
        }
    }

    /// Number of `fetch` calls so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn fetch(&self, id: &ObjectId) -> Result<FetchedContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StageError::FetchFailed(format!("{id} returned 404 Not Found")))?;

        if let Some(reason) = script.open_error {
            return Err(StageError::FetchFailed(reason));
        }

        let content_length = script
            .content_length
            .or_else(|| Some(script.chunks.iter().map(|c| c.len() as u64).sum()));
        let fail_after = script.fail_after;
        let delay = script.chunk_delay;

        let mut items: Vec<Result<Bytes>> = script
            .chunks
            .into_iter()
            .take(fail_after.unwrap_or(usize::MAX))
            .map(Ok)
            .collect();
        if fail_after.is_some() {
            items.push(Err(StageError::FetchFailed(
                "connection reset by peer".to_string(),
            )));
        }

        let chunks = stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed();

        Ok(FetchedContent {
            content_length,
            chunks,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Uploader that keeps a copy of every file it receives.
#[derive(Debug, Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<(ObjectId, Vec<u8>)>>,
    failure: Mutex<Option<String>>,
    delay: Duration,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Mutex::new(Some(reason.to_string())),
            ..Self::default()
        }
    }

    /// Pause this long before every upload.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn uploads(&self) -> Vec<(ObjectId, Vec<u8>)> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, id: &ObjectId, path: &Path) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(StageError::UploadFailed(reason));
        }
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            StageError::UploadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), bytes));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
