//! Staging files on local disk
//!
//! Payloads are streamed into a hidden `.part` temp file inside the staging
//! root and renamed to `<id>.<ext>` once complete and synced. Until then the
//! temp file is deleted when the writer is dropped, so an aborted ingestion
//! leaves nothing behind that looks finished.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, StageError};
use crate::types::ObjectId;

/// The staging root and naming scheme
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    extension: String,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the staged file for `id`
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.staging_file_name(&self.extension))
    }

    /// Open a temp file for `id`, creating the root if needed.
    pub async fn begin(&self, id: &ObjectId) -> Result<StagingWriter> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            StageError::PersistFailed(format!(
                "Failed to create staging root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let root = self.root.clone();
        let prefix = format!(".{id}.");
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".part")
                .tempfile_in(&root)
        })
        .await
        .map_err(|e| StageError::PersistFailed(format!("Staging task failed: {e}")))?
        .map_err(|e| StageError::PersistFailed(format!("Failed to create staging file: {e}")))?;

        let (file, temp_path) = temp.into_parts();
        Ok(StagingWriter {
            file: File::from_std(file),
            temp_path,
            final_path: self.path_for(id),
            written: 0,
        })
    }
}

/// In-progress staging file
#[derive(Debug)]
pub struct StagingWriter {
    file: File,
    temp_path: TempPath,
    final_path: PathBuf,
    written: u64,
}

impl StagingWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await.map_err(|e| {
            StageError::PersistFailed(format!(
                "Failed to write {}: {}",
                self.temp_path.display(),
                e
            ))
        })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and move the file to its final name.
    pub async fn commit(self) -> Result<StagedFile> {
        let StagingWriter {
            mut file,
            temp_path,
            final_path,
            written,
        } = self;

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        synced.map_err(|e| {
            StageError::PersistFailed(format!("Failed to sync {}: {}", temp_path.display(), e))
        })?;

        let target = final_path.clone();
        tokio::task::spawn_blocking(move || temp_path.persist(&target))
            .await
            .map_err(|e| StageError::PersistFailed(format!("Staging task failed: {e}")))?
            .map_err(|e| {
                StageError::PersistFailed(format!(
                    "Failed to move staging file to {}: {}",
                    final_path.display(),
                    e.error
                ))
            })?;

        Ok(StagedFile {
            path: final_path,
            size: written,
            kept: false,
        })
    }
}

/// Completed staging file, removed on drop unless kept
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    size: u64,
    kept: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Leave the file in place and return its path.
    pub fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_commit_moves_to_final_name() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path().join("staging"), "mp4");

        let mut writer = area.begin(&id("abc")).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        assert_eq!(writer.written(), 11);

        let staged = writer.commit().await.unwrap();
        assert_eq!(staged.path(), area.path_for(&id("abc")));
        assert_eq!(staged.size(), 11);
        let path = staged.keep();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert_eq!(entries(area.root()), vec!["abc.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path(), "mp4");

        let mut writer = area.begin(&id("abc")).await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert_eq!(entries(dir.path()).len(), 1);
        drop(writer);

        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path(), "mp4");
        std::fs::write(area.path_for(&id("abc")), b"stale").unwrap();

        let mut writer = area.begin(&id("abc")).await.unwrap();
        writer.write(b"fresh").await.unwrap();
        let path = writer.commit().await.unwrap().keep();

        assert_eq!(std::fs::read(path).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_drop_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile {
            path: dir.path().join("gone.mp4"),
            size: 0,
            kept: false,
        };
        drop(staged);
    }

    #[tokio::test]
    async fn test_dropped_staged_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path(), "mp4");

        let mut writer = area.begin(&id("abc")).await.unwrap();
        writer.write(b"done").await.unwrap();
        let staged = writer.commit().await.unwrap();
        assert_eq!(entries(dir.path()), vec!["abc.mp4".to_string()]);
        drop(staged);

        assert!(entries(dir.path()).is_empty());
    }
}
