//! Directory cache
//!
//! Remembers which local directories a mirror run has already created so the
//! transfer engine does not issue a `mkdir` per file.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

use crate::error::MirrorError;

/// Result of a create-if-absent call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    /// Seen earlier in this run, no system call made
    Cached,
    /// Created now
    Created,
    /// Already present on disk
    Existed,
}

/// Create `dir` and its parents unless it already exists
pub async fn create_if_absent(dir: &Path) -> std::io::Result<DirStatus> {
    match fs::create_dir(dir).await {
        Ok(()) => Ok(DirStatus::Created),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if fs::metadata(dir).await?.is_dir() {
                Ok(DirStatus::Existed)
            } else {
                Err(e)
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(dir).await?;
            Ok(DirStatus::Created)
        }
        Err(e) => Err(e),
    }
}

/// Local directories created during the current run
#[derive(Debug, Default)]
pub struct DirectoryCache {
    created: HashSet<PathBuf>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `dir` exists, consulting the cache first
    pub async fn ensure(&mut self, dir: &Path) -> Result<DirStatus, MirrorError> {
        if self.created.contains(dir) {
            trace!("Directory cache hit: {}", dir.display());
            return Ok(DirStatus::Cached);
        }

        let status = create_if_absent(dir).await.map_err(|e| {
            MirrorError::storage_error_full("Failed to create directory", dir.display().to_string(), e.to_string())
        })?;
        debug!("Directory {} ({:?})", dir.display(), status);
        self.created.insert(dir.to_path_buf());
        Ok(status)
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.created.contains(dir)
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_creates_then_hits_cache() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a").join("b");
        let mut cache = DirectoryCache::new();

        assert_eq!(cache.ensure(&target).await.unwrap(), DirStatus::Created);
        assert!(target.is_dir());
        assert_eq!(cache.ensure(&target).await.unwrap(), DirStatus::Cached);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_directory_is_success() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirectoryCache::new();

        assert_eq!(cache.ensure(dir.path()).await.unwrap(), DirStatus::Existed);
        assert!(cache.contains(dir.path()));
    }

    #[tokio::test]
    async fn test_file_in_the_way_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let mut cache = DirectoryCache::new();
        assert!(cache.ensure(&blocker).await.is_err());
        assert!(cache.is_empty());
    }
}
