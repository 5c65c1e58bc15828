//! Remote directory walker
//!
//! Depth-first, lazy traversal of a remote tree. Only regular files are
//! yielded; directories are descended into in the order the server lists them.

use anyhow::Result;
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::{join_remote, RemoteChannel, RemoteEntry};

/// Lazy depth-first walker over a remote directory
///
/// The walker keeps no connection state of its own, so the channel may be
/// reconnected between calls to [`RemoteWalker::next`].
#[derive(Debug)]
pub struct RemoteWalker {
    root: String,
    strict: bool,
    started: bool,
    /// Directory path and its not yet visited entries
    stack: Vec<(String, VecDeque<RemoteEntry>)>,
}

impl RemoteWalker {
    /// Walk `root`, relative to the channel's current directory
    ///
    /// In strict mode a subdirectory that cannot be listed ends the walk with
    /// an error; otherwise it is logged and skipped.
    pub fn new(root: impl Into<String>, strict: bool) -> Self {
        Self {
            root: root.into(),
            strict,
            started: false,
            stack: Vec::new(),
        }
    }

    /// Next regular file, with `relative_path` prefixed by the walk root
    pub async fn next<C>(&mut self, channel: &mut C) -> Option<Result<RemoteEntry>>
    where
        C: RemoteChannel + ?Sized,
    {
        if !self.started {
            self.started = true;
            match channel.list_dir(&self.root).await {
                Ok(entries) => self.stack.push((self.root.clone(), entries.into())),
                Err(e) => return Some(Err(e.context(format!("Failed to list {}", self.root)))),
            }
        }

        loop {
            let next = match self.stack.last_mut() {
                None => return None,
                Some((dir, entries)) => entries
                    .pop_front()
                    .map(|entry| (join_remote(dir, &entry.relative_path), entry)),
            };

            let Some((path, mut entry)) = next else {
                self.stack.pop();
                continue;
            };

            if entry.is_dir() {
                match channel.list_dir(&path).await {
                    Ok(children) => {
                        debug!("Descending into {} ({} entries)", path, children.len());
                        self.stack.push((path, children.into()));
                    }
                    Err(e) if self.strict => {
                        return Some(Err(e.context(format!("Failed to list {}", path))));
                    }
                    Err(e) => warn!("Skipping unlistable directory {}: {:#}", path, e),
                }
                continue;
            }

            entry.relative_path = path;
            return Some(Ok(entry));
        }
    }

    /// Drain the walker into a vector
    pub async fn collect<C>(mut self, channel: &mut C) -> Result<Vec<RemoteEntry>>
    where
        C: RemoteChannel + ?Sized,
    {
        let mut files = Vec::new();
        while let Some(entry) = self.next(channel).await {
            files.push(entry?);
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::SystemTime;
    use tokio::io::AsyncWrite;

    /// In-memory tree: directory path -> listing
    struct TreeChannel {
        dirs: HashMap<String, Vec<RemoteEntry>>,
        listed: Vec<String>,
    }

    fn file(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            relative_path: name.to_string(),
            size,
            mode_bits: 0o100644,
            mtime: SystemTime::UNIX_EPOCH,
            atime: SystemTime::UNIX_EPOCH,
        }
    }

    fn dir(name: &str) -> RemoteEntry {
        RemoteEntry {
            mode_bits: 0o040755,
            ..file(name, 4096)
        }
    }

    #[async_trait]
    impl RemoteChannel for TreeChannel {
        async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
            self.listed.push(path.to_string());
            self.dirs
                .get(path)
                .cloned()
                .ok_or_else(|| MirrorError::transport_error_with_path("Permission denied", path).into())
        }

        async fn read_file(
            &mut self,
            _path: &str,
            _sink: &mut (dyn AsyncWrite + Unpin + Send),
            _on_chunk: &mut (dyn FnMut(usize) + Send),
        ) -> Result<u64> {
            unreachable!()
        }

        async fn read_ranges(&mut self, _path: &str, _ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
            unreachable!()
        }

        fn max_request_size(&self) -> u64 {
            32768
        }

        async fn current_dir(&mut self) -> Result<String> {
            Ok("/".to_string())
        }

        async fn change_dir(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn tree() -> TreeChannel {
        let mut dirs = HashMap::new();
        dirs.insert("show".to_string(), vec![file("z.nfo", 10), dir("s01"), dir("locked"), file("a.nfo", 20)]);
        dirs.insert("show/s01".to_string(), vec![file("e02.mkv", 2), dir("extras"), file("e01.mkv", 1)]);
        dirs.insert("show/s01/extras".to_string(), vec![]);
        TreeChannel { dirs, listed: Vec::new() }
    }

    #[tokio::test]
    async fn test_depth_first_in_listing_order() {
        let mut channel = tree();
        let files = RemoteWalker::new("show", false).collect(&mut channel).await.unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["show/z.nfo", "show/s01/e02.mkv", "show/s01/e01.mkv", "show/a.nfo"]);
        assert_eq!(files[3].size, 20);
    }

    #[tokio::test]
    async fn test_unlistable_subdirectory_is_skipped() {
        let mut channel = tree();
        let files = RemoteWalker::new("show", false).collect(&mut channel).await.unwrap();
        assert_eq!(files.len(), 4);
        assert!(channel.listed.contains(&"show/locked".to_string()));
    }

    #[tokio::test]
    async fn test_strict_mode_propagates() {
        let mut channel = tree();
        let err = RemoteWalker::new("show", true).collect(&mut channel).await.unwrap_err();
        assert!(format!("{:#}", err).contains("show/locked"));
    }

    #[tokio::test]
    async fn test_root_failure_always_propagates() {
        let mut channel = tree();
        let mut walker = RemoteWalker::new("missing", false);
        assert!(walker.next(&mut channel).await.unwrap().is_err());
        assert!(walker.next(&mut channel).await.is_none());
    }

    #[tokio::test]
    async fn test_walk_is_lazy() {
        let mut channel = tree();
        let mut walker = RemoteWalker::new("show", false);
        let first = walker.next(&mut channel).await.unwrap().unwrap();
        assert_eq!(first.relative_path, "show/z.nfo");
        assert_eq!(channel.listed, vec!["show".to_string()]);
    }
}
