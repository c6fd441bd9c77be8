//! Temp-file naming and deterministic removal.
//!
//! Every file a job touches lives in the configured temp root as
//! `{jobId}_{role}{ext}`. Functions that create such files wrap them in a
//! [`TempPath`] immediately, so the file is removed on every exit path
//! (error, cancellation, panic) unless ownership is explicitly released.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Naming scheme for one job's files.
#[derive(Debug, Clone)]
pub struct JobPaths {
    root: PathBuf,
    job_id: String,
}

impl JobPaths {
    pub fn new(root: impl Into<PathBuf>, job_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            job_id: job_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{jobId}_{role}{ext}`; `ext` includes its dot or is empty.
    pub fn file(&self, role: &str, ext: &str) -> PathBuf {
        self.root.join(self.file_name(role, ext))
    }

    pub fn file_name(&self, role: &str, ext: &str) -> String {
        format!("{}_{}{}", self.job_id, role, ext)
    }

    /// Prefix shared by all of this job's entries.
    pub fn prefix(&self) -> String {
        format!("{}_", self.job_id)
    }
}

/// Owns a temp file or directory and removes it on drop.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    armed: bool,
}

impl TempPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release ownership; the path is no longer removed on drop.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl AsRef<Path> for TempPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.armed {
            cleanup(Some(self.path.as_path()));
        }
    }
}

/// Remove a file or directory tree. Missing, empty and `None` paths are fine.
pub fn cleanup(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if path.as_os_str().is_empty() {
        return;
    }

    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => debug!(path = %path.display(), "Removed temp path"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp path"),
    }
}

/// Remove every `{jobId}_*` entry under `root`. Returns how many were removed.
pub async fn purge_job_files(root: &Path, job_id: &str) -> usize {
    let prefix = format!("{job_id}_");
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix));
        if matches {
            cleanup(Some(entry.path().as_path()));
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(job_id, removed, "Purged leftover job files");
    }
    removed
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path("creating directory", path, e))
}

/// Size of a file in bytes.
pub async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| Error::io_path("reading metadata of", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_paths_naming() {
        let paths = JobPaths::new("/tmp/vf", "ab12cd34");
        assert_eq!(
            paths.file("input", ".mkv"),
            PathBuf::from("/tmp/vf/ab12cd34_input.mkv")
        );
        assert_eq!(paths.file_name("torrent", ""), "ab12cd34_torrent");
        assert_eq!(paths.prefix(), "ab12cd34_");
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x_input.mp4");
        std::fs::write(&file, b"data").unwrap();

        cleanup(Some(&file));
        assert!(!file.exists());
        cleanup(Some(&file));
        cleanup(None);
        cleanup(Some(Path::new("")));
    }

    #[test]
    fn test_cleanup_removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("x_torrent");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("nested/file.bin"), b"1").unwrap();

        cleanup(Some(&tree));
        assert!(!tree.exists());
    }

    #[test]
    fn test_temp_path_guard() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join("a_out.mp4");
        let kept = dir.path().join("b_out.mp4");
        std::fs::write(&dropped, b"1").unwrap();
        std::fs::write(&kept, b"1").unwrap();

        drop(TempPath::new(&dropped));
        let released = TempPath::new(&kept).keep();

        assert!(!dropped.exists());
        assert_eq!(released, kept);
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_purge_job_files_only_touches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job1_input.mp4"), b"1").unwrap();
        std::fs::write(dir.path().join("job1_subs.srt"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("job1_torrent")).unwrap();
        std::fs::write(dir.path().join("job2_input.mp4"), b"1").unwrap();

        assert_eq!(purge_job_files(dir.path(), "job1").await, 3);
        assert!(dir.path().join("job2_input.mp4").exists());
        assert_eq!(purge_job_files(dir.path(), "job1").await, 0);
    }
}
