use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Error};
use uuid::Uuid;

use crate::fs_ops::FilesystemOps;

/// A scoped temporary-file/directory factory rooted under one storage device's `tmp/` directory.
///
/// Every `TempArea` owns a single uniquely-named scope directory; everything it produces lives
/// under that directory, so a single `remove_dir_all` on `Drop` unlinks all of it, even if the
/// request panics partway through. Two concurrently-live `TempArea`s rooted at the same device
/// never share a scope directory, so concurrent requests never observe each other's temp names.
pub struct TempArea {
    fs: Arc<dyn FilesystemOps>,
    scope_dir: PathBuf,
    next_id: std::sync::atomic::AtomicU64,
}

impl TempArea {
    /// Create a new scope under `device_tmp_root` (typically `<devices>/<device>/tmp/`).
    pub fn new(device_tmp_root: &Path, fs: Arc<dyn FilesystemOps>) -> Result<TempArea, Error> {
        let scope_dir = device_tmp_root.join(format!("req-{}", Uuid::new_v4()));
        fs.create_dir_all(&scope_dir)
            .with_context(|| format!("Failed to create temp scope at {}", scope_dir.display()))?;
        trace!("New temp area scope at {:?}", scope_dir);
        Ok(TempArea {
            fs,
            scope_dir,
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Allocate a path for a new, empty file inside this scope. The file itself is created so the
    /// path is safe to immediately open for writing.
    pub fn mkstemp(&self, name_hint: &str) -> Result<PathBuf, Error> {
        let path = self.unique_path(name_hint);
        self.fs
            .create_file(&path)
            .with_context(|| format!("Failed to create temp file at {}", path.display()))?;
        Ok(path)
    }

    /// Allocate a path for a new, empty directory inside this scope.
    pub fn mkdtemp(&self, name_hint: &str) -> Result<PathBuf, Error> {
        let path = self.unique_path(name_hint);
        self.fs
            .create_dir_all(&path)
            .with_context(|| format!("Failed to create temp directory at {}", path.display()))?;
        Ok(path)
    }

    /// The directory this scope's paths live under, for callers that need to join further
    /// sub-paths of their own (e.g. the sandbox's own directory layout).
    pub fn scope_dir(&self) -> &Path {
        &self.scope_dir
    }

    fn unique_path(&self, name_hint: &str) -> PathBuf {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.scope_dir.join(format!("{id:04}-{name_hint}"))
    }
}

impl Drop for TempArea {
    fn drop(&mut self) {
        if let Err(e) = self.fs.remove_dir_all(&self.scope_dir) {
            warn!(
                "Failed to clean up temp area scope at {:?}: {:?}",
                self.scope_dir, e
            );
        } else {
            trace!("Cleaned up temp area scope at {:?}", self.scope_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::fake::FakeFilesystemOps;
    use std::sync::Arc;

    #[test]
    fn produced_files_are_removed_on_drop() {
        let fake = Arc::new(FakeFilesystemOps::default());
        let scope_dir;
        let file_path;
        {
            let area = TempArea::new(Path::new("/dev0/tmp"), fake.clone()).unwrap();
            scope_dir = area.scope_dir().to_path_buf();
            file_path = area.mkstemp("input").unwrap();
            assert!(fake.exists(&file_path));
            assert!(fake.exists(&scope_dir));
        }
        assert!(!fake.exists(&scope_dir));
        // the whole scope dir is gone, so the file inside it can't be "found" either.
        assert!(!fake.created_files.lock().unwrap().contains(&file_path));
    }

    #[test]
    fn concurrent_areas_never_share_a_scope() {
        let fake = Arc::new(FakeFilesystemOps::default());
        let a = TempArea::new(Path::new("/dev0/tmp"), fake.clone()).unwrap();
        let b = TempArea::new(Path::new("/dev0/tmp"), fake.clone()).unwrap();
        assert_ne!(a.scope_dir(), b.scope_dir());
    }

    #[test]
    fn names_are_unique_within_a_scope() {
        let fake = Arc::new(FakeFilesystemOps::default());
        let area = TempArea::new(Path::new("/dev0/tmp"), fake).unwrap();
        let a = area.mkstemp("stdout").unwrap();
        let b = area.mkstemp("stdout").unwrap();
        assert_ne!(a, b);
    }
}
