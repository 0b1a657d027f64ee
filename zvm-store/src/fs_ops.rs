use std::fs::Permissions;
use std::io;
use std::path::Path;

/// The filesystem operations `TempArea` (and, elsewhere, the sandbox setup code) needs.
///
/// The original implementation patched the `os` module globally to run under test doubles; here
/// the same seam is a constructor-injected trait object so tests can supply an in-memory fake
/// without touching real disk.
pub trait FilesystemOps: Send + Sync {
    /// Create a directory and all of its missing parent directories.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Create an empty file, truncating it if it already exists.
    fn create_file(&self, path: &Path) -> io::Result<()>;
    /// Write the full content of `data` to `path`, creating or truncating it.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Remove a single file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Recursively remove a directory and everything in it.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Change the permission bits of a path.
    fn set_permissions(&self, path: &Path, perm: Permissions) -> io::Result<()>;
    /// Whether a path currently exists.
    fn exists(&self, path: &Path) -> bool;
}

/// The real, disk-backed implementation of `FilesystemOps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFilesystemOps;

impl FilesystemOps for RealFilesystemOps {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        std::fs::File::create(path).map(|_| ())
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn set_permissions(&self, path: &Path, perm: Permissions) -> io::Result<()> {
        std::fs::set_permissions(path, perm)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
/// A `FilesystemOps` that never touches disk, for exercising `TempArea`'s scoping logic without
/// real files.
pub(crate) mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFilesystemOps {
        pub created_dirs: Mutex<HashSet<std::path::PathBuf>>,
        pub created_files: Mutex<HashSet<std::path::PathBuf>>,
        pub removed: Mutex<Vec<std::path::PathBuf>>,
    }

    impl FilesystemOps for FakeFilesystemOps {
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.created_dirs.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        fn create_file(&self, path: &Path) -> io::Result<()> {
            self.created_files
                .lock()
                .unwrap()
                .insert(path.to_path_buf());
            Ok(())
        }

        fn write(&self, path: &Path, _data: &[u8]) -> io::Result<()> {
            self.create_file(path)
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.created_files.lock().unwrap().remove(path);
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            self.created_dirs.lock().unwrap().remove(path);
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn set_permissions(&self, _path: &Path, _perm: Permissions) -> io::Result<()> {
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.created_dirs.lock().unwrap().contains(path)
                || self.created_files.lock().unwrap().contains(path)
        }
    }
}
