//! A minimal, filesystem-backed stand-in for the object store.
//!
//! The real `ObjectStore` (container database, replication, orphan GC) is an external
//! collaborator this crate assumes rather than implements. To have a runnable binary at all, this
//! module persists object data and a metadata sidecar directly on disk, scoped under one root
//! directory per node. It exists only to give [`zvm_exec::AppState`] something real to read from
//! and write to; nothing here is part of the execution middleware itself.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use zvm_exec::{CommitError, CommitSink, LocalContainerInfo, LocalObjectInfo, ObjectLookup, ObjectMetadata, ValidationSink};

/// On-disk sidecar recording everything about an object besides its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectSidecar {
    timestamp: String,
    content_type: String,
    etag: String,
    content_length: u64,
    extra_meta: HashMap<String, String>,
    validated: Option<String>,
}

/// Stores object data under `<root>/<account>/<container>/<object>`, with a `.meta.json` sidecar
/// next to each data file. A single process-wide lock serializes metadata sidecar updates, since
/// this stand-in has none of the real store's single-writer guarantees.
pub struct FsObjectStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsObjectStore {
    /// Scope a store under `root`, creating it if it doesn't already exist.
    pub fn new(root: PathBuf) -> anyhow::Result<FsObjectStore> {
        fs::create_dir_all(&root).with_context(|| format!("Failed to create object store root {root:?}"))?;
        Ok(FsObjectStore { root, lock: Mutex::new(()) })
    }

    fn object_dir(&self, account: &str, container: &str) -> PathBuf {
        self.root.join(account).join(container)
    }

    fn data_path(&self, account: &str, container: &str, object: &str) -> PathBuf {
        self.object_dir(account, container).join(object)
    }

    fn sidecar_path(&self, account: &str, container: &str, object: &str) -> PathBuf {
        self.object_dir(account, container).join(format!("{object}.meta.json"))
    }

    fn container_db_path(&self, account: &str, container: &str) -> PathBuf {
        self.root.join(account).join(format!("{container}.db"))
    }

    fn read_sidecar(&self, account: &str, container: &str, object: &str) -> Option<ObjectSidecar> {
        let raw = fs::read(self.sidecar_path(account, container, object)).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

impl ObjectLookup for FsObjectStore {
    fn local_object(&self, account: &str, container: &str, object: &str) -> Option<LocalObjectInfo> {
        let data_path = self.data_path(account, container, object);
        let metadata = fs::metadata(&data_path).ok()?;
        let sidecar = self.read_sidecar(account, container, object)?;
        Some(LocalObjectInfo {
            data_path,
            content_length: metadata.len(),
            etag: sidecar.etag,
            validated: sidecar.validated,
            meta: sidecar.extra_meta,
        })
    }

    fn local_container(&self, account: &str, container: &str) -> Option<LocalContainerInfo> {
        let db_path = self.container_db_path(account, container);
        let metadata = fs::metadata(&db_path).ok()?;
        Some(LocalContainerInfo { db_path, db_size: metadata.len() })
    }
}

impl CommitSink for FsObjectStore {
    fn write_metadata(
        &self,
        account: &str,
        container: &str,
        object: &str,
        metadata: ObjectMetadata,
    ) -> Result<(), CommitError> {
        let _guard = self.lock.lock().unwrap();
        let dir = self.object_dir(account, container);
        fs::create_dir_all(&dir).map_err(to_commit_error)?;
        let sidecar = ObjectSidecar {
            timestamp: metadata.timestamp,
            content_type: metadata.content_type,
            etag: metadata.etag,
            content_length: metadata.content_length,
            extra_meta: metadata.extra_meta,
            validated: self.read_sidecar(account, container, object).and_then(|s| s.validated),
        };
        let encoded = serde_json::to_vec(&sidecar).context("Failed to encode object metadata")?;
        fs::write(self.sidecar_path(account, container, object), encoded).map_err(to_commit_error)?;
        Ok(())
    }
}

impl ValidationSink for FsObjectStore {
    fn mark_validated(&self, account: &str, container: &str, object: &str, etag: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.sidecar_path(account, container, object);
        let mut sidecar = self
            .read_sidecar(account, container, object)
            .with_context(|| format!("No metadata sidecar for {account}/{container}/{object}"))?;
        sidecar.validated = Some(etag.to_string());
        let encoded = serde_json::to_vec(&sidecar)?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

/// `ENOSPC` maps to `CommitError::NoSpace`; anything else is an opaque store failure.
fn to_commit_error(e: std::io::Error) -> CommitError {
    if e.raw_os_error() == Some(libc_enospc()) {
        CommitError::NoSpace
    } else {
        CommitError::Other(e.into())
    }
}

const fn libc_enospc() -> i32 {
    28
}
