use std::collections::HashMap;
use std::path::PathBuf;

use zvm_dag::{AccessFlags, Channel, JobSpec, LocalObjectBinding, Location};
use zvm_store::TempArea;

use crate::config::NodeConfig;
use crate::error::NodeError;

/// What the `ChannelResolver` needs to know about the request's own local object/container, a
/// seam standing in for the out-of-scope `ObjectStore`.
pub trait ObjectLookup: Send + Sync {
    /// Look up an existing object's on-disk data file and metadata.
    fn local_object(&self, account: &str, container: &str, object: &str) -> Option<LocalObjectInfo>;
    /// Look up a container's database file.
    fn local_container(&self, account: &str, container: &str) -> Option<LocalContainerInfo>;
}

/// What the resolver needs from a resolved local object to wire up a `GET`-access channel.
#[derive(Debug, Clone)]
pub struct LocalObjectInfo {
    /// Path to the object's on-disk data file.
    pub data_path: PathBuf,
    /// The stored `Content-Length` of the object.
    pub content_length: u64,
    /// The object's current `ETag`.
    pub etag: String,
    /// The object's stored `Validated` marker, if any (compared against `etag` by `is_validated`).
    pub validated: Option<String>,
    /// The object's stored metadata (`x-object-meta-*` keys already stripped of the prefix).
    pub meta: HashMap<String, String>,
}

/// What the resolver needs from a resolved local container to wire up a `GET`-access channel.
#[derive(Debug, Clone)]
pub struct LocalContainerInfo {
    /// Path to the container's SQLite database file.
    pub db_path: PathBuf,
    /// The size in bytes of the database file.
    pub db_size: u64,
}

/// Resolves every channel of `job` to a local path, a null device, or a network endpoint,
/// following the seven ordered rules of the channel resolution algorithm (first match wins), and
/// returns the indices of channels that must be streamed back in the response tar.
pub fn resolve(
    job: &mut JobSpec,
    binding: &mut LocalObjectBinding,
    uploaded_files: &HashMap<String, PathBuf>,
    lookup: &dyn ObjectLookup,
    config: &NodeConfig,
    temp_area: &TempArea,
) -> Result<Vec<usize>, NodeError> {
    let is_master = job.is_master();
    let mut response_channels = Vec::new();
    for i in 0..job.channels.len() {
        resolve_one(
            job,
            binding,
            i,
            uploaded_files,
            lookup,
            config,
            temp_area,
            is_master,
            &mut response_channels,
        )?;
    }
    Ok(response_channels)
}

#[allow(clippy::too_many_arguments)]
fn resolve_one(
    job: &mut JobSpec,
    binding: &mut LocalObjectBinding,
    index: usize,
    uploaded_files: &HashMap<String, PathBuf>,
    lookup: &dyn ObjectLookup,
    config: &NodeConfig,
    temp_area: &TempArea,
    is_master: bool,
    response_channels: &mut Vec<usize>,
) -> Result<(), NodeError> {
    // Rule 1: an uploaded file named after this channel's device.
    if let Some(path) = uploaded_files.get(&job.channels[index].device) {
        job.channels[index].lpath = Some(path.clone());
        return Ok(());
    }

    // Rule 2: the channel's path names the request's own local object or container.
    if resolve_local_object(job, binding, index, lookup, config)? {
        return Ok(());
    }

    // Rule 3: a registered system-image device name.
    if let Some(sysimage_path) = config.sysimage_devices.get(&job.channels[index].device) {
        job.channels[index].lpath = Some(sysimage_path.clone());
        return Ok(());
    }

    // Rule 4: `stdin` with no declared path.
    let channel = &job.channels[index];
    if channel.device == "stdin" && channel.path.is_none() {
        job.channels[index].lpath = Some(PathBuf::from("/dev/null"));
        return Ok(());
    }

    let channel = &job.channels[index];
    let access = channel.access;

    // Rule 5: readable/CDR channels that still have no local resolution are unresolvable.
    if access.intersects(AccessFlags::READABLE | AccessFlags::CDR) {
        return Err(NodeError::BadRequest(format!(
            "Could not resolve channel path for device {:?}",
            channel.device
        )));
    }

    // Rule 6: writable channels get a fresh temp file.
    if access.contains(AccessFlags::WRITABLE) {
        let path = temp_area
            .mkstemp(&job.channels[index].device)
            .map_err(|e| NodeError::InternalError(format!("Failed to allocate temp file: {e:?}")))?;
        job.channels[index].lpath = Some(path);
        let is_local_object_channel = binding.channel == Some(index);
        if is_master && !is_local_object_channel {
            response_channels.push(index);
        }
        return Ok(());
    }

    // Rule 7: network channels are resolved by definition (the sandbox handles transport), no
    // local path is ever assigned.
    if access.contains(AccessFlags::NETWORK) {
        return Ok(());
    }

    Ok(())
}

/// Rule 2. Returns `Ok(true)` iff the channel's path named the request's local object/container
/// and was handled (whether or not it was wired to a readable path).
fn resolve_local_object(
    job: &mut JobSpec,
    binding: &mut LocalObjectBinding,
    index: usize,
    lookup: &dyn ObjectLookup,
    config: &NodeConfig,
) -> Result<bool, NodeError> {
    let Some(path) = job.channels[index].path.clone() else {
        return Ok(false);
    };
    if !matches!(path, Location::SwiftPath { .. }) {
        return Ok(false);
    }
    let is_object = path.is_local_object(&binding.account, &binding.container, binding.object.as_deref());
    let is_container = path.is_local_container(&binding.account, &binding.container);
    if !is_object && !is_container {
        return Ok(false);
    }

    let channel = &mut job.channels[index];
    let readable = channel.access.contains(AccessFlags::READABLE);

    if is_object {
        if readable {
            let info = lookup
                .local_object(&binding.account, &binding.container, binding.object.as_deref().unwrap_or_default())
                .ok_or_else(|| NodeError::NotFound("Local object not found".to_string()))?;
            if info.content_length > config.zerovm_maxinput {
                return Err(NodeError::PayloadTooLarge(
                    "Local object content length exceeds the configured input limit".to_string(),
                ));
            }
            channel.lpath = Some(info.data_path);
            channel.meta = Some(info.meta);
        }
        channel.path_info = Some(format!(
            "local object {}/{}/{}",
            binding.account,
            binding.container,
            binding.object.as_deref().unwrap_or_default()
        ));
    } else {
        if readable {
            let info = lookup
                .local_container(&binding.account, &binding.container)
                .ok_or_else(|| NodeError::NotFound("Local container not found".to_string()))?;
            if info.db_size > config.zerovm_maxinput {
                return Err(NodeError::PayloadTooLarge(
                    "Local container database size exceeds the configured input limit".to_string(),
                ));
            }
            channel.lpath = Some(info.db_path);
        }
        channel.path_info = Some(format!("local container {}/{}", binding.account, binding.container));
    }

    binding.channel = Some(index);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zvm_store::{FilesystemOps, RealFilesystemOps};

    struct FakeLookup {
        object: Option<LocalObjectInfo>,
        container: Option<LocalContainerInfo>,
    }

    impl ObjectLookup for FakeLookup {
        fn local_object(&self, _: &str, _: &str, _: &str) -> Option<LocalObjectInfo> {
            self.object.clone()
        }
        fn local_container(&self, _: &str, _: &str) -> Option<LocalContainerInfo> {
            self.container.clone()
        }
    }

    fn config() -> NodeConfig {
        NodeConfig::parse(
            "zerovm_exename = /bin/true\n\
             zerovm_kill_timeout = 1\n\
             zerovm_maxnexe = 1\n\
             zerovm_threadpools = default = WaitPool(1,1)\n\
             zerovm_maxiops = 1\n\
             zerovm_maxinput = 1024\n\
             zerovm_maxoutput = 1024\n\
             zerovm_manifest_ver = 1\n\
             zerovm_timeout = 1\n\
             zerovm_maxnexemem = 1\n\
             disk_chunk_size = 1\n\
             network_chunk_size = 1\n\
             max_upload_time = 1\n",
        )
        .unwrap()
    }

    fn temp_area() -> TempArea {
        let fs: Arc<dyn FilesystemOps> = Arc::new(RealFilesystemOps);
        let dir = tempfile::tempdir().unwrap();
        TempArea::new(dir.path(), fs).unwrap()
    }

    #[test]
    fn uploaded_file_wins_over_everything_else() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new("input", AccessFlags::READABLE, "application/octet-stream")],
            colocated: None,
        };
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let mut uploaded = HashMap::new();
        uploaded.insert("input".to_string(), PathBuf::from("/tmp/uploaded-input"));
        let lookup = FakeLookup { object: None, container: None };
        let area = temp_area();

        let response = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap();
        assert!(response.is_empty());
        assert_eq!(job.channels[0].lpath, Some(PathBuf::from("/tmp/uploaded-input")));
    }

    #[test]
    fn readable_channel_naming_the_local_object_resolves_to_its_data_file() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new(
                "input",
                AccessFlags::READABLE,
                "application/octet-stream",
            )],
            colocated: None,
        };
        job.channels[0].path = Some(Location::SwiftPath {
            account: "a".into(),
            container: "c".into(),
            object: Some("o".into()),
        });
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let uploaded = HashMap::new();
        let lookup = FakeLookup {
            object: Some(LocalObjectInfo {
                data_path: PathBuf::from("/srv/node/a/c/o"),
                content_length: 5,
                etag: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
                validated: None,
                meta: HashMap::new(),
            }),
            container: None,
        };
        let area = temp_area();

        resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap();
        assert_eq!(job.channels[0].lpath, Some(PathBuf::from("/srv/node/a/c/o")));
        assert_eq!(binding.channel, Some(0));
    }

    #[test]
    fn oversize_local_object_is_rejected() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new(
                "input",
                AccessFlags::READABLE,
                "application/octet-stream",
            )],
            colocated: None,
        };
        job.channels[0].path = Some(Location::SwiftPath {
            account: "a".into(),
            container: "c".into(),
            object: Some("o".into()),
        });
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let uploaded = HashMap::new();
        let lookup = FakeLookup {
            object: Some(LocalObjectInfo {
                data_path: PathBuf::from("/srv/node/a/c/o"),
                content_length: 999_999,
                etag: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
                validated: None,
                meta: HashMap::new(),
            }),
            container: None,
        };
        let area = temp_area();

        let err = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap_err();
        assert!(matches!(err, NodeError::PayloadTooLarge(_)));
    }

    #[test]
    fn unresolvable_readable_channel_is_a_bad_request() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new(
                "mystery",
                AccessFlags::READABLE,
                "application/octet-stream",
            )],
            colocated: None,
        };
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let uploaded = HashMap::new();
        let lookup = FakeLookup { object: None, container: None };
        let area = temp_area();

        let err = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap_err();
        assert!(matches!(err, NodeError::BadRequest(_)));
    }

    #[test]
    fn writable_channel_gets_a_fresh_temp_file_and_joins_the_response_list() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new("stdout", AccessFlags::WRITABLE, "text/plain")],
            colocated: None,
        };
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let uploaded = HashMap::new();
        let lookup = FakeLookup { object: None, container: None };
        let area = temp_area();

        let response = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap();
        assert_eq!(response, vec![0]);
        assert!(job.channels[0].lpath.is_some());
    }

    #[test]
    fn non_master_replica_never_emits_response_channels() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 3,
            replicas: vec!["node-b".into()],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new("stdout", AccessFlags::WRITABLE, "text/plain")],
            colocated: None,
        };
        assert!(!job.is_master());
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        let uploaded = HashMap::new();
        let lookup = FakeLookup { object: None, container: None };
        let area = temp_area();

        let response = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn network_channel_needs_no_local_path() {
        let mut job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new("net0", AccessFlags::NETWORK, "application/octet-stream")],
            colocated: None,
        };
        let mut binding = LocalObjectBinding::new("a", "c", None);
        let uploaded = HashMap::new();
        let lookup = FakeLookup { object: None, container: None };
        let area = temp_area();

        let response = resolve(&mut job, &mut binding, &uploaded, &lookup, &config(), &area).unwrap();
        assert!(response.is_empty());
        assert!(job.channels[0].lpath.is_none());
        assert!(job.channels[0].is_resolved());
    }
}
