use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use thiserror::Error;

use zvm_dag::{AccessFlags, ExecutionReport, JobSpec, LocalObjectBinding, NexeHeaders, RunCode};
use zvm_daemon::{DaemonClient, DaemonReaper};
use zvm_sandbox::{ChannelType, ManifestChannel, ManifestLimits, SandboxRunner};
use zvm_store::ReadFileIterator;
use zvm_tar::{archive_size, entry_chunks, header_block_size, TarEntryMeta};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::preamble;

/// Build the per-channel manifest lines for a resolved job, pulling quotas from the node's config
/// (the `zvm-dag` data model doesn't carry a per-channel quota, so every channel shares the node's
/// configured maxima).
pub fn build_manifest_channels(job: &JobSpec, config: &NodeConfig) -> Vec<ManifestChannel> {
    job.channels
        .iter()
        .map(|channel| ManifestChannel {
            source: channel
                .lpath
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            device: channel.device.clone(),
            etype: ChannelType::from_access(channel.access),
            tag: channel.path_info.clone().unwrap_or_default(),
            limits: ManifestLimits {
                reads: config.zerovm_maxiops,
                rbytes: config.zerovm_maxinput,
                writes: config.zerovm_maxiops,
                wbytes: config.zerovm_maxoutput,
            },
        })
        .collect()
}

/// Run the sandbox directly as a standalone child process and parse its report.
pub fn run_standalone(
    sandbox: &dyn SandboxRunner,
    manifest_path: &Path,
    timeout: Duration,
) -> Result<(RunCode, ExecutionReport), NodeError> {
    let (run_code, stdout, _stderr) = sandbox
        .run(manifest_path, timeout, &[])
        .map_err(|e| NodeError::InternalError(format!("Sandbox failed to run: {e:?}")))?;
    let report = parse_report(&stdout)?;
    Ok((run_code, report))
}

/// Send the manifest to a cached daemon, restarting it once via `reaper`/`boot_runner` if the
/// initial connection fails, and parse the resulting report.
pub fn run_daemon(
    client: &DaemonClient,
    reaper: &dyn DaemonReaper,
    boot_runner: &dyn SandboxRunner,
    boot_manifest_path: &Path,
    boot_timeout: Duration,
    manifest: &[u8],
    timeout: Duration,
) -> Result<(RunCode, ExecutionReport, bool), NodeError> {
    match client.send_manifest(manifest, timeout) {
        Ok((run_code, stdout)) => {
            let report = parse_report(&stdout)?;
            Ok((run_code, report, false))
        }
        Err(_) => {
            info!("Daemon connect failed, attempting restart");
            client
                .ensure_connected(reaper, boot_runner, boot_manifest_path, boot_timeout)
                .map_err(|_| NodeError::InternalError("Daemon unreachable after restart attempt".to_string()))?;
            let (run_code, stdout) = client
                .send_manifest(manifest, timeout)
                .map_err(|_| NodeError::InternalError("Daemon unreachable after restart attempt".to_string()))?;
            let report = parse_report(&stdout)?;
            Ok((run_code, report, true))
        }
    }
}

fn parse_report(stdout: &[u8]) -> Result<ExecutionReport, NodeError> {
    let text = String::from_utf8_lossy(stdout);
    ExecutionReport::parse(&text)
        .map_err(|e| NodeError::InternalError(format!("{e}")))
        .and_then(|report| {
            if report.return_code > 1 {
                Err(NodeError::InternalError(format!(
                    "Sandbox reported return code {}",
                    report.return_code
                )))
            } else {
                Ok(report)
            }
        })
}

/// Populate `headers` from a successfully parsed report and run code.
pub fn headers_from_report(headers: &mut NexeHeaders, report: &ExecutionReport, run_code: RunCode) {
    headers.apply_report(report, run_code);
}

/// Why committing a local writable channel's metadata failed.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The underlying device had no room left for the write.
    #[error("No space left on device")]
    NoSpace,
    /// Any other failure talking to the object store.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The metadata written back to the object store on a successful writable commit.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    /// `X-Timestamp` of the commit.
    pub timestamp: String,
    /// The channel's declared content type.
    pub content_type: String,
    /// The recomputed or reported ETag (32 lowercase hex characters).
    pub etag: String,
    /// The final content length of the committed file.
    pub content_length: u64,
    /// `x-object-meta-*` keys (prefix already stripped) to attach to the object.
    pub extra_meta: HashMap<String, String>,
}

/// Writes committed object metadata to the store and notifies it to refresh container listings
/// and any pending `X-Delete-At` scheduling — the one seam standing in for the out-of-scope
/// `ObjectStore` on the write path (`ObjectLookup` covers the read path).
pub trait CommitSink: Send + Sync {
    /// Commit `metadata` for `account/container/object`.
    fn write_metadata(
        &self,
        account: &str,
        container: &str,
        object: &str,
        metadata: ObjectMetadata,
    ) -> Result<(), CommitError>;
}

/// Implements the local-object finalize step (§4.7): validates the reported etag, recomputes an
/// MD5 when the channel carried a CGI/HTTP preamble or is random-access, and commits the result.
/// A no-op if the bound channel isn't a writable commit target.
pub fn finalize_local_object(
    job: &JobSpec,
    binding: &LocalObjectBinding,
    report: &ExecutionReport,
    timestamp: &str,
    sink: &dyn CommitSink,
) -> Result<(), NodeError> {
    let Some(index) = binding.channel else {
        return Ok(());
    };
    let channel = &job.channels[index];
    if !channel.access.contains(AccessFlags::WRITABLE) {
        return Ok(());
    }
    let Some(object) = binding.object.as_deref().filter(|o| !o.is_empty()) else {
        return Ok(());
    };

    let reported_etag = report.etag_for_device(&channel.device).ok_or_else(|| {
        NodeError::Unprocessable(format!("No etag reported for device {:?}", channel.device))
    })?;
    if reported_etag.len() != 32 || !reported_etag.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(NodeError::Unprocessable(
            "Sandbox reported a malformed etag".to_string(),
        ));
    }

    let path = channel.lpath.as_ref().ok_or_else(|| {
        NodeError::InternalError("Writable channel committed with no local path".to_string())
    })?;
    let data = std::fs::read(path)
        .map_err(|e| NodeError::InternalError(format!("Failed to read committed channel file: {e}")))?;

    let preamble = preamble::parse(&channel.content_type, &data);
    let (etag, content_length, extra_meta) = if let Some(pre) = &preamble {
        let body = &data[pre.offset as usize..];
        std::fs::write(path, body)
            .map_err(|e| NodeError::InternalError(format!("Failed to strip channel preamble: {e}")))?;
        (md5_hex(body), body.len() as u64, preamble::object_meta(pre))
    } else if channel.access.contains(AccessFlags::RANDOM) {
        (md5_hex(&data), data.len() as u64, HashMap::new())
    } else {
        (reported_etag.to_string(), data.len() as u64, HashMap::new())
    };

    sink.write_metadata(
        &binding.account,
        &binding.container,
        object,
        ObjectMetadata {
            timestamp: timestamp.to_string(),
            content_type: channel.content_type.clone(),
            etag,
            content_length,
            extra_meta,
        },
    )
    .map_err(|e| match e {
        CommitError::NoSpace => NodeError::InsufficientStorage("No space left on device".to_string()),
        CommitError::Other(e) => NodeError::InternalError(format!("Failed to commit object metadata: {e}")),
    })
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream every response channel (writable, non-local-object, `size >= min_size`) into a tar
/// body, unlinking each channel's temp file once it has been fully read. Returns the body bytes
/// and the precomputed `Content-Length`, computed as `sum(header_block_size + archive_size(size))`
/// over the emitted channels plus the trailing end-of-archive marker, so it always matches
/// `body.len()` exactly.
pub fn assemble_response(
    job: &mut JobSpec,
    response_channels: &[usize],
) -> Result<(Vec<u8>, u64), NodeError> {
    let mut body = Vec::new();
    let mut content_length = 0u64;
    for &index in response_channels {
        let channel = &mut job.channels[index];
        let Some(path) = channel.lpath.clone() else {
            continue;
        };
        let size = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| NodeError::InternalError(format!("Failed to stat response channel file: {e}")))?;
        channel.size = Some(size);
        if size < channel.min_size {
            continue;
        }

        let mut pax = std::collections::BTreeMap::new();
        pax.insert("content-length".to_string(), size.to_string());
        pax.insert("content-type".to_string(), channel.content_type.clone());
        pax.insert("x-zerovm-device".to_string(), channel.device.clone());
        if let Some(meta) = &channel.meta {
            for (key, value) in meta {
                pax.insert(format!("x-object-meta-{key}"), value.clone());
            }
        }

        let meta = TarEntryMeta {
            name: channel.device.clone(),
            size,
            pax,
        };
        let reader = ReadFileIterator::new(&path)
            .map_err(|e| NodeError::InternalError(format!("Failed to open response channel file: {e:?}")))?;
        content_length += header_block_size(&meta.pax) + archive_size(size);
        for chunk in entry_chunks(&meta, reader) {
            body.extend_from_slice(&chunk);
        }

        std::fs::remove_file(&path)
            .map_err(|e| NodeError::InternalError(format!("Failed to unlink response channel temp file: {e}")))?;
    }
    let trailer = zvm_tar::end_of_archive();
    content_length += trailer.len() as u64;
    body.extend(trailer);
    Ok((body, content_length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use zvm_dag::{Channel, Location};

    fn job_with_channel(device: &str, access: AccessFlags, content_type: &str) -> JobSpec {
        JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![Channel::new(device, access, content_type)],
            colocated: None,
        }
    }

    #[test]
    fn report_with_too_few_fields_is_internal_error() {
        let err = parse_report(b"0\n0\nboot only").unwrap_err();
        assert!(matches!(err, NodeError::InternalError(_)));
    }

    #[test]
    fn report_with_return_code_above_one_is_internal_error() {
        let err = parse_report(b"0\n0\n5\n\n\n\n").unwrap_err();
        assert!(matches!(err, NodeError::InternalError(_)));
    }

    #[test]
    fn report_with_valid_fields_parses() {
        let report = parse_report(b"0\n0\n0\n/dev/output deadbeefdeadbeefdeadbeefdeadbeef\n1 2 3 4 5 6 7 8 9 10\nok").unwrap();
        assert_eq!(report.return_code, 0);
    }

    struct RecordingSink {
        committed: std::sync::Mutex<Option<ObjectMetadata>>,
    }

    impl CommitSink for RecordingSink {
        fn write_metadata(&self, _: &str, _: &str, _: &str, metadata: ObjectMetadata) -> Result<(), CommitError> {
            *self.committed.lock().unwrap() = Some(metadata);
            Ok(())
        }
    }

    #[test]
    fn finalize_trusts_the_reported_etag_without_a_preamble_or_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output");
        std::fs::write(&path, b"hello").unwrap();

        let mut job = job_with_channel("output", AccessFlags::WRITABLE, "text/plain");
        job.channels[0].lpath = Some(path);
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        binding.channel = Some(0);

        let report = ExecutionReport {
            validator_code: 0,
            daemon_status: 0,
            return_code: 0,
            etag_line: "/dev/output deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
            cdr_line: String::new(),
            status_text: String::new(),
        };
        let sink = RecordingSink { committed: std::sync::Mutex::new(None) };
        finalize_local_object(&job, &binding, &report, "1700000000.0", &sink).unwrap();
        let committed = sink.committed.lock().unwrap().clone().unwrap();
        assert_eq!(committed.etag, "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(committed.content_length, 5);
    }

    #[test]
    fn finalize_recomputes_md5_for_random_access_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output");
        std::fs::write(&path, b"hello").unwrap();

        let mut job = job_with_channel(
            "output",
            AccessFlags::WRITABLE | AccessFlags::READABLE | AccessFlags::RANDOM,
            "text/plain",
        );
        job.channels[0].lpath = Some(path);
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        binding.channel = Some(0);

        let report = ExecutionReport {
            validator_code: 0,
            daemon_status: 0,
            return_code: 0,
            etag_line: "/dev/output 00000000000000000000000000000000".to_string(),
            cdr_line: String::new(),
            status_text: String::new(),
        };
        let sink = RecordingSink { committed: std::sync::Mutex::new(None) };
        finalize_local_object(&job, &binding, &report, "1700000000.0", &sink).unwrap();
        let committed = sink.committed.lock().unwrap().clone().unwrap();
        assert_eq!(committed.etag, md5_hex(b"hello"));
    }

    #[test]
    fn finalize_rejects_a_malformed_reported_etag() {
        let mut job = job_with_channel("output", AccessFlags::WRITABLE, "text/plain");
        job.channels[0].lpath = Some(PathBuf::from("/dev/null"));
        let mut binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        binding.channel = Some(0);

        let report = ExecutionReport {
            validator_code: 0,
            daemon_status: 0,
            return_code: 0,
            etag_line: "/dev/output short".to_string(),
            cdr_line: String::new(),
            status_text: String::new(),
        };
        let sink = RecordingSink { committed: std::sync::Mutex::new(None) };
        let err = finalize_local_object(&job, &binding, &report, "1700000000.0", &sink).unwrap_err();
        assert!(matches!(err, NodeError::Unprocessable(_)));
    }

    #[test]
    fn assemble_response_streams_every_channel_above_min_size_and_unlinks_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"hello").unwrap();

        let mut job = job_with_channel("stdout", AccessFlags::WRITABLE, "text/plain");
        job.channels[0].lpath = Some(path.clone());

        let (body, content_length) = assemble_response(&mut job, &[0]).unwrap();
        assert!(!body.is_empty());
        assert_eq!(content_length, body.len() as u64);
        assert!(!path.exists());
    }

    #[test]
    fn assemble_response_skips_channels_under_their_min_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"hi").unwrap();

        let mut job = job_with_channel("stdout", AccessFlags::WRITABLE, "text/plain");
        job.channels[0].lpath = Some(path.clone());
        job.channels[0].min_size = 1024;

        let (body, content_length) = assemble_response(&mut job, &[0]).unwrap();
        // Channels below min_size are simply not emitted, so the body is just the trailing
        // end-of-archive marker; cleanup of their temp file still happens via the owning
        // `TempArea`'s own `Drop`, not here.
        assert_eq!(content_length, body.len() as u64);
        assert!(path.exists());
    }
}
