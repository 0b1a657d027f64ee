use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use zvm_dag::AccessFlags;
use zvm_pool::ThreadPoolRegistry;
use zvm_sandbox::{ChannelType, ManifestChannel, ManifestLimits, SandboxRunner};

use crate::error::NodeError;

/// Flag passed to the sandbox binary to run in pre-validation mode without executing the program.
const VALIDATE_FLAG: &str = "-F";

/// Build the minimal manifest a validation run needs: the executable wired to null stdin, stdout
/// and stderr, no other channels.
pub fn build_validation_manifest(
    version: &str,
    program: &Path,
    timeout: Duration,
    memory: u64,
) -> String {
    let null_channel = |device: &str, access: AccessFlags| ManifestChannel {
        source: "/dev/null".to_string(),
        device: device.to_string(),
        etype: ChannelType::from_access(access),
        tag: String::new(),
        limits: ManifestLimits {
            reads: 0,
            rbytes: 0,
            writes: 0,
            wbytes: 0,
        },
    };
    let channels = [
        null_channel("stdin", AccessFlags::READABLE),
        null_channel("stdout", AccessFlags::WRITABLE),
        null_channel("stderr", AccessFlags::WRITABLE),
    ];
    zvm_sandbox::render_manifest(version, program, timeout, memory, &channels)
}

/// Run pre-validation of `program` through the `default` pool, bypassing admission (this always
/// runs, even when `default` is saturated, mirroring the reference implementation's
/// `force_spawn`). Returns the sandbox's raw stdout so the caller can decide, via
/// [`validated_from_stdout`], whether to write the `Validated` marker.
pub fn validate(
    pools: &ThreadPoolRegistry,
    sandbox: Arc<dyn SandboxRunner>,
    manifest_path: std::path::PathBuf,
    timeout: Duration,
) -> Result<Vec<u8>, NodeError> {
    let (tx, rx) = std::sync::mpsc::channel();
    pools.force_spawn(move || {
        let outcome = sandbox.run(&manifest_path, timeout, &[VALIDATE_FLAG.to_string()]);
        let _ = tx.send(outcome);
    });
    let outcome = rx
        .recv()
        .map_err(|_| NodeError::InternalError("Validation worker did not report an outcome".to_string()))?;
    let (_run_code, stdout, _stderr) =
        outcome.map_err(|e| NodeError::InternalError(format!("Sandbox failed to run: {e:?}")))?;
    Ok(stdout)
}

/// Whether a just-completed validation run's stdout reports a validated (`validator_code == 0`)
/// executable.
pub fn validated_from_stdout(stdout: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stdout);
    text.splitn(2, '\n')
        .next()
        .and_then(|field| field.trim().parse::<i32>().ok())
        .is_some_and(|code| code == 0)
}

/// `true` iff the object's stored `Validated` marker is present and equal to its current `ETag`.
pub fn is_validated(validated_marker: Option<&str>, etag: Option<&str>) -> bool {
    match (validated_marker, etag) {
        (Some(marker), Some(etag)) => marker == etag,
        _ => false,
    }
}

/// The write seam validation needs: a single metadata key (`Validated`) updated in place, distinct
/// from [`crate::coordinator::CommitSink`], whose `write_metadata` replaces the object's whole
/// metadata set as part of committing a fresh write.
pub trait ValidationSink: Send + Sync {
    /// Record that `account/container/object` validated against `etag`.
    fn mark_validated(
        &self,
        account: &str,
        container: &str,
        object: &str,
        etag: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Run validation end to end against a local object and mark it validated on success. Returns
/// whether the executable validated.
#[allow(clippy::too_many_arguments)]
pub fn validate_and_mark(
    pools: &ThreadPoolRegistry,
    sandbox: Arc<dyn SandboxRunner>,
    sink: &dyn ValidationSink,
    account: &str,
    container: &str,
    object: &str,
    etag: &str,
    manifest_path: std::path::PathBuf,
    timeout: Duration,
) -> Result<bool, NodeError> {
    let stdout = validate(pools, sandbox, manifest_path, timeout)?;
    let validated = validated_from_stdout(&stdout);
    if validated {
        sink.mark_validated(account, container, object, etag)
            .map_err(|e| NodeError::InternalError(format!("Failed to record validation: {e}")))?;
    }
    Ok(validated)
}
