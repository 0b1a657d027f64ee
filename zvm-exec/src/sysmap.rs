use zvm_dag::JobSpec;

use crate::error::NodeError;

/// Parse the `sysmap` tar entry's bytes (JSON) into a [`JobSpec`].
pub fn parse(bytes: &[u8]) -> Result<JobSpec, NodeError> {
    serde_json::from_slice(bytes).map_err(|e| NodeError::BadRequest(format!("Malformed system map: {e}")))
}
