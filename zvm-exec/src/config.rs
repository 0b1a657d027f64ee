use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zvm_pool::PoolPolicy;

/// Why loading a `NodeConfig` failed. All of these are startup-time failures, never per-request.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// The path that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A required key was absent.
    #[error("Missing required config key {0:?}")]
    MissingKey(&'static str),
    /// A key's value wasn't the type it was expected to be.
    #[error("Config key {key:?} has invalid value {value:?}: {reason}")]
    InvalidValue {
        /// The offending key.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// `zerovm_threadpools` named no `default` pool.
    #[error("zerovm_threadpools is missing a 'default' pool")]
    MissingDefaultPool,
}

/// Typed projection of the node's INI-style config file (see module docs for the full key list).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path to the sandbox executable.
    pub zerovm_exename: PathBuf,
    /// Grace period (seconds) between `SIGTERM` and `SIGKILL` once the primary deadline expires.
    pub zerovm_kill_timeout: std::time::Duration,
    /// Maximum size (bytes) of an uploaded executable.
    pub zerovm_maxnexe: u64,
    /// Whether to write debug artifacts (manifest/nvram/stdout/stderr) under `/tmp/zvm_debug`.
    pub zerovm_debug: bool,
    /// Whether to ask the sandbox to emit its own performance counters.
    pub zerovm_perf: bool,
    /// `name -> path` system-image device table, parsed from `zerovm_sysimage_devices`.
    pub sysimage_devices: HashMap<String, PathBuf>,
    /// Named thread pool policies, parsed from `zerovm_threadpools`. Always contains `default`.
    pub pool_policies: HashMap<String, PoolPolicy>,
    /// Max I/O operations (reads+writes) a single channel may perform.
    pub zerovm_maxiops: u64,
    /// Max bytes a single channel may read.
    pub zerovm_maxinput: u64,
    /// Max bytes a single channel may write.
    pub zerovm_maxoutput: u64,
    /// Manifest format version string written into the `Version =` line.
    pub zerovm_manifest_ver: String,
    /// Default wall-clock timeout (seconds) given to the sandbox absent an explicit request header.
    pub zerovm_timeout: std::time::Duration,
    /// Memory limit (bytes) given to the sandbox.
    pub zerovm_maxnexemem: u64,
    /// Chunk size used when reading/writing local disk files.
    pub disk_chunk_size: usize,
    /// Chunk size used when streaming response tar bodies over the network.
    pub network_chunk_size: usize,
    /// Maximum time the whole request body is allowed to take to arrive.
    pub max_upload_time: std::time::Duration,
    /// Whether to log every request at `info!` level.
    pub log_requests: bool,
    /// Whether to skip `posix_fallocate` when pre-sizing temp files.
    pub disable_fallocate: bool,
    /// Whether fault injection hooks are enabled (test/debug builds only).
    pub fault_injection: bool,
}

impl NodeConfig {
    /// Parse an INI-style config file with a `[DEFAULT]` section into a `NodeConfig`.
    pub fn load(path: &Path) -> Result<NodeConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse the body of an INI-style config file, as already read from disk. Split out from
    /// [`NodeConfig::load`] so tests can exercise parsing without touching the filesystem.
    pub fn parse(text: &str) -> Result<NodeConfig, ConfigError> {
        let mut keys: HashMap<String, String> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                keys.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let get = |key: &'static str| keys.get(key).cloned();
        let required = |key: &'static str| get(key).ok_or(ConfigError::MissingKey(key));
        let parse_u64 = |key: &'static str, value: &str| {
            value.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: e.to_string(),
            })
        };
        let parse_bool = |key: &'static str, value: &str| match value {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key,
                value: other.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        };

        let zerovm_exename = PathBuf::from(required("zerovm_exename")?);
        let zerovm_kill_timeout = std::time::Duration::from_secs(parse_u64(
            "zerovm_kill_timeout",
            &required("zerovm_kill_timeout")?,
        )?);
        let zerovm_maxnexe = parse_u64("zerovm_maxnexe", &required("zerovm_maxnexe")?)?;
        let zerovm_debug = get("zerovm_debug")
            .map(|v| parse_bool("zerovm_debug", &v))
            .transpose()?
            .unwrap_or(false);
        let zerovm_perf = get("zerovm_perf")
            .map(|v| parse_bool("zerovm_perf", &v))
            .transpose()?
            .unwrap_or(false);
        let sysimage_devices = parse_sysimage_devices(&get("zerovm_sysimage_devices").unwrap_or_default());
        let pool_policies = parse_threadpools(&required("zerovm_threadpools")?)?;
        if !pool_policies.contains_key("default") {
            return Err(ConfigError::MissingDefaultPool);
        }
        let zerovm_maxiops = parse_u64("zerovm_maxiops", &required("zerovm_maxiops")?)?;
        let zerovm_maxinput = parse_u64("zerovm_maxinput", &required("zerovm_maxinput")?)?;
        let zerovm_maxoutput = parse_u64("zerovm_maxoutput", &required("zerovm_maxoutput")?)?;
        let zerovm_manifest_ver = required("zerovm_manifest_ver")?;
        let zerovm_timeout =
            std::time::Duration::from_secs(parse_u64("zerovm_timeout", &required("zerovm_timeout")?)?);
        let zerovm_maxnexemem = parse_u64("zerovm_maxnexemem", &required("zerovm_maxnexemem")?)?;
        let disk_chunk_size = parse_u64("disk_chunk_size", &required("disk_chunk_size")?)? as usize;
        let network_chunk_size =
            parse_u64("network_chunk_size", &required("network_chunk_size")?)? as usize;
        let max_upload_time = std::time::Duration::from_secs(parse_u64(
            "max_upload_time",
            &required("max_upload_time")?,
        )?);
        let log_requests = get("log_requests")
            .map(|v| parse_bool("log_requests", &v))
            .transpose()?
            .unwrap_or(false);
        let disable_fallocate = get("disable_fallocate")
            .map(|v| parse_bool("disable_fallocate", &v))
            .transpose()?
            .unwrap_or(false);
        let fault_injection = get("fault_injection")
            .map(|v| parse_bool("fault_injection", &v))
            .transpose()?
            .unwrap_or(false);

        Ok(NodeConfig {
            zerovm_exename,
            zerovm_kill_timeout,
            zerovm_maxnexe,
            zerovm_debug,
            zerovm_perf,
            sysimage_devices,
            pool_policies,
            zerovm_maxiops,
            zerovm_maxinput,
            zerovm_maxoutput,
            zerovm_manifest_ver,
            zerovm_timeout,
            zerovm_maxnexemem,
            disk_chunk_size,
            network_chunk_size,
            max_upload_time,
            log_requests,
            disable_fallocate,
            fault_injection,
        })
    }
}

/// `name path name path ...` pairs, whitespace-separated.
fn parse_sysimage_devices(value: &str) -> HashMap<String, PathBuf> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    tokens
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), PathBuf::from(pair[1])))
        .collect()
}

/// `name = Policy(size, queue); name = Policy(size, queue); ...`, e.g.
/// `default = WaitPool(10, 100); validator = PriorityPool(2, 4)`.
fn parse_threadpools(value: &str) -> Result<HashMap<String, PoolPolicy>, ConfigError> {
    let mut policies = HashMap::new();
    for entry in value.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, policy_text) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "zerovm_threadpools",
            value: entry.to_string(),
            reason: "expected 'name = Policy(size, queue)'".to_string(),
        })?;
        let name = name.trim().to_string();
        let policy_text = policy_text.trim();
        let open = policy_text.find('(').ok_or_else(|| ConfigError::InvalidValue {
            key: "zerovm_threadpools",
            value: entry.to_string(),
            reason: "expected 'Policy(size, queue)'".to_string(),
        })?;
        let kind = policy_text[..open].trim();
        let args = policy_text[open + 1..]
            .trim_end_matches(')')
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>();
        if args.len() != 2 {
            return Err(ConfigError::InvalidValue {
                key: "zerovm_threadpools",
                value: entry.to_string(),
                reason: "expected exactly two arguments (size, queue)".to_string(),
            });
        }
        let parse_arg = |s: &str| {
            s.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                key: "zerovm_threadpools",
                value: entry.to_string(),
                reason: format!("{s:?} is not a non-negative integer"),
            })
        };
        let size = parse_arg(args[0])?;
        let queue = parse_arg(args[1])?;
        let policy = match kind {
            "WaitPool" => PoolPolicy::Wait { size, queue },
            "PriorityPool" => PoolPolicy::Priority { size, queue },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "zerovm_threadpools",
                    value: entry.to_string(),
                    reason: format!("unknown pool kind {other:?}"),
                })
            }
        };
        policies.insert(name, policy);
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(threadpools: &str) -> String {
        format!(
            "[DEFAULT]\n\
             zerovm_exename = /usr/bin/zerovm\n\
             zerovm_kill_timeout = 5\n\
             zerovm_maxnexe = 5242880\n\
             zerovm_threadpools = {threadpools}\n\
             zerovm_maxiops = 1024\n\
             zerovm_maxinput = 1073741824\n\
             zerovm_maxoutput = 1073741824\n\
             zerovm_manifest_ver = 20130611\n\
             zerovm_timeout = 30\n\
             zerovm_maxnexemem = 536870912\n\
             disk_chunk_size = 65536\n\
             network_chunk_size = 65536\n\
             max_upload_time = 60\n"
        )
    }

    #[test]
    fn parses_a_minimal_well_formed_config() {
        let text = minimal_config("default = WaitPool(10, 100)");
        let config = NodeConfig::parse(&text).unwrap();
        assert_eq!(config.zerovm_exename, PathBuf::from("/usr/bin/zerovm"));
        assert_eq!(
            config.pool_policies.get("default"),
            Some(&PoolPolicy::Wait { size: 10, queue: 100 })
        );
    }

    #[test]
    fn parses_multiple_pools_including_priority() {
        let text = minimal_config("default = WaitPool(10, 100); validator = PriorityPool(2, 4)");
        let config = NodeConfig::parse(&text).unwrap();
        assert_eq!(
            config.pool_policies.get("validator"),
            Some(&PoolPolicy::Priority { size: 2, queue: 4 })
        );
    }

    #[test]
    fn missing_default_pool_is_an_error() {
        let text = minimal_config("validator = WaitPool(1, 1)");
        let err = NodeConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDefaultPool));
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let text = "zerovm_threadpools = default = WaitPool(1,1)\n";
        let err = NodeConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("zerovm_exename")));
    }

    #[test]
    fn sysimage_devices_parse_as_name_path_pairs() {
        let mut text = minimal_config("default = WaitPool(1, 1)");
        text.push_str("zerovm_sysimage_devices = python /opt/images/python.tar daemon /opt/images/daemon.tar\n");
        let config = NodeConfig::parse(&text).unwrap();
        assert_eq!(
            config.sysimage_devices.get("python"),
            Some(&PathBuf::from("/opt/images/python.tar"))
        );
        assert_eq!(
            config.sysimage_devices.get("daemon"),
            Some(&PathBuf::from("/opt/images/daemon.tar"))
        );
    }
}
