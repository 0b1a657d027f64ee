use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The result of a single sandbox invocation, independent of the report it may have printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunCode {
    /// The sandbox ran to completion and the child exited with status zero.
    Ok = 0,
    /// The sandbox ran to completion but the child exited non-zero, or the report was malformed.
    Error = 1,
    /// The primary wall-clock deadline was exceeded and the child was asked to terminate
    /// gracefully, which it did before the kill deadline.
    TimedOut = 2,
    /// The primary wall-clock deadline was exceeded and the child had to be forcibly killed.
    Killed = 3,
    /// Accumulated stdout or stderr crossed its cap.
    OutputTooLong = 4,
}

impl RunCode {
    /// The numeric code as it appears in the `x-nexe-retcode` header / report `return_code` field.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Why parsing an `ExecutionReport` out of the sandbox's stdout failed.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Fewer than 6 LF-separated fields were present.
    #[error("malformed sandbox report: expected 6 fields, got {found}")]
    TooFewFields {
        /// The number of fields actually found.
        found: usize,
    },
    /// A field expected to be an integer wasn't.
    #[error("malformed sandbox report: field {field} is not an integer: {value:?}")]
    NotAnInteger {
        /// The name of the offending field.
        field: &'static str,
        /// The raw text that failed to parse.
        value: String,
    },
}

/// The six-line LF-separated status report a sandbox run emits on stdout (or over the daemon
/// socket) on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Non-zero if the pre-validation of the executable failed.
    pub validator_code: i32,
    /// The daemon's own status code, meaningful only when running in daemon mode.
    pub daemon_status: i32,
    /// The return code of the user program inside the sandbox. Per the protocol, anything `> 1`
    /// is itself treated as a protocol error by the coordinator.
    pub return_code: i32,
    /// The etag line: either `/memetag dev1 hex1 dev2 hex2 ...` or `dev1 hex1 dev2 hex2 ...`.
    pub etag_line: String,
    /// Ten space-separated accounting integers (bytes/ops read/written).
    pub cdr_line: String,
    /// Free-form human-readable status text.
    pub status_text: String,
}

const REPORT_FIELDS: usize = 6;

impl ExecutionReport {
    /// Parse a report out of raw sandbox stdout. The report is exactly 6 LF-separated fields;
    /// anything else is a protocol error that the caller should turn into `InternalError`.
    pub fn parse(stdout: &str) -> Result<ExecutionReport, ReportError> {
        let fields: Vec<&str> = stdout.splitn(REPORT_FIELDS, '\n').collect();
        if fields.len() < REPORT_FIELDS {
            return Err(ReportError::TooFewFields {
                found: fields.len(),
            });
        }
        let parse_int = |field: &'static str, value: &str| {
            value
                .trim()
                .parse::<i32>()
                .map_err(|_| ReportError::NotAnInteger {
                    field,
                    value: value.to_string(),
                })
        };
        Ok(ExecutionReport {
            validator_code: parse_int("validator_code", fields[0])?,
            daemon_status: parse_int("daemon_status", fields[1])?,
            return_code: parse_int("return_code", fields[2])?,
            etag_line: fields[3].to_string(),
            cdr_line: fields[4].to_string(),
            status_text: fields[5].trim_end_matches('\n').to_string(),
        })
    }

    /// Whether the report itself (independent of any timeout/kill) describes a successful run.
    pub fn is_success(&self) -> bool {
        self.return_code <= 1
    }

    /// Parse the etag line into `(device, hex_etag)` pairs, following the rule that if the first
    /// whitespace-separated token starts with `/` the whole list is device/hex pairs, otherwise
    /// the first token is a memory etag (for snapshot usage) to be skipped.
    ///
    /// Grounded on `objectquery.py::_finalize_local_file`: `data[0].startswith('/')` decides
    /// whether a leading memory-etag token is present.
    pub fn etag_pairs(&self) -> Vec<(&str, &str)> {
        let tokens: Vec<&str> = self.etag_line.split_whitespace().collect();
        let pairs = if tokens.first().is_some_and(|t| t.starts_with('/')) {
            &tokens[..]
        } else if tokens.is_empty() {
            &tokens[..]
        } else {
            &tokens[1..]
        };
        pairs.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect()
    }

    /// Find the hex etag reported for a device, matching the coordinator's `in` semantics: the
    /// bound channel's device name must be a substring of the reported device token.
    pub fn etag_for_device(&self, device: &str) -> Option<&str> {
        self.etag_pairs()
            .into_iter()
            .find(|(dev, _)| dev.contains(device))
            .map(|(_, etag)| etag)
    }
}

/// Out-of-band headers propagated to the client describing the outcome of the sandbox run. Every
/// field is optional because error paths populate only what they know before failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexeHeaders {
    /// `x-nexe-validation`: the report's `validator_code`, if a report was parsed.
    pub validation: Option<i32>,
    /// `x-nexe-retcode`: the numeric `RunCode`.
    pub retcode: Option<u32>,
    /// `x-nexe-etag`: the raw etag line from the report.
    pub etag: Option<String>,
    /// `x-nexe-cdr-line`: the raw CDR accounting line.
    pub cdr_line: Option<String>,
    /// `x-nexe-status`: the free-form status text.
    pub status: Option<String>,
    /// `x-nexe-system`: the job's declared name.
    pub system: Option<String>,
    /// `x-nexe-policy`: the name of the thread pool this job ran on.
    pub policy: Option<String>,
    /// `x-zerovm-daemon`: set once a daemon has been (re)initialized for this job.
    pub daemon: Option<String>,
    /// `x-nexe-colocated`: HMAC-SHA1(salt, addr) reply to a co-location probe.
    pub colocated: Option<String>,
    /// `x-nexe-error`: a human-readable error message, set only on failure paths.
    pub error: Option<String>,
}

impl NexeHeaders {
    /// Render the populated fields as `(header-name, value)` pairs, in the order they're declared
    /// in the data model, ready to be attached to an HTTP response.
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        macro_rules! push {
            ($name:expr, $field:expr) => {
                if let Some(value) = &$field {
                    out.push(($name, value.to_string()));
                }
            };
        }
        push!("x-nexe-validation", self.validation);
        push!("x-nexe-retcode", self.retcode);
        push!("x-nexe-etag", self.etag);
        push!("x-nexe-cdr-line", self.cdr_line);
        push!("x-nexe-status", self.status);
        push!("x-nexe-system", self.system);
        push!("x-nexe-policy", self.policy);
        push!("x-zerovm-daemon", self.daemon);
        push!("x-nexe-colocated", self.colocated);
        push!("x-nexe-error", self.error);
        out
    }

    /// Fill in the retcode/etag/cdr/status fields from a successfully parsed report.
    pub fn apply_report(&mut self, report: &ExecutionReport, run_code: RunCode) {
        self.validation = Some(report.validator_code);
        self.retcode = Some(run_code.code());
        self.etag = Some(report.etag_line.clone());
        self.cdr_line = Some(report.cdr_line.clone());
        self.status = Some(report.status_text.clone());
        if report.daemon_status != 0 {
            self.daemon = Some(report.daemon_status.to_string());
        }
    }

    /// Build the map representation (`x-object-meta-*` style consumers use a map, not a list).
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        self.to_header_pairs().into_iter().collect()
    }
}
