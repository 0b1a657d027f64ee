//! Spawns the external sandbox executable against a generated manifest, captures its bounded
//! stdout/stderr, and enforces the timeout/grace/kill escalation. Knows nothing about channels'
//! origin or the HTTP layer; `zvm-exec` builds the manifest inputs and interprets the report.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod manifest;
mod runner;

pub use manifest::{ChannelType, ManifestChannel, ManifestLimits};
pub use runner::{
    ErrorSandboxRunner, FakeSandboxRunner, RealSandboxRunner, SandboxRunner, SuccessSandboxRunner,
    GRACE,
};
