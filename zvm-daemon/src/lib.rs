//! Manages reuse of a cached, long-lived sandbox ("daemon") listening on a Unix domain socket:
//! compatibility checking, size-framed request/response, and the kill+reboot restart protocol
//! when the cached process has gone away.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod client;
mod compat;
mod reaper;
mod wire;

pub use client::{DaemonClient, DaemonError};
pub use compat::{can_reuse, DaemonNodeView};
pub use reaper::DaemonReaper;
#[cfg(target_os = "linux")]
pub use reaper::ProcfsReaper;
pub use reaper::PidfileReaper;
