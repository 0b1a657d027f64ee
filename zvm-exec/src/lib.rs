//! The node-side execution middleware: parses an incoming execution request, resolves its
//! declared channels against local storage, dispatches the sandboxed run (standalone or cached
//! daemon), and streams back the result. `zvm-dag` owns the data model, `zvm-sandbox` and
//! `zvm-daemon` own the two ways of actually running a nexe; this crate is the state machine that
//! ties them to an HTTP request.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod colocation;
mod config;
mod coordinator;
mod error;
mod http;
mod ingest;
mod preamble;
mod resolver;
mod sysmap;
mod validator;

pub use colocation::reply as colocation_reply;
pub use config::{ConfigError, NodeConfig};
pub use coordinator::{CommitError, CommitSink, ObjectMetadata};
pub use error::NodeError;
pub use http::{router, AppState};
pub use ingest::Ingest;
pub use preamble::{object_meta as preamble_object_meta, parse as parse_preamble, Preamble};
pub use resolver::{LocalContainerInfo, LocalObjectInfo, ObjectLookup};
pub use validator::{
    build_validation_manifest, is_validated, validate, validate_and_mark, validated_from_stdout,
    ValidationSink,
};
