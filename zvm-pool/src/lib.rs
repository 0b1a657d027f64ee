//! Named, bounded worker pools that a request's sandbox execution is offloaded onto, so the
//! request thread handling the HTTP body never blocks waiting for a child process.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod registry;

pub use registry::{PoolError, PoolPolicy, ThreadPoolRegistry};
