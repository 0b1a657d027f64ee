//! Incremental tar codec: a pull-based reader that consumes arbitrarily-chunked byte streams and
//! yields `(TarEntry, body bytes)` pairs without ever buffering more than one block boundary plus
//! the entry currently in flight, and a writer that renders PAX-annotated entries as framed output
//! chunks so a caller can compute `Content-Length` ahead of streaming.
//!
//! This crate knows nothing about HTTP, sandboxes, or channels; `zvm-exec` wires it to the request
//! and response bodies.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod entry;
mod pax;
mod reader;
mod writer;

pub use entry::{TarEntry, TarError, TarEvent};
pub use reader::TarReader;
pub use writer::{archive_size, end_of_archive, entry_chunks, header_block_size, TarEntryMeta, BLOCK_SIZE};
