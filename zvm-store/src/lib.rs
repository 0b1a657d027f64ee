//! Scoped temporary file/directory management and the streaming file reader used when assembling
//! a response tar.
//!
//! The underlying object store itself (opening/reading/writing stored objects, the container
//! database) is out of scope for this crate and for this system as a whole; what lives here is
//! purely the per-request scratch space a job needs while it runs.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod fs_ops;
mod read_file_iterator;
mod temp_area;

pub use fs_ops::{FilesystemOps, RealFilesystemOps};
pub use read_file_iterator::ReadFileIterator;
pub use temp_area::TempArea;
