use std::collections::BTreeMap;

use thiserror::Error;

/// A single parsed tar entry, with its position in the overall archive byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// The entry's logical name. For `image.gz`, this is rewritten to `image` by the reader.
    pub name: String,
    /// The entry's declared size in bytes (the decompressed size, for a renamed `image.gz`).
    pub size: u64,
    /// The byte offset of this entry's header block within the archive.
    pub offset_in_archive: u64,
    /// Any PAX extended header records that preceded this entry (`x-object-meta-*`,
    /// `x-zerovm-device`, ...).
    pub pax_headers: BTreeMap<String, String>,
}

/// An event produced by `TarReader::feed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarEvent {
    /// A new entry's header has been fully parsed; its body follows as zero or more `Data` events.
    Header(TarEntry),
    /// A chunk of the current entry's body.
    Data(Vec<u8>),
    /// The current entry's body has been fully delivered.
    EndOfEntry,
    /// The end-of-archive marker (two zeroed blocks) has been seen; no more entries follow.
    End,
}

/// Failure parsing a tar byte stream.
#[derive(Debug, Error)]
pub enum TarError {
    /// A header block failed its checksum or had an unrecognized magic value.
    #[error("corrupt tar header at byte offset {offset}")]
    CorruptHeader {
        /// The byte offset of the offending header block.
        offset: u64,
    },
    /// The `image.gz` entry's payload was not valid gzip data.
    #[error("bad gzip payload in entry {name:?}: {source}")]
    BadPayload {
        /// The entry name (always `image.gz`).
        name: String,
        /// The underlying inflate error.
        source: String,
    },
    /// More bytes were fed after the end-of-archive marker.
    #[error("data fed after end-of-archive marker")]
    TrailingData,
}
