use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{EntryType, Header};

use crate::pax;

/// The tar block size; every header and every entry's padding is a multiple of this.
pub const BLOCK_SIZE: u64 = 512;

/// The metadata needed to render one entry: its device name, declared size, and any PAX extended
/// header records (`x-object-meta-*`, `x-zerovm-device`, ...) that should precede it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntryMeta {
    /// The entry's name (tar path).
    pub name: String,
    /// The entry's exact body size in bytes.
    pub size: u64,
    /// PAX extended header records to emit immediately before this entry's own header.
    pub pax: BTreeMap<String, String>,
}

/// Render one entry (optional PAX extended header, ustar header, body, padding) as a sequence of
/// byte chunks, so a caller can stream them out without holding the whole entry in memory at once.
///
/// `body` must yield exactly `meta.size` bytes in total; this function trusts the caller and pads
/// to the next block boundary based on `meta.size`, not on what `body` actually produced.
pub fn entry_chunks(meta: &TarEntryMeta, body: impl Iterator<Item = Vec<u8>>) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();

    if !meta.pax.is_empty() {
        let pax_body = pax::body(&meta.pax);
        let pax_name = format!("PaxHeaders.0/{}", meta.name);
        chunks.push(ustar_header(&pax_name, pax_body.len() as u64, EntryType::XHeader));
        chunks.push(pax_body.clone());
        chunks.push(zero_padding(pax_body.len() as u64));
    }

    chunks.push(ustar_header(&meta.name, meta.size, EntryType::Regular));
    chunks.extend(body);
    chunks.push(zero_padding(meta.size));

    chunks
}

/// The two zeroed 512-byte blocks that mark the end of a tar archive.
pub fn end_of_archive() -> Vec<u8> {
    vec![0u8; (BLOCK_SIZE * 2) as usize]
}

/// The number of bytes a single entry (its header block plus its padded body, excluding any PAX
/// extended header) occupies in the archive, given its body size. Useful for a caller computing
/// `Content-Length` ahead of streaming.
pub fn archive_size(payload_size: u64) -> u64 {
    BLOCK_SIZE + round_up_to_block(payload_size)
}

/// The number of bytes the PAX extended header block for `pax` occupies in the archive (its own
/// ustar header, the encoded records, and their padding), or zero when `pax` is empty and
/// `entry_chunks` therefore omits the block entirely. A caller summing `Content-Length` ahead of
/// streaming must add this per entry alongside `archive_size`.
pub fn header_block_size(pax: &BTreeMap<String, String>) -> u64 {
    if pax.is_empty() {
        return 0;
    }
    let pax_body_len = pax::body(pax).len() as u64;
    BLOCK_SIZE + round_up_to_block(pax_body_len)
}

fn round_up_to_block(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        size
    } else {
        size + (BLOCK_SIZE - rem)
    }
}

fn zero_padding(size: u64) -> Vec<u8> {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        Vec::new()
    } else {
        vec![0u8; (BLOCK_SIZE - rem) as usize]
    }
}

fn ustar_header(name: &str, size: u64, entry_type: EntryType) -> Vec<u8> {
    let mut header = Header::new_ustar();
    header.set_path(name).expect("entry name fits a ustar path field");
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header.set_entry_type(entry_type);
    header.set_cksum();
    header.as_bytes().to_vec()
}
