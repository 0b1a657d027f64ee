use std::collections::BTreeMap;

use tar::{EntryType, Header};

use crate::entry::{TarEntry, TarError, TarEvent};
use crate::pax;

const BLOCK: usize = 512;

enum State {
    AwaitingHeader,
    ExtendedHeader {
        header_offset: u64,
        remaining: u64,
        pad: u64,
        buf: Vec<u8>,
    },
    ImageGz {
        header_offset: u64,
        remaining: u64,
        pad: u64,
        buf: Vec<u8>,
    },
    Body {
        remaining: u64,
        pad: u64,
    },
    AfterEnd,
}

/// A pull-based tar reader: feed it arbitrarily-sized chunks of an archive's byte stream and it
/// yields the entries and body data as soon as enough bytes have arrived to decode them, never
/// buffering more than the current header's 512-byte block plus one in-flight extended header or
/// `image.gz` payload.
pub struct TarReader {
    buf: Vec<u8>,
    state: State,
    offset: u64,
    pending_pax: BTreeMap<String, String>,
}

impl Default for TarReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TarReader {
    /// Start a new reader at the beginning of an archive.
    pub fn new() -> Self {
        TarReader {
            buf: Vec::new(),
            state: State::AwaitingHeader,
            offset: 0,
            pending_pax: BTreeMap::new(),
        }
    }

    /// Feed the next chunk of archive bytes, returning every event it was possible to decode.
    ///
    /// Chunk boundaries carry no meaning: a call may return zero events (not enough bytes yet
    /// arrived) or several (a small header plus a body that was already fully buffered).
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TarEvent>, TarError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let state = std::mem::replace(&mut self.state, State::AfterEnd);
            match state {
                State::AfterEnd => {
                    // The standard calls for two trailing zeroed blocks; we already reported
                    // `End` on the first one, so a second all-zero block (however it happens to
                    // be chunked) is swallowed here rather than treated as trailing data.
                    if self.buf.iter().all(|&b| b == 0) {
                        self.buf.clear();
                        self.state = State::AfterEnd;
                        break;
                    }
                    self.state = State::AfterEnd;
                    return Err(TarError::TrailingData);
                }
                State::AwaitingHeader => {
                    if self.buf.len() < BLOCK {
                        self.state = State::AwaitingHeader;
                        break;
                    }
                    let block: [u8; BLOCK] = self.buf[..BLOCK].try_into().unwrap();
                    let header_offset = self.offset;
                    self.buf.drain(..BLOCK);
                    self.offset += BLOCK as u64;

                    if block.iter().all(|&b| b == 0) {
                        // The standard requires two trailing zeroed blocks; we only need to see
                        // the first to know no further entries follow, so the second (if not yet
                        // buffered) is simply absorbed by the `AfterEnd` trailing-data check.
                        events.push(TarEvent::End);
                        self.state = State::AfterEnd;
                        continue;
                    }
                    if !verify_checksum(&block) {
                        return Err(TarError::CorruptHeader {
                            offset: header_offset,
                        });
                    }

                    let header = Header::from_byte_slice(&block);
                    let name = header
                        .path()
                        .map_err(|_| TarError::CorruptHeader { offset: header_offset })?
                        .to_string_lossy()
                        .into_owned();
                    let size = header
                        .entry_size()
                        .map_err(|_| TarError::CorruptHeader { offset: header_offset })?;
                    let pad = padding(size);

                    if header.entry_type() == EntryType::XHeader {
                        self.state = State::ExtendedHeader {
                            header_offset,
                            remaining: size,
                            pad,
                            buf: Vec::with_capacity(size as usize),
                        };
                    } else if name == "image.gz" {
                        self.state = State::ImageGz {
                            header_offset,
                            remaining: size,
                            pad,
                            buf: Vec::with_capacity(size as usize),
                        };
                    } else {
                        events.push(TarEvent::Header(TarEntry {
                            name,
                            size,
                            offset_in_archive: header_offset,
                            pax_headers: std::mem::take(&mut self.pending_pax),
                        }));
                        self.state = State::Body {
                            remaining: size,
                            pad,
                        };
                    }
                }
                State::Body { mut remaining, pad } => {
                    if remaining > 0 {
                        if self.buf.is_empty() {
                            self.state = State::Body { remaining, pad };
                            break;
                        }
                        let take = remaining.min(self.buf.len() as u64) as usize;
                        let data: Vec<u8> = self.buf.drain(..take).collect();
                        self.offset += take as u64;
                        remaining -= take as u64;
                        events.push(TarEvent::Data(data));
                        self.state = State::Body { remaining, pad };
                        continue;
                    }
                    if (self.buf.len() as u64) < pad {
                        self.state = State::Body { remaining, pad };
                        break;
                    }
                    self.buf.drain(..pad as usize);
                    self.offset += pad;
                    events.push(TarEvent::EndOfEntry);
                    self.state = State::AwaitingHeader;
                }
                State::ExtendedHeader {
                    header_offset,
                    mut remaining,
                    pad,
                    mut buf,
                } => {
                    if remaining > 0 {
                        if self.buf.is_empty() {
                            self.state = State::ExtendedHeader {
                                header_offset,
                                remaining,
                                pad,
                                buf,
                            };
                            break;
                        }
                        let take = remaining.min(self.buf.len() as u64) as usize;
                        buf.extend(self.buf.drain(..take));
                        self.offset += take as u64;
                        remaining -= take as u64;
                        self.state = State::ExtendedHeader {
                            header_offset,
                            remaining,
                            pad,
                            buf,
                        };
                        continue;
                    }
                    if (self.buf.len() as u64) < pad {
                        self.state = State::ExtendedHeader {
                            header_offset,
                            remaining,
                            pad,
                            buf,
                        };
                        break;
                    }
                    self.buf.drain(..pad as usize);
                    self.offset += pad;
                    self.pending_pax.extend(pax::parse(&buf));
                    self.state = State::AwaitingHeader;
                }
                State::ImageGz {
                    header_offset,
                    mut remaining,
                    pad,
                    mut buf,
                } => {
                    if remaining > 0 {
                        if self.buf.is_empty() {
                            self.state = State::ImageGz {
                                header_offset,
                                remaining,
                                pad,
                                buf,
                            };
                            break;
                        }
                        let take = remaining.min(self.buf.len() as u64) as usize;
                        buf.extend(self.buf.drain(..take));
                        self.offset += take as u64;
                        remaining -= take as u64;
                        self.state = State::ImageGz {
                            header_offset,
                            remaining,
                            pad,
                            buf,
                        };
                        continue;
                    }
                    if (self.buf.len() as u64) < pad {
                        self.state = State::ImageGz {
                            header_offset,
                            remaining,
                            pad,
                            buf,
                        };
                        break;
                    }
                    self.buf.drain(..pad as usize);
                    self.offset += pad;

                    let inflated = zune_inflate::DeflateDecoder::new(&buf)
                        .decode_gzip()
                        .map_err(|e| TarError::BadPayload {
                            name: "image.gz".to_string(),
                            source: e.to_string(),
                        })?;
                    let size = inflated.len() as u64;
                    events.push(TarEvent::Header(TarEntry {
                        name: "image".to_string(),
                        size,
                        offset_in_archive: header_offset,
                        pax_headers: std::mem::take(&mut self.pending_pax),
                    }));
                    events.push(TarEvent::Data(inflated));
                    events.push(TarEvent::EndOfEntry);
                    self.state = State::AwaitingHeader;
                }
            }
        }

        Ok(events)
    }
}

fn padding(size: u64) -> u64 {
    let rem = size % BLOCK as u64;
    if rem == 0 {
        0
    } else {
        BLOCK as u64 - rem
    }
}

fn verify_checksum(block: &[u8; BLOCK]) -> bool {
    let recorded = match parse_octal(&block[148..156]) {
        Some(v) => v,
        None => return false,
    };
    let mut sum: u32 = 0;
    for (i, &b) in block.iter().enumerate() {
        if (148..156).contains(&i) {
            sum += b' ' as u32;
        } else {
            sum += b as u32;
        }
    }
    sum == recorded
}

fn parse_octal(field: &[u8]) -> Option<u32> {
    let s = std::str::from_utf8(field).ok()?;
    let s = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if s.is_empty() {
        return Some(0);
    }
    u32::from_str_radix(s, 8).ok()
}
