use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use zvm_store::TempArea;
use zvm_tar::{TarEntry, TarError, TarEvent, TarReader};

use crate::error::NodeError;

/// Reads the request body tar incrementally, spilling every non-`sysmap` entry to a temp file
/// keyed by its logical device name, and retaining the `sysmap` entry's bytes (expected to be
/// small JSON) directly in memory. Enforces the request's size and wall-clock upload budgets as
/// bytes arrive, so an oversized or slow body is rejected before it's fully buffered.
pub struct Ingest<'a> {
    reader: TarReader,
    temp_area: &'a TempArea,
    rbytes: u64,
    deadline: Instant,
    received: u64,
    sysmap: Option<Vec<u8>>,
    current: Option<CurrentEntry>,
    uploaded_files: HashMap<String, PathBuf>,
}

struct CurrentEntry {
    entry: TarEntry,
    file: Option<std::fs::File>,
    buffer: Vec<u8>,
}

impl<'a> Ingest<'a> {
    /// Start ingesting a body bounded by `rbytes` total bytes and `max_upload_time` wall clock.
    pub fn new(temp_area: &'a TempArea, rbytes: u64, max_upload_time: Duration) -> Ingest<'a> {
        Ingest {
            reader: TarReader::new(),
            temp_area,
            rbytes,
            deadline: Instant::now() + max_upload_time,
            received: 0,
            sysmap: None,
            current: None,
            uploaded_files: HashMap::new(),
        }
    }

    /// Feed the next chunk of the request body. Enforces the size/time budgets before doing any
    /// parsing work on the chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), NodeError> {
        if Instant::now() >= self.deadline {
            return Err(NodeError::RequestTimeout(
                "Request body exceeded the maximum upload time".to_string(),
            ));
        }
        self.received += chunk.len() as u64;
        if self.received > self.rbytes {
            return Err(NodeError::PayloadTooLarge("RPC request too large".to_string()));
        }

        let events = self
            .reader
            .feed(chunk)
            .map_err(|e| map_tar_error(e))?;
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TarEvent) -> Result<(), NodeError> {
        match event {
            TarEvent::Header(entry) => {
                let file = if entry.name != "sysmap" {
                    let path = self
                        .temp_area
                        .mkstemp(&entry.name)
                        .map_err(|e| NodeError::InternalError(format!("Failed to stage upload: {e:?}")))?;
                    self.uploaded_files.insert(entry.name.clone(), path.clone());
                    Some(
                        std::fs::File::create(&path)
                            .map_err(|e| NodeError::InternalError(format!("Failed to open upload staging file: {e}")))?,
                    )
                } else {
                    None
                };
                self.current = Some(CurrentEntry { entry, file, buffer: Vec::new() });
            }
            TarEvent::Data(data) => {
                let Some(current) = self.current.as_mut() else {
                    return Ok(());
                };
                if let Some(file) = current.file.as_mut() {
                    use std::io::Write;
                    file.write_all(&data)
                        .map_err(|e| NodeError::InternalError(format!("Failed writing upload staging file: {e}")))?;
                } else {
                    current.buffer.extend_from_slice(&data);
                }
            }
            TarEvent::EndOfEntry => {
                if let Some(current) = self.current.take() {
                    if current.entry.name == "sysmap" {
                        self.sysmap = Some(current.buffer);
                    }
                }
            }
            TarEvent::End => {}
        }
        Ok(())
    }

    /// Finish ingestion, returning the raw `sysmap` bytes and the device-to-path table of every
    /// other uploaded entry. Fails if no `sysmap` entry was ever seen.
    pub fn finish(self) -> Result<(Vec<u8>, HashMap<String, PathBuf>), NodeError> {
        self.sysmap
            .map(|sysmap| (sysmap, self.uploaded_files))
            .ok_or_else(|| NodeError::BadRequest("No system map found in request".to_string()))
    }
}

fn map_tar_error(error: TarError) -> NodeError {
    NodeError::BadRequest(format!("Malformed tar body: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zvm_store::{FilesystemOps, RealFilesystemOps};
    use zvm_tar::{entry_chunks, TarEntryMeta};

    fn temp_area() -> (tempfile::TempDir, TempArea) {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FilesystemOps> = Arc::new(RealFilesystemOps);
        let area = TempArea::new(dir.path(), fs).unwrap();
        (dir, area)
    }

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, body) in entries {
            let meta = TarEntryMeta {
                name: name.to_string(),
                size: body.len() as u64,
                pax: Default::default(),
            };
            for chunk in entry_chunks(&meta, std::iter::once(body.to_vec())) {
                out.extend(chunk);
            }
        }
        out.extend(zvm_tar::end_of_archive());
        out
    }

    #[test]
    fn collects_sysmap_and_uploaded_files() {
        let (_dir, area) = temp_area();
        let mut ingest = Ingest::new(&area, 1_000_000, Duration::from_secs(60));
        let body = archive(&[("sysmap", b"{\"name\":\"job\"}"), ("input", b"hello")]);
        ingest.feed(&body).unwrap();
        let (sysmap, uploaded) = ingest.finish().unwrap();
        assert_eq!(sysmap, b"{\"name\":\"job\"}");
        assert!(uploaded.contains_key("input"));
        assert_eq!(std::fs::read(&uploaded["input"]).unwrap(), b"hello");
    }

    #[test]
    fn missing_sysmap_is_a_bad_request() {
        let (_dir, area) = temp_area();
        let mut ingest = Ingest::new(&area, 1_000_000, Duration::from_secs(60));
        let body = archive(&[("boot", b"binary")]);
        ingest.feed(&body).unwrap();
        let err = ingest.finish().unwrap_err();
        assert!(matches!(err, NodeError::BadRequest(_)));
    }

    #[test]
    fn oversize_body_is_rejected_mid_stream() {
        let (_dir, area) = temp_area();
        let mut ingest = Ingest::new(&area, 10, Duration::from_secs(60));
        let body = archive(&[("sysmap", b"{\"name\":\"job\"}")]);
        let err = ingest.feed(&body).unwrap_err();
        assert!(matches!(err, NodeError::PayloadTooLarge(_)));
    }
}
