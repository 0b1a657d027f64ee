use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Error};

/// Buffer size when reading a file for response streaming.
const READ_FILE_BUFFER_SIZE: usize = 8 * 1024;
/// Type of the reading buffer.
type ReadFileBuffer = [u8; READ_FILE_BUFFER_SIZE];

/// Iterates over the content of a file in fixed-size chunks, used by the tar writer to stream a
/// response channel's file body without loading the whole thing into memory.
pub struct ReadFileIterator {
    /// Reader used to read the file.
    buf_reader: BufReader<File>,
    /// Current read buffer.
    buf: ReadFileBuffer,
}

impl ReadFileIterator {
    /// Make a new iterator reading the file at that path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<ReadFileIterator, Error> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(ReadFileIterator {
            buf_reader: BufReader::new(file),
            buf: [0; READ_FILE_BUFFER_SIZE],
        })
    }
}

impl Iterator for ReadFileIterator {
    type Item = Vec<u8>;
    fn next(&mut self) -> Option<Self::Item> {
        match self.buf_reader.read(&mut self.buf) {
            Ok(0) => None,
            Ok(n) => Some(self.buf[0..n].to_vec()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn fake_file(path: &Path, content: &[u8]) {
        File::create(path).unwrap().write_all(content).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        assert!(ReadFileIterator::new(path).is_err());
    }

    #[test]
    fn empty_file_yields_nothing() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        fake_file(&path, &[]);
        let mut iter = ReadFileIterator::new(&path).unwrap();
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn chunk_and_a_half_file_splits_correctly() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        let content = vec![123u8; READ_FILE_BUFFER_SIZE + 1];
        fake_file(&path, &content);
        let mut iter = ReadFileIterator::new(&path).unwrap();
        assert_eq!(
            iter.next(),
            Some(content[0..READ_FILE_BUFFER_SIZE].to_owned())
        );
        assert_eq!(iter.next(), Some(vec![123]));
        assert_eq!(iter.next(), None);
    }
}
