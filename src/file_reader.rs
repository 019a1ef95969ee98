//! Sequential byte sources for response bodies.
//!
//! Grounded on `original_source/main/file-reader.{h,cc}`: read into a
//! caller-owned buffer, track an `eof` flag once a short (or zero-byte)
//! read is observed.

use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A sequential byte source. Implementations need not be `Send`; each
/// connection's reader lives entirely on the [`crate::task_runner::TaskRunner`]
/// that owns the connection.
///
/// `read` returns `Ok(Some(n))` with `n > 0` while there is data, and
/// `Ok(None)` at end of stream — the Rust-native rendering of the C `-1`
/// end-of-stream sentinel (a `usize` can't carry -1 itself). Once `Ok(None)`
/// is returned, every subsequent call must also return `Ok(None)`.
pub trait Reader {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    fn eof(&self) -> bool;
}

pub struct FileReader {
    path: PathBuf,
    file: File,
    eof: bool,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| Error::posix(format!("failed to open {}", path.display()), e))?;
        Ok(FileReader {
            path,
            file,
            eof: false,
        })
    }
}

impl Reader for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.eof {
            return Ok(None);
        }
        let amount = self
            .file
            .read(buf)
            .map_err(|e| Error::posix(format!("read failed on {}", self.path.display()), e))?;
        if amount == 0 {
            self.eof = true;
            return Ok(None);
        }
        if amount < buf.len() {
            self.eof = true;
        }
        Ok(Some(amount))
    }

    fn eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_full_contents_and_flags_eof() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        tmp.flush().unwrap();

        let mut reader = FileReader::open(tmp.path()).unwrap();
        let mut buf = [0u8; 1024];
        let n = reader.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert!(reader.eof());
        assert_eq!(reader.read(&mut buf).unwrap(), None);
    }

    #[test]
    fn open_missing_file_is_posix_error() {
        let err = FileReader::open("/no/such/path/thttpd-test").unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn empty_file_is_immediately_eof() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut reader = FileReader::open(tmp.path()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), None);
        assert!(reader.eof());
    }
}
