//! Sequential, seekable reader over an adapter file
//!
//! All reads are exact: a read that would cross end-of-file fails with an
//! `IoError` instead of returning partial data.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{AdaptarError, Result};

/// Little-endian binary reader with absolute seeking
#[derive(Debug)]
pub struct BinaryReader {
    inner: BufReader<File>,
    path: PathBuf,
    size: u64,
}

impl BinaryReader {
    /// Open a file for reading
    ///
    /// # Errors
    ///
    /// Returns `FileOpen` if the file cannot be opened or stat'ed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_err = |e: std::io::Error| AdaptarError::FileOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let file = File::open(path).map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();

        Ok(Self {
            inner: BufReader::new(file),
            path: path.to_path_buf(),
            size,
        })
    }

    /// Path this reader was opened on
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current absolute offset
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the underlying stream cannot report its position.
    pub fn tell(&mut self) -> Result<u64> {
        self.inner
            .stream_position()
            .map_err(|e| AdaptarError::io("tell", &e))
    }

    /// Seek to an absolute offset
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the seek fails.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(|e| AdaptarError::io(format!("seek to {offset}"), &e))?;
        Ok(())
    }

    /// Fill `buf` completely from the current offset
    ///
    /// # Errors
    ///
    /// Returns `IoError` if fewer than `buf.len()` bytes remain.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| AdaptarError::io(format!("read {} bytes", buf.len()), &e))
    }

    /// Read a little-endian u32
    ///
    /// # Errors
    ///
    /// Returns `IoError` at end-of-file.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian i32
    ///
    /// # Errors
    ///
    /// Returns `IoError` at end-of-file.
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_sequential_reads_advance_cursor() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        bytes.extend_from_slice(&(-2i32).to_le_bytes());
        bytes.extend_from_slice(b"xyz");
        let file = temp_with(&bytes);

        let mut reader = BinaryReader::open(file.path()).unwrap();
        assert_eq!(reader.size(), 11);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.tell().unwrap(), 4);
        assert_eq!(reader.read_i32().unwrap(), -2);
        let mut tail = [0u8; 3];
        reader.read_raw(&mut tail).unwrap();
        assert_eq!(&tail, b"xyz");
        assert_eq!(reader.tell().unwrap(), reader.size());
    }

    #[test]
    fn test_seek_is_absolute() {
        let file = temp_with(&[1, 0, 0, 0, 2, 0, 0, 0]);
        let mut reader = BinaryReader::open(file.path()).unwrap();
        reader.seek(4).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 2);
        reader.seek(0).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 1);
    }

    #[test]
    fn test_read_past_eof_fails() {
        let file = temp_with(&[1, 2]);
        let mut reader = BinaryReader::open(file.path()).unwrap();
        let err = reader.read_u32().unwrap_err();
        assert!(matches!(err, AdaptarError::IoError { .. }));
    }

    #[test]
    fn test_open_missing_file() {
        let err = BinaryReader::open("/nonexistent/adapter.bin").unwrap_err();
        assert!(matches!(err, AdaptarError::FileOpen { .. }));
    }
}
