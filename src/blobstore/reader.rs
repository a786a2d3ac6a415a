//! Streaming blob reads

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use super::errors::BlobStoreResult;

/// A streaming reader over one blob file, exposing its length.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    length: u64,
    path: PathBuf,
}

impl BlobReader {
    pub(crate) fn open(path: PathBuf) -> BlobStoreResult<Self> {
        let file = File::open(&path)?;
        let length = file.metadata()?.len();
        Ok(Self { file, length, path })
    }

    /// Total blob size in bytes.
    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Path of the underlying file.
    #[inline]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Reads the whole blob into memory.
    pub fn read_all(mut self) -> BlobStoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
