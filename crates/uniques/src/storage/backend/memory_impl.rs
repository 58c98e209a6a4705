//! Implementation of the storage backend APIs ([`StorageBackend`] and
//! [`SpillFile`]) using memory.
//!
//! This is useful for testing and for callers that want spilling semantics
//! without touching a file system, not for bounding memory.

use metrics::counter;
use std::{
    cell::Cell,
    path::{Path, PathBuf},
};

use super::{SpillFile, StorageBackend, StorageError};
use crate::metrics::{
    describe_metrics, FILES_CREATED, FILES_DELETED, READS_FAILED, READS_SUCCESS,
    TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN, WRITES_SUCCESS,
};

/// A spill file held in a vector.
pub struct MemorySpillFile {
    name: PathBuf,
    data: Vec<u8>,

    /// Prefix of `data` that has been flushed and may be read.
    flushed: usize,
}

impl Drop for MemorySpillFile {
    fn drop(&mut self) {
        counter!(FILES_DELETED).increment(1);
    }
}

impl SpillFile for MemorySpillFile {
    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.data.extend_from_slice(data);
        counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
        counter!(WRITES_SUCCESS).increment(1);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.data.len() as u64
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.flushed = self.data.len();
        Ok(())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        match start
            .checked_add(buf.len())
            .filter(|end| *end <= self.flushed)
        {
            Some(end) => {
                buf.copy_from_slice(&self.data[start..end]);
                counter!(TOTAL_BYTES_READ).increment(buf.len() as u64);
                counter!(READS_SUCCESS).increment(1);
                Ok(())
            }
            None => {
                counter!(READS_FAILED).increment(1);
                Err(StorageError::ShortRead)
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.name)
    }
}

/// State of the backend needed to satisfy the storage APIs.
#[derive(Default)]
pub struct MemoryBackend {
    /// Number of files created so far.
    files_created: Cell<u64>,
}

impl MemoryBackend {
    /// Instantiates a new backend.
    pub fn new() -> Self {
        describe_metrics();
        Self::default()
    }

    /// Returns the number of files this backend has created.
    pub fn files_created(&self) -> u64 {
        self.files_created.get()
    }
}

impl StorageBackend for MemoryBackend {
    fn create_named(&self, name: &Path) -> Result<Box<dyn SpillFile>, StorageError> {
        self.files_created.set(self.files_created.get() + 1);
        counter!(FILES_CREATED).increment(1);
        Ok(Box::new(MemorySpillFile {
            name: name.to_path_buf(),
            data: Vec::new(),
            flushed: 0,
        }))
    }
}
