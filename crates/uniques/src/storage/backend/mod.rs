//! Spill storage backend APIs.
//!
//! This module provides the [`StorageBackend`] trait that needs to be
//! implemented by a storage backend, and the [`SpillFile`] trait for the files
//! it creates.
//!
//! A spill file is created empty, appended to while runs are flushed, and read
//! back at arbitrary offsets while runs are merged.  Spill files are transient:
//! they belong to exactly one owner and are deleted when dropped.
#![warn(missing_docs)]

use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use serde::{ser::SerializeStruct, Serialize, Serializer};
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

pub mod memory_impl;
pub mod posixio_impl;

#[cfg(test)]
pub(crate) mod tests;

/// Extension for spill files created by the engine.
const CREATE_FILE_EXTENSION: &str = ".spill";

/// Appended data is buffered up to this many bytes before it is written out.
pub(crate) const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// An error that can occur when using the storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    StdIo(#[from] std::io::Error),

    /// Read ended before the full request length.
    #[error("The read would have returned less data than requested.")]
    ShortRead,

    /// Storage location not found.
    #[error("The requested (base) directory for storage does not exist.")]
    StorageLocationNotFound,
}

impl Serialize for StorageError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::StdIo(error) => {
                let mut ser = serializer.serialize_struct("IOError", 2)?;
                ser.serialize_field("kind", &error.kind().to_string())?;
                ser.serialize_field("os_error", &error.raw_os_error())?;
                ser.end()
            }
            Self::ShortRead => serializer.serialize_unit_variant("StorageError", 1, "ShortRead"),
            Self::StorageLocationNotFound => {
                serializer.serialize_unit_variant("StorageError", 2, "StorageLocationNotFound")
            }
        }
    }
}

#[cfg(test)]
/// Implementation of PartialEq for StorageError.
///
/// This is for testing only and therefore intentionally not a complete
/// implementation.
impl PartialEq for StorageError {
    fn eq(&self, other: &Self) -> bool {
        #[allow(clippy::match_like_matches_macro)]
        match (self, other) {
            (Self::ShortRead, Self::ShortRead) => true,
            (Self::StorageLocationNotFound, Self::StorageLocationNotFound) => true,
            (Self::StdIo(a), Self::StdIo(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// An append-only file holding spilled data.
///
/// Bytes become readable with [`SpillFile::read_exact_at`] once
/// [`SpillFile::flush`] has been called after appending them.
pub trait SpillFile {
    /// Appends `data` to the end of the file.
    fn append(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Returns the number of bytes appended so far, which is also the offset
    /// at which the next append lands.
    fn position(&self) -> u64;

    /// Writes out any buffered data so that all appended bytes can be read.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// Reading past the flushed end of the file is an error; this API never
    /// returns a partial result.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Returns the on-disk location of the file, if it has one.
    fn path(&self) -> Option<&Path>;
}

/// A storage backend.
pub trait StorageBackend {
    /// Creates a new spill file with the given `name`, which is relative to
    /// the backend's base directory.
    fn create_named(&self, name: &Path) -> Result<Box<dyn SpillFile>, StorageError>;

    /// Creates a new spill file. The backend selects a name.
    fn create(&self) -> Result<Box<dyn SpillFile>, StorageError> {
        self.create_with_prefix("")
    }

    /// Creates a new spill file, giving the file's name the specified
    /// `prefix`. See also [`create`](Self::create).
    fn create_with_prefix(&self, prefix: &str) -> Result<Box<dyn SpillFile>, StorageError> {
        let uuid = Uuid::now_v7();
        let name = format!("{}{}{}", prefix, uuid, CREATE_FILE_EXTENSION);
        self.create_named(Path::new(&name))
    }
}

/// Returns a per-thread temporary directory.
///
/// The directory is created on first use and removed when the thread exits.
pub fn tempdir_for_thread() -> Result<PathBuf, StorageError> {
    thread_local! {
        static TEMPDIR: RefCell<Option<TempDir>> = const { RefCell::new(None) };
    }
    TEMPDIR.with(|cell| {
        let mut dir = cell.borrow_mut();
        match dir.as_ref() {
            Some(dir) => Ok(dir.path().to_path_buf()),
            None => {
                let created = tempfile::tempdir()?;
                let path = created.path().to_path_buf();
                *dir = Some(created);
                Ok(path)
            }
        }
    })
}

/// Creates a backend of the default kind that keeps its files in `base`.
pub fn new_default_backend(base: PathBuf) -> Result<Rc<dyn StorageBackend>, StorageError> {
    if !base.is_dir() {
        return Err(StorageError::StorageLocationNotFound);
    }
    Ok(Rc::new(posixio_impl::PosixBackend::new(base)))
}

/// Returns a thread-local default backend that keeps its files in
/// [`tempdir_for_thread`].
pub fn default_backend_for_thread() -> Result<Rc<dyn StorageBackend>, StorageError> {
    thread_local! {
        static DEFAULT_BACKEND: RefCell<Option<Rc<dyn StorageBackend>>> = const { RefCell::new(None) };
    }
    DEFAULT_BACKEND.with(|cell| {
        let mut backend = cell.borrow_mut();
        if let Some(backend) = backend.as_ref() {
            return Ok(backend.clone());
        }
        let created = new_default_backend(tempdir_for_thread()?)?;
        *backend = Some(created.clone());
        Ok(created)
    })
}
