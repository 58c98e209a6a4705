//! [StorageBackend] implementation using POSIX I/O.

use metrics::counter;
use std::{
    fs::{remove_file, File, OpenOptions},
    io::Error as IoError,
    path::{Path, PathBuf},
};
use tracing::warn;

use super::{SpillFile, StorageBackend, StorageError, WRITE_BUFFER_SIZE};
use crate::metrics::{
    describe_metrics, FILES_CREATED, FILES_DELETED, READS_FAILED, READS_SUCCESS,
    TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN, WRITES_FAILED, WRITES_SUCCESS,
};

struct DeleteOnDrop {
    path: PathBuf,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = remove_file(&self.path) {
            warn!("Unable to delete spill file {:?}: {:?}", self.path, e);
        } else {
            counter!(FILES_DELETED).increment(1);
        }
    }
}

/// A spill file on a local file system.
///
/// Appends are collected in memory and written out in large sequential
/// writes.  The file is removed when this is dropped.
pub(super) struct PosixSpillFile {
    file: File,
    drop: DeleteOnDrop,

    /// Data appended but not yet written.
    buffer: Vec<u8>,

    /// Number of bytes written to `file`.
    written: u64,
}

impl PosixSpillFile {
    fn new(file: File, path: PathBuf) -> Self {
        Self {
            file,
            drop: DeleteOnDrop { path },
            buffer: Vec::new(),
            written: 0,
        }
    }

    fn write_buffer(&mut self) -> Result<(), IoError> {
        if !self.buffer.is_empty() {
            write_all_at(&self.file, &self.buffer, self.written)?;
            counter!(TOTAL_BYTES_WRITTEN).increment(self.buffer.len() as u64);
            counter!(WRITES_SUCCESS).increment(1);
            self.written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }
}

impl SpillFile for PosixSpillFile {
    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if self.buffer.len() + data.len() > WRITE_BUFFER_SIZE {
            self.flush()?;
        }
        if data.len() >= WRITE_BUFFER_SIZE {
            // Too big to be worth copying.
            if let Err(error) = write_all_at(&self.file, data, self.written) {
                counter!(WRITES_FAILED).increment(1);
                return Err(error.into());
            }
            counter!(TOTAL_BYTES_WRITTEN).increment(data.len() as u64);
            counter!(WRITES_SUCCESS).increment(1);
            self.written += data.len() as u64;
        } else {
            self.buffer.extend_from_slice(data);
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.write_buffer().map_err(|error| {
            counter!(WRITES_FAILED).increment(1);
            StorageError::from(error)
        })
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.written {
            counter!(READS_FAILED).increment(1);
            return Err(StorageError::ShortRead);
        }
        match read_exact_at(&self.file, buf, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_READ).increment(buf.len() as u64);
                counter!(READS_SUCCESS).increment(1);
                Ok(())
            }
            Err(error) => {
                counter!(READS_FAILED).increment(1);
                Err(error.into())
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.drop.path)
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<(), IoError> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> Result<(), IoError> {
    use std::io::ErrorKind;
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset)? {
            0 => return Err(IoError::from(ErrorKind::WriteZero)),
            n => {
                data = &data[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<(), IoError> {
    use std::io::ErrorKind;
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(IoError::from(ErrorKind::UnexpectedEof)),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// State of the backend needed to satisfy the storage APIs.
pub struct PosixBackend {
    /// Directory in which we keep the files.
    base: PathBuf,
}

impl PosixBackend {
    /// Instantiates a new backend.
    ///
    /// ## Parameters
    /// - `base`: Directory in which we keep the files.
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        describe_metrics();
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    /// Returns the directory in which the backend creates files.
    pub fn path(&self) -> &Path {
        self.base.as_path()
    }
}

impl StorageBackend for PosixBackend {
    fn create_named(&self, name: &Path) -> Result<Box<dyn SpillFile>, StorageError> {
        let path = self.base.join(name);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        counter!(FILES_CREATED).increment(1);
        Ok(Box::new(PosixSpillFile::new(file, path)))
    }
}
