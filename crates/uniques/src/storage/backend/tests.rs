//! Shared checks run against every backend implementation.

use std::{path::Path, rc::Rc};

use rand::{thread_rng, Fill, Rng};

use crate::storage::test::init_test_logger;

use super::{SpillFile, StorageBackend, StorageError};

/// Returns a random length for reading a file of `size` bytes starting at
/// `offset`.
fn random_read_length(size: usize, offset: usize) -> usize {
    let remaining = size - offset;
    if remaining == 0 {
        return 0;
    }
    thread_rng().gen_range(1..=remaining.min(1 << 16))
}

fn test_read_range(file: &dyn SpillFile, data: &[u8], offset: usize) -> usize {
    let length = random_read_length(data.len(), offset);
    if length > 0 {
        let mut buf = vec![0; length];
        file.read_exact_at(offset as u64, &mut buf).unwrap();
        assert_eq!(buf.as_slice(), &data[offset..offset + length]);
    }
    length
}

fn test_read(file: &dyn SpillFile, data: &[u8]) {
    assert_eq!(file.position(), data.len() as u64);
    let mut offset = 0;
    while offset < data.len() {
        offset += test_read_range(file, data, offset);
    }
    for _ in 0..100 {
        if !data.is_empty() {
            let offset = thread_rng().gen_range(0..data.len());
            test_read_range(file, data, offset);
        }
    }
    let mut past_end = [0; 1];
    assert_eq!(
        file.read_exact_at(data.len() as u64, &mut past_end)
            .unwrap_err(),
        StorageError::ShortRead
    );
}

pub(super) fn test_backend(
    create_backend: Box<dyn FnOnce(&Path) -> Rc<dyn StorageBackend>>,
    appends: &[usize],
) {
    init_test_logger();
    let tmpdir = tempfile::tempdir().unwrap();
    let backend = create_backend(tmpdir.path());
    let mut rng = thread_rng();
    let mut file = backend.create().unwrap();
    let mut data = Vec::new();

    for size in appends.iter().copied() {
        let mut chunk = vec![0u8; size];
        chunk.try_fill(&mut rng).unwrap();
        assert_eq!(file.position(), data.len() as u64);
        file.append(&chunk).unwrap();
        data.extend_from_slice(&chunk);
    }
    file.flush().unwrap();
    test_read(file.as_ref(), &data);

    // Appending after a read keeps earlier data intact.
    file.append(b"tail").unwrap();
    file.flush().unwrap();
    data.extend_from_slice(b"tail");
    test_read(file.as_ref(), &data);
}

pub(super) fn random_sizes() -> Vec<usize> {
    let mut rng = thread_rng();
    let mut sizes = Vec::new();
    let mut total = 0;
    while total < 1024 * 1024 * 3 {
        let size = 1 << rng.gen_range(0..=18);
        sizes.push(size);
        total += size;
    }
    sizes
}
