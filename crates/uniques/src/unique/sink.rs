//! Output strategies for [`Unique::get`](crate::Unique::get).

use std::{fmt, mem::size_of};

use crate::{
    error::UniqueError,
    storage::backend::{SpillFile, StorageBackend},
};

/// Receives the distinct keys produced by [`Unique::get`](crate::Unique::get),
/// in ascending order, with their occurrence counts.
pub trait UniqueSink {
    /// Accepts one key.  An error stops the merge and is returned by `get`.
    fn push(&mut self, key: &[u8], count: u64) -> Result<(), UniqueError>;
}

/// Collects keys without their counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyList {
    bytes: Vec<u8>,
    ends: Vec<usize>,
}

impl KeyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    /// Returns the `index`th key.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        let end = *self.ends.get(index)?;
        let start = match index {
            0 => 0,
            _ => self.ends[index - 1],
        };
        Some(&self.bytes[start..end])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).filter_map(|index| self.get(index))
    }

    pub fn to_vec(&self) -> Vec<Vec<u8>> {
        self.iter().map(<[u8]>::to_vec).collect()
    }
}

impl UniqueSink for KeyList {
    fn push(&mut self, key: &[u8], _count: u64) -> Result<(), UniqueError> {
        self.bytes
            .try_reserve(key.len())
            .map_err(UniqueError::out_of_memory(key.len()))?;
        self.ends
            .try_reserve(1)
            .map_err(UniqueError::out_of_memory(size_of::<usize>()))?;
        self.bytes.extend_from_slice(key);
        self.ends.push(self.bytes.len());
        Ok(())
    }
}

/// Collects keys together with their occurrence counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountedKeyList {
    entries: Vec<(Vec<u8>, u64)>,
}

impl CountedKeyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], u64)> + '_ {
        self.entries
            .iter()
            .map(|(key, count)| (key.as_slice(), *count))
    }

    pub fn into_vec(self) -> Vec<(Vec<u8>, u64)> {
        self.entries
    }
}

impl UniqueSink for CountedKeyList {
    fn push(&mut self, key: &[u8], count: u64) -> Result<(), UniqueError> {
        self.entries
            .try_reserve(1)
            .map_err(UniqueError::out_of_memory(size_of::<(Vec<u8>, u64)>()))?;
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(key.len())
            .map_err(UniqueError::out_of_memory(key.len()))?;
        owned.extend_from_slice(key);
        self.entries.push((owned, count));
        Ok(())
    }
}

const RECORD_HEADER_SIZE: usize = size_of::<u32>();
const RECORD_COUNT_SIZE: usize = size_of::<u64>();

/// Writes the result to a spill file of its own, so that results larger than
/// memory can be produced.
///
/// Each record is a little-endian `u32` key length, the key, and a
/// little-endian `u64` count.  Read the records back with
/// [`ResultFile::into_reader`].
pub struct ResultFile {
    file: Box<dyn SpillFile>,
    records: u64,
}

impl ResultFile {
    pub fn new(backend: &dyn StorageBackend) -> Result<Self, UniqueError> {
        Ok(Self {
            file: backend.create_with_prefix("result-")?,
            records: 0,
        })
    }

    /// Returns the number of records written so far.
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Flushes the file and returns a reader positioned at its first record.
    pub fn into_reader(mut self) -> Result<ResultFileReader, UniqueError> {
        self.file.flush()?;
        let end = self.file.position();
        Ok(ResultFileReader {
            file: self.file,
            offset: 0,
            end,
            remaining: self.records,
            record: Vec::new(),
        })
    }
}

impl fmt::Debug for ResultFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFile")
            .field("path", &self.file.path())
            .field("records", &self.records)
            .finish()
    }
}

impl UniqueSink for ResultFile {
    fn push(&mut self, key: &[u8], count: u64) -> Result<(), UniqueError> {
        self.file.append(&(key.len() as u32).to_le_bytes())?;
        self.file.append(key)?;
        self.file.append(&count.to_le_bytes())?;
        self.records += 1;
        Ok(())
    }
}

/// Sequential reader over the records of a [`ResultFile`].
pub struct ResultFileReader {
    file: Box<dyn SpillFile>,
    offset: u64,
    end: u64,
    remaining: u64,
    record: Vec<u8>,
}

impl ResultFileReader {
    /// Returns the number of records not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Reads the next record, or returns `None` at the end of the file.
    pub fn next_record(&mut self) -> Result<Option<(&[u8], u64)>, UniqueError> {
        if self.offset >= self.end {
            return Ok(None);
        }

        let mut header = [0; RECORD_HEADER_SIZE];
        self.read(&mut header)?;
        let key_len = u32::from_le_bytes(header) as usize;

        let record_len = key_len + RECORD_COUNT_SIZE;
        self.record.clear();
        self.record
            .try_reserve(record_len)
            .map_err(UniqueError::out_of_memory(record_len))?;
        self.record.resize(record_len, 0);
        let mut record = std::mem::take(&mut self.record);
        let result = self.read(&mut record);
        self.record = record;
        result?;

        let mut count = [0; RECORD_COUNT_SIZE];
        count.copy_from_slice(&self.record[key_len..]);
        self.remaining = self.remaining.saturating_sub(1);
        Ok(Some((&self.record[..key_len], u64::from_le_bytes(count))))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), UniqueError> {
        if self.end - self.offset < buf.len() as u64 {
            return Err(UniqueError::CorruptedRun {
                offset: self.offset,
            });
        }
        self.file.read_exact_at(self.offset, buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}

impl fmt::Debug for ResultFileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFileReader")
            .field("path", &self.file.path())
            .field("offset", &self.offset)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{CountedKeyList, KeyList, ResultFile, UniqueSink};
    use crate::storage::backend::memory_impl::MemoryBackend;

    #[test]
    fn key_list() {
        let mut list = KeyList::new();
        assert!(list.is_empty());
        list.push(b"abc", 3).unwrap();
        list.push(b"", 1).unwrap();
        list.push(b"de", 2).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0), Some(&b"abc"[..]));
        assert_eq!(list.get(1), Some(&b""[..]));
        assert_eq!(list.get(3), None);
        assert_eq!(list.to_vec(), vec![b"abc".to_vec(), vec![], b"de".to_vec()]);
    }

    #[test]
    fn counted_key_list() {
        let mut list = CountedKeyList::new();
        list.push(b"x", 7).unwrap();
        list.push(b"yz", 1).unwrap();
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec![(&b"x"[..], 7), (&b"yz"[..], 1)]
        );
        assert_eq!(
            list.into_vec(),
            vec![(b"x".to_vec(), 7), (b"yz".to_vec(), 1)]
        );
    }

    #[test]
    fn result_file() {
        let backend = MemoryBackend::new();
        let mut result = ResultFile::new(&backend).unwrap();
        assert!(result.is_empty());
        for i in 0..1000u32 {
            result.push(&i.to_be_bytes()[..(i % 4 + 1) as usize], i as u64).unwrap();
        }
        assert_eq!(result.len(), 1000);

        let mut reader = result.into_reader().unwrap();
        assert_eq!(reader.remaining(), 1000);
        for i in 0..1000u32 {
            let (key, count) = reader.next_record().unwrap().unwrap();
            assert_eq!(key, &i.to_be_bytes()[..(i % 4 + 1) as usize]);
            assert_eq!(count, i as u64);
        }
        assert_eq!(reader.remaining(), 0);
        assert!(reader.next_record().unwrap().is_none());
    }
}
