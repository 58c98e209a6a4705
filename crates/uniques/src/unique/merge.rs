//! Merging of spilled runs.
//!
//! Every run in a spill file is sorted and holds distinct keys.  A merge reads
//! each run through a [`RunCursor`], repeatedly picks the smallest key across
//! all cursors, and combines the counts of every cursor positioned on an equal
//! key.  When there are too many runs to merge at once, intermediate passes
//! merge groups of [`MERGEBUFF`] runs into a new spill file until at most
//! [`MERGEBUFF2`] remain.

use std::{cmp::Ordering, mem::size_of, ops::ControlFlow};

use metrics::counter;
use tracing::debug;

use crate::{
    cost::{COUNTER_SIZE, MERGEBUFF, MERGEBUFF2},
    descriptor::KeyDescriptor,
    error::UniqueError,
    metrics::MERGE_PASSES,
    storage::backend::{SpillFile, StorageBackend},
};

use super::SPILL_FILE_PREFIX;

/// Location of one sorted run in a spill file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Run {
    /// Offset of the first byte of the run.
    pub start: u64,
    /// Offset just past the last byte of the run.
    pub end: u64,
    /// Number of distinct keys in the run.
    pub elements: u64,
}

/// Reads the entries of one run, a block at a time.
struct RunCursor<'a> {
    file: &'a dyn SpillFile,
    descriptor: &'a KeyDescriptor,
    counted: bool,

    /// Offset in `file` of the first byte not yet read into `buffer`.
    next_read: u64,
    /// End of the run.
    end: u64,

    buffer: Vec<u8>,
    capacity: usize,
    /// Start of the current entry in `buffer`.
    pos: usize,
    /// Length of the current key, or 0 once the run is exhausted.
    key_len: usize,
    count: u64,
}

impl<'a> RunCursor<'a> {
    fn new(
        file: &'a dyn SpillFile,
        run: &Run,
        descriptor: &'a KeyDescriptor,
        counted: bool,
        capacity: usize,
    ) -> Result<Self, UniqueError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(UniqueError::out_of_memory(capacity))?;
        let mut cursor = Self {
            file,
            descriptor,
            counted,
            next_read: run.start,
            end: run.end,
            buffer,
            capacity,
            pos: 0,
            key_len: 0,
            count: 0,
        };
        cursor.read_entry()?;
        Ok(cursor)
    }

    fn key_valid(&self) -> bool {
        self.key_len > 0
    }

    fn key(&self) -> &[u8] {
        &self.buffer[self.pos..self.pos + self.key_len]
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn entry_len(&self) -> usize {
        self.key_len + if self.counted { COUNTER_SIZE } else { 0 }
    }

    /// File offset of the byte at `self.pos`.
    fn offset(&self) -> u64 {
        self.next_read - (self.buffer.len() - self.pos) as u64
    }

    fn corrupted(&self) -> UniqueError {
        UniqueError::CorruptedRun {
            offset: self.offset(),
        }
    }

    /// Makes sure that at least `need` bytes starting at `self.pos` are in the
    /// buffer.  Returns false if the run ends first.
    fn fill(&mut self, need: usize) -> Result<bool, UniqueError> {
        if self.buffer.len() - self.pos >= need {
            return Ok(true);
        }
        self.buffer.drain(..self.pos);
        self.pos = 0;

        let available = self.end - self.next_read;
        let read = ((self.capacity - self.buffer.len()) as u64).min(available) as usize;
        if read > 0 {
            let old_len = self.buffer.len();
            self.buffer.resize(old_len + read, 0);
            self.file
                .read_exact_at(self.next_read, &mut self.buffer[old_len..])?;
            self.next_read += read as u64;
        }
        Ok(self.buffer.len() >= need)
    }

    fn read_entry(&mut self) -> Result<(), UniqueError> {
        self.key_len = 0;
        if self.pos == self.buffer.len() && self.next_read == self.end {
            return Ok(());
        }

        if !self.fill(self.descriptor.length_probe_size())? {
            return Err(self.corrupted());
        }
        let key_len = self
            .descriptor
            .get_length_of_key(&self.buffer[self.pos..]);
        let entry_len = key_len + if self.counted { COUNTER_SIZE } else { 0 };
        if key_len == 0 || entry_len > self.capacity || !self.fill(entry_len)? {
            return Err(self.corrupted());
        }

        self.key_len = key_len;
        self.count = if self.counted {
            let mut count = [0; COUNTER_SIZE];
            count.copy_from_slice(&self.buffer[self.pos + key_len..self.pos + entry_len]);
            u64::from_le_bytes(count)
        } else {
            1
        };
        Ok(())
    }

    fn step(&mut self) -> Result<(), UniqueError> {
        self.pos += self.entry_len();
        self.read_entry()
    }
}

/// Merges the runs of a spill file.
pub(crate) struct Merger<'a> {
    descriptor: &'a KeyDescriptor,
    /// Whether entries carry a count after the key.
    counted: bool,
    /// Longest possible entry.
    max_entry_len: usize,
    /// Bytes of read buffer shared by the cursors of one merge.
    buffer_size: usize,
}

impl<'a> Merger<'a> {
    pub fn new(
        descriptor: &'a KeyDescriptor,
        counted: bool,
        max_entry_len: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            descriptor,
            counted,
            max_entry_len,
            buffer_size,
        }
    }

    fn open_cursors<'b>(
        &'b self,
        file: &'b dyn SpillFile,
        runs: &[Run],
    ) -> Result<Vec<RunCursor<'b>>, UniqueError> {
        let capacity = (self.buffer_size / runs.len().max(1)).max(self.max_entry_len);
        let mut cursors = Vec::new();
        cursors
            .try_reserve_exact(runs.len())
            .map_err(UniqueError::out_of_memory(
                runs.len() * size_of::<RunCursor<'_>>(),
            ))?;
        for run in runs {
            cursors.push(RunCursor::new(
                file,
                run,
                self.descriptor,
                self.counted,
                capacity,
            )?);
        }
        Ok(cursors)
    }

    /// Merges `runs` of `file` and calls `emit` once per distinct key, in
    /// ascending order, with the key's combined count.  Stops early if `emit`
    /// breaks.
    pub fn merge<F>(
        &self,
        file: &dyn SpillFile,
        runs: &[Run],
        mut emit: F,
    ) -> Result<ControlFlow<()>, UniqueError>
    where
        F: FnMut(&[u8], u64) -> Result<ControlFlow<()>, UniqueError>,
    {
        let mut cursors = self.open_cursors(file, runs)?;
        let mut ties = Vec::with_capacity(cursors.len());
        loop {
            let mut min: Option<usize> = None;
            ties.clear();
            for (index, cursor) in cursors.iter().enumerate() {
                if !cursor.key_valid() {
                    continue;
                }
                match min {
                    None => {
                        min = Some(index);
                        ties.push(index);
                    }
                    Some(current) => {
                        match self
                            .descriptor
                            .compare_keys(cursor.key(), cursors[current].key())
                        {
                            Ordering::Less => {
                                min = Some(index);
                                ties.clear();
                                ties.push(index);
                            }
                            Ordering::Equal => ties.push(index),
                            Ordering::Greater => (),
                        }
                    }
                }
            }
            let Some(min) = min else {
                return Ok(ControlFlow::Continue(()));
            };

            // Uncounted entries report one occurrence however many runs hold them.
            let count = if self.counted {
                ties.iter().map(|&index| cursors[index].count()).sum()
            } else {
                1
            };
            if emit(cursors[min].key(), count)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            for &index in &ties {
                cursors[index].step()?;
            }
        }
    }

    /// Runs intermediate merge passes until at most [`MERGEBUFF2`] runs are
    /// left.  Each pass writes its output to a new spill file from `backend`
    /// and drops the previous one.
    pub fn reduce(
        &self,
        backend: &dyn StorageBackend,
        mut file: Box<dyn SpillFile>,
        mut runs: Vec<Run>,
    ) -> Result<(Box<dyn SpillFile>, Vec<Run>), UniqueError> {
        while runs.len() > MERGEBUFF2 {
            debug!(runs = runs.len(), "running an intermediate merge pass");
            let mut output = backend.create_with_prefix(SPILL_FILE_PREFIX)?;
            let mut merged = Vec::new();
            merged
                .try_reserve_exact(runs.len() / MERGEBUFF + 1)
                .map_err(UniqueError::out_of_memory(
                    (runs.len() / MERGEBUFF + 1) * size_of::<Run>(),
                ))?;

            let mut start = 0;
            while start + MERGEBUFF * 3 / 2 < runs.len() {
                merged.push(self.merge_into(
                    &*file,
                    &runs[start..start + MERGEBUFF],
                    &mut *output,
                )?);
                start += MERGEBUFF;
            }
            merged.push(self.merge_into(&*file, &runs[start..], &mut *output)?);

            output.flush()?;
            file = output;
            runs = merged;
            counter!(MERGE_PASSES).increment(1);
        }
        Ok((file, runs))
    }

    /// Merges `runs` of `file` into a single run appended to `output`.
    fn merge_into(
        &self,
        file: &dyn SpillFile,
        runs: &[Run],
        output: &mut dyn SpillFile,
    ) -> Result<Run, UniqueError> {
        let start = output.position();
        let mut elements = 0;
        self.merge(file, runs, |key, count| {
            output.append(key)?;
            if self.counted {
                output.append(&count.to_le_bytes())?;
            }
            elements += 1;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(Run {
            start,
            end: output.position(),
            elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use pretty_assertions::assert_eq;

    use super::{Merger, Run};
    use crate::{
        cost::MERGEBUFF2,
        descriptor::KeyDescriptor,
        error::UniqueError,
        storage::backend::{memory_impl::MemoryBackend, SpillFile, StorageBackend},
    };

    /// Writes each of `runs` as a run of 2-byte keys with counts.
    fn write_runs(file: &mut dyn SpillFile, runs: &[&[(u16, u64)]]) -> Vec<Run> {
        let mut result = Vec::new();
        for run in runs {
            let start = file.position();
            for (key, count) in run.iter() {
                file.append(&key.to_be_bytes()).unwrap();
                file.append(&count.to_le_bytes()).unwrap();
            }
            result.push(Run {
                start,
                end: file.position(),
                elements: run.len() as u64,
            });
        }
        file.flush().unwrap();
        result
    }

    fn collect(merger: &Merger<'_>, file: &dyn SpillFile, runs: &[Run]) -> Vec<(u16, u64)> {
        let mut output = Vec::new();
        merger
            .merge(file, runs, |key, count| {
                output.push((u16::from_be_bytes([key[0], key[1]]), count));
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        output
    }

    #[test]
    fn combines_counts_of_equal_keys() {
        let descriptor = KeyDescriptor::fixed(2, |a, b| a.cmp(b));
        let backend = MemoryBackend::new();
        let mut file = backend.create().unwrap();
        let runs = write_runs(
            &mut *file,
            &[&[(1, 1), (3, 2), (9, 1)], &[(2, 5), (3, 1)], &[], &[(0, 1), (9, 4)]],
        );

        // A tiny buffer forces every cursor to refill after each entry.
        let merger = Merger::new(&descriptor, true, 10, 1);
        assert_eq!(
            collect(&merger, &*file, &runs),
            vec![(0, 1), (1, 1), (2, 5), (3, 3), (9, 5)]
        );
    }

    #[test]
    fn early_stop() {
        let descriptor = KeyDescriptor::fixed(2, |a, b| a.cmp(b));
        let backend = MemoryBackend::new();
        let mut file = backend.create().unwrap();
        let runs = write_runs(&mut *file, &[&[(1, 1), (2, 1)], &[(3, 1)]]);
        let merger = Merger::new(&descriptor, true, 10, 1024);

        let mut seen = 0;
        let flow = merger
            .merge(&*file, &runs, |_, _| {
                seen += 1;
                Ok(ControlFlow::Break(()))
            })
            .unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(seen, 1);
    }

    #[test]
    fn truncated_run() {
        let descriptor = KeyDescriptor::fixed(2, |a, b| a.cmp(b));
        let backend = MemoryBackend::new();
        let mut file = backend.create().unwrap();
        let mut runs = write_runs(&mut *file, &[&[(1, 1), (2, 1)]]);
        runs[0].end -= 3;

        let merger = Merger::new(&descriptor, true, 10, 1024);
        let result = merger.merge(&*file, &runs, |_, _| Ok(ControlFlow::Continue(())));
        assert!(matches!(
            result,
            Err(UniqueError::CorruptedRun { offset: 10 })
        ));
    }

    #[test]
    fn uncounted_keys_count_once() {
        let descriptor = KeyDescriptor::fixed(2, |a, b| a.cmp(b));
        let backend = MemoryBackend::new();
        let mut file = backend.create().unwrap();
        let contents: [&[u16]; 3] = [&[1, 4], &[1, 2, 4], &[4]];
        let mut runs = Vec::new();
        for run in contents {
            let start = file.position();
            for key in run {
                file.append(&key.to_be_bytes()).unwrap();
            }
            runs.push(Run {
                start,
                end: file.position(),
                elements: run.len() as u64,
            });
        }
        file.flush().unwrap();

        let merger = Merger::new(&descriptor, false, 2, 64);
        assert_eq!(
            collect(&merger, &*file, &runs),
            vec![(1, 1), (2, 1), (4, 1)]
        );
    }

    #[test]
    fn intermediate_passes() {
        let descriptor = KeyDescriptor::fixed(2, |a, b| a.cmp(b));
        let backend = MemoryBackend::new();
        let mut file = backend.create().unwrap();

        // 40 runs; run i holds keys i, i+1, ... i+4, so key k appears in
        // min(k, 4) + 1 runs for small k.
        let contents: Vec<Vec<(u16, u64)>> = (0..40u16)
            .map(|i| (i..i + 5).map(|key| (key, 1)).collect())
            .collect();
        let slices: Vec<&[(u16, u64)]> = contents.iter().map(Vec::as_slice).collect();
        let runs = write_runs(&mut *file, &slices);
        let expected = collect(&Merger::new(&descriptor, true, 10, 4096), &*file, &runs);

        let merger = Merger::new(&descriptor, true, 10, 4096);
        let (file, runs) = merger.reduce(&backend, file, runs).unwrap();
        assert!(runs.len() <= MERGEBUFF2);
        // 40 runs need a single pass.
        assert_eq!(backend.files_created(), 2);
        let name = file.path().unwrap().to_str().unwrap();
        assert!(name.starts_with("unique-"), "{name}");
        assert_eq!(collect(&merger, &*file, &runs), expected);

        assert_eq!(expected.len(), 44);
        assert_eq!(expected[0], (0, 1));
        assert_eq!(expected[20], (20, 5));
        assert_eq!(expected[43], (43, 1));
    }
}
