//! The duplicate-elimination engine.
//!
//! A [`Unique`] collects keys in a balanced tree whose memory use is bounded by
//! [`UniqueConfig::max_in_memory_size`].  When an insertion would exceed the
//! budget, the tree is written to a spill file as a sorted run and emptied.
//! [`Unique::get`] and [`Unique::walk`] then produce every distinct key in
//! ascending order with its number of occurrences, either straight from the
//! tree or by merging the runs.
//!
//! ```
//! use std::ops::ControlFlow;
//! use uniques::{KeyDescriptor, Unique, UniqueConfig};
//!
//! let descriptor = KeyDescriptor::fixed(4, |a, b| a.cmp(b));
//! let mut unique = Unique::new(descriptor, UniqueConfig::default()).unwrap();
//! for key in [3u32, 1, 2, 1, 3, 3] {
//!     unique.add(&key.to_be_bytes()).unwrap();
//! }
//!
//! let mut output = Vec::new();
//! unique
//!     .walk(|key, count| {
//!         output.push((key.to_vec(), count));
//!         ControlFlow::Continue(())
//!     })
//!     .unwrap();
//! assert_eq!(
//!     output,
//!     vec![
//!         (1u32.to_be_bytes().to_vec(), 2),
//!         (2u32.to_be_bytes().to_vec(), 1),
//!         (3u32.to_be_bytes().to_vec(), 3),
//!     ]
//! );
//! ```

use std::{fmt, mem::size_of, ops::ControlFlow, rc::Rc};

use metrics::counter;
use tracing::{debug, trace, warn};

use crate::{
    config::UniqueConfig,
    cost::{COUNTER_SIZE, MERGEBUFF2},
    descriptor::{Datum, KeyDescriptor},
    error::UniqueError,
    metrics::{KEYS_EMITTED, KEYS_FILTERED, RUNS_FLUSHED},
    storage::backend::{
        default_backend_for_thread, new_default_backend, SpillFile, StorageBackend,
    },
    tree::{Inserted, KeyTree, TREE_ELEMENT_SIZE},
};

mod merge;
mod sink;

use merge::{Merger, Run};
pub use sink::{CountedKeyList, KeyList, ResultFile, ResultFileReader, UniqueSink};

/// Prefix of the names of spill files created by [`Unique`].
const SPILL_FILE_PREFIX: &str = "unique-";

/// Collects keys and produces each distinct key once, in order, with the
/// number of times it was added.
///
/// A `Unique` owns its spill file and is meant to be used by one operator on
/// one thread; it is neither `Send` nor `Sync`.
pub struct Unique {
    descriptor: KeyDescriptor,
    backend: Rc<dyn StorageBackend>,

    tree: KeyTree,
    /// Bytes charged to the keys in `tree`.
    memory_used: usize,
    max_in_memory_size: usize,

    /// Created by the first flush.
    file: Option<Box<dyn SpillFile>>,
    runs: Vec<Run>,
    /// Distinct keys written to `runs`, summed over the runs.
    elements: u64,

    size: usize,
    full_size: usize,
    with_counters: bool,
    min_dupl_count: u32,

    /// Set when a flush or merge fails.
    poisoned: bool,
}

impl Unique {
    /// Creates a new instance that spills to `config.spill_dir`, or to a
    /// per-thread temporary directory if that is unset.
    pub fn new(descriptor: KeyDescriptor, config: UniqueConfig) -> Result<Self, UniqueError> {
        let backend = match &config.spill_dir {
            Some(dir) => new_default_backend(dir.clone())?,
            None => default_backend_for_thread()?,
        };
        Ok(Self::with_backend(descriptor, config, backend))
    }

    /// Creates a new instance that spills to files created by `backend`.
    /// `config.spill_dir` is ignored.
    pub fn with_backend(
        descriptor: KeyDescriptor,
        config: UniqueConfig,
        backend: Rc<dyn StorageBackend>,
    ) -> Self {
        let size = descriptor.key_length();
        let with_counters = config.counters_stored();
        let full_size = if with_counters {
            size + COUNTER_SIZE
        } else {
            size
        };

        // Always leave room for at least one key.
        let mut max_in_memory_size = config.max_in_memory_size;
        if max_in_memory_size < TREE_ELEMENT_SIZE + size {
            max_in_memory_size = TREE_ELEMENT_SIZE + size;
        }

        Self {
            descriptor,
            backend,
            tree: KeyTree::new(),
            memory_used: 0,
            max_in_memory_size,
            file: None,
            runs: Vec::new(),
            elements: 0,
            size,
            full_size,
            with_counters,
            min_dupl_count: config.min_dupl_count,
            poisoned: false,
        }
    }

    fn check_usable(&self) -> Result<(), UniqueError> {
        if self.poisoned {
            Err(UniqueError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Returns whether inserting a new key charged `record_size` bytes would
    /// exceed the budget.  An empty tree is never full.
    fn is_full(&self, record_size: usize) -> bool {
        !self.tree.is_empty()
            && record_size > self.max_in_memory_size.saturating_sub(self.memory_used)
    }

    /// Adds the key that starts at `key[0]`.  The key's length comes from the
    /// descriptor; bytes beyond it are ignored.
    ///
    /// If the tree is not empty and the key would not fit in the budget, the
    /// tree is flushed to the spill file first.  A key too short for its own
    /// length, or longer than the descriptor allows, is skipped.
    pub fn add(&mut self, key: &[u8]) -> Result<(), UniqueError> {
        self.check_usable()?;

        let len = self.descriptor.get_length_of_key(key);
        if len == 0 || key.len() < len {
            debug!(
                "skipping a key of {} bytes that needs {len} bytes",
                key.len()
            );
            return Ok(());
        }
        if len > self.size {
            warn!(
                "skipping a key of {len} bytes, longer than the maximum of {}",
                self.size
            );
            return Ok(());
        }
        let key = &key[..len];

        let record_size = len + TREE_ELEMENT_SIZE;
        if !self.tree.only_dups() && self.is_full(record_size) {
            self.flush()?;
        }

        let descriptor = &self.descriptor;
        match self
            .tree
            .insert(key, |a, b| descriptor.compare_keys(a, b))
        {
            Ok(Inserted::New) => self.memory_used += record_size,
            Ok(Inserted::Duplicate) => (),
            Ok(Inserted::Ignored) => trace!("ignoring a new key in duplicates-only mode"),
            Err(error) => {
                self.poisoned = true;
                return Err(error);
            }
        }
        Ok(())
    }

    /// Packs `values` with the descriptor and adds the packed key.
    ///
    /// Returns `false` without adding anything if `exclude_nulls` is set and
    /// some value is NULL.  Fixed-size descriptors do no packing, so this
    /// always returns `false` for them.
    pub fn add_packed(
        &mut self,
        values: &[Datum<'_>],
        exclude_nulls: bool,
    ) -> Result<bool, UniqueError> {
        self.check_usable()?;
        if self.descriptor.make_packed_record(values, exclude_nulls)? == 0 {
            return Ok(false);
        }
        let key = self.descriptor.take_packed_rec();
        let result = self.add(&key);
        self.descriptor.restore_packed_rec(key);
        result.map(|()| true)
    }

    /// Returns the instance to its just-constructed state.  The spill file,
    /// if any, is deleted; the next flush creates a new one.
    ///
    /// This is also the only way to make an instance usable again after a
    /// failure.
    pub fn reset(&mut self) {
        self.tree.clear();
        self.tree.set_only_dups(false);
        self.memory_used = 0;
        self.file = None;
        self.runs.clear();
        self.elements = 0;
        self.poisoned = false;
    }

    /// Switches to duplicates-only mode: from now on, adding a key that is in
    /// memory increments its count, adding any other key does nothing, and
    /// the tree is never flushed.  Only [`reset`](Self::reset) undoes this.
    pub fn close_for_expansion(&mut self) {
        self.tree.set_only_dups(true);
    }

    /// Returns the number of distinct keys in memory.
    pub fn elements_in_tree(&self) -> usize {
        self.tree.len()
    }

    /// Returns the number of distinct keys.
    ///
    /// Once anything has been spilled, this is the sum of the distinct keys of
    /// each run, counted at the time the run was written.  A key that occurs
    /// in more than one run is counted once per run, and keys that
    /// `min_dupl_count` will filter out are included.
    pub fn n_elements(&self) -> u64 {
        if self.is_in_memory() {
            self.tree.len() as u64
        } else {
            self.elements
        }
    }

    /// Returns the memory budget, after raising it to fit at least one key.
    pub fn max_in_memory_size(&self) -> usize {
        self.max_in_memory_size
    }

    /// Returns the key size: the fixed key length, or the maximum length of a
    /// variable-size key.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the size of a spilled entry: the key size plus the counter, if
    /// counters are stored.
    pub fn full_size(&self) -> usize {
        self.full_size
    }

    /// Returns true if nothing has been written to the spill file.
    pub fn is_in_memory(&self) -> bool {
        self.file.as_ref().map_or(true, |file| file.position() == 0)
    }

    pub fn is_variable_sized(&self) -> bool {
        self.descriptor.is_variable_sized()
    }

    /// Returns whether spilled runs store occurrence counters.
    pub fn is_count_stored(&self) -> bool {
        self.with_counters
    }

    /// Returns the number of bytes charged to the keys in memory.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Returns the number of runs written to the spill file.
    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    /// Size of the read buffer shared by the runs of one merge.
    fn merge_buffer_size(&self) -> usize {
        (MERGEBUFF2 + 1)
            .max(self.max_in_memory_size / self.full_size.max(1) + 1)
            .saturating_mul(self.full_size)
    }

    /// Writes the tree to the spill file as a new run and empties it.
    fn flush(&mut self) -> Result<(), UniqueError> {
        let result = self.write_run();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn write_run(&mut self) -> Result<(), UniqueError> {
        if self.tree.is_empty() {
            return Ok(());
        }
        self.runs
            .try_reserve(1)
            .map_err(UniqueError::out_of_memory(size_of::<Run>()))?;

        let file = match self.file.take() {
            Some(file) => file,
            None => self.backend.create_with_prefix(SPILL_FILE_PREFIX)?,
        };
        let file = self.file.insert(file);

        let start = file.position();
        for (key, count) in self.tree.iter() {
            file.append(key)?;
            if self.with_counters {
                file.append(&count.to_le_bytes())?;
            }
        }
        let run = Run {
            start,
            end: file.position(),
            elements: self.tree.len() as u64,
        };
        debug!(
            run = self.runs.len(),
            keys = run.elements,
            bytes = run.end - run.start,
            "flushed a run"
        );

        self.runs.push(run);
        self.elements += run.elements;
        self.tree.clear();
        self.memory_used = 0;
        counter!(RUNS_FLUSHED).increment(1);
        Ok(())
    }

    /// Calls `visit` for each distinct key that occurs at least
    /// `min_dupl_count` times, in ascending order.  Returns the number of keys
    /// visited.
    fn visit<F>(&mut self, mut visit: F) -> Result<u64, UniqueError>
    where
        F: FnMut(&[u8], u64) -> Result<ControlFlow<()>, UniqueError>,
    {
        self.check_usable()?;

        let min_dupl_count = u64::from(self.min_dupl_count);
        let mut emitted = 0;
        let mut filtered = 0;
        let mut filter = |key: &[u8], count: u64| {
            if count < min_dupl_count {
                filtered += 1;
                return Ok(ControlFlow::Continue(()));
            }
            emitted += 1;
            visit(key, count)
        };

        let result = if self.is_in_memory() {
            let mut result = Ok(());
            let counted = self.with_counters;
            for (key, count) in self.tree.iter() {
                let count = if counted { count } else { 1 };
                match filter(key, count) {
                    Ok(ControlFlow::Continue(())) => (),
                    Ok(ControlFlow::Break(())) => break,
                    Err(error) => {
                        result = Err(error);
                        break;
                    }
                }
            }
            result
        } else {
            self.merge_runs(&mut filter)
        };

        counter!(KEYS_EMITTED).increment(emitted);
        counter!(KEYS_FILTERED).increment(filtered);
        if result.is_err() {
            self.poisoned = true;
        }
        result.map(|()| emitted)
    }

    /// Flushes the tail of the input and merges all the runs.
    fn merge_runs<F>(&mut self, emit: F) -> Result<(), UniqueError>
    where
        F: FnMut(&[u8], u64) -> Result<ControlFlow<()>, UniqueError>,
    {
        self.write_run()?;
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;

        let merger = Merger::new(
            &self.descriptor,
            self.with_counters,
            self.full_size,
            self.merge_buffer_size(),
        );
        let runs = std::mem::take(&mut self.runs);
        debug!(
            runs = runs.len(),
            keys = runs.iter().map(|run| run.elements).sum::<u64>(),
            "merging spilled runs"
        );
        let (file, runs) = merger.reduce(&*self.backend, file, runs)?;
        let file = self.file.insert(file);
        self.runs = runs;

        merger.merge(&**file, &self.runs, emit)?;
        Ok(())
    }

    /// Writes every distinct key that occurs at least `min_dupl_count` times
    /// to `sink`, in ascending order, and returns how many were written.
    ///
    /// If anything was spilled, the keys still in memory are flushed as a
    /// final run and all the runs are merged.  A failure leaves the instance
    /// unusable until [`reset`](Self::reset).
    pub fn get(&mut self, sink: &mut dyn UniqueSink) -> Result<u64, UniqueError> {
        self.visit(|key, count| {
            sink.push(key, count)?;
            Ok(ControlFlow::Continue(()))
        })
    }

    /// Calls `visitor` with every distinct key that occurs at least
    /// `min_dupl_count` times and its count, in ascending order, without
    /// collecting the result.  The walk stops early if `visitor` breaks.
    ///
    /// Like [`get`](Self::get), this flushes the keys in memory once anything
    /// has been spilled.
    pub fn walk<F>(&mut self, mut visitor: F) -> Result<ControlFlow<()>, UniqueError>
    where
        F: FnMut(&[u8], u64) -> ControlFlow<()>,
    {
        let mut flow = ControlFlow::Continue(());
        self.visit(|key, count| {
            flow = visitor(key, count);
            Ok(flow)
        })?;
        Ok(flow)
    }
}

impl fmt::Debug for Unique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unique")
            .field("descriptor", &self.descriptor)
            .field("elements_in_tree", &self.tree.len())
            .field("memory_used", &self.memory_used)
            .field("max_in_memory_size", &self.max_in_memory_size)
            .field("runs", &self.runs.len())
            .field("elements", &self.elements)
            .field("with_counters", &self.with_counters)
            .field("min_dupl_count", &self.min_dupl_count)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}
