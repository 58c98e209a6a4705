//! Key descriptors.
//!
//! A [`KeyDescriptor`] tells the [`Unique`](crate::Unique) engine how long a
//! key is and how two keys compare.  Fixed-size keys are opaque byte strings
//! ordered by a caller-supplied comparator.  Variable-size keys are packed by
//! the descriptor itself from a list of [`Datum`]s and carry a length prefix.

use std::{cmp::Ordering, fmt};

use crate::error::DescriptorError;

mod packed;

pub use packed::{Datum, FieldKind, SortField, VariableSizeKeys, SIZE_OF_LENGTH_FIELD};

/// A total order over raw key bytes.
pub type KeyComparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering>;

/// Descriptor for keys that all have the same length.
pub struct FixedSizeKeys {
    key_length: usize,
    compare: KeyComparator,
}

impl FixedSizeKeys {
    pub fn new<F>(key_length: usize, compare: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + 'static,
    {
        Self {
            key_length,
            compare: Box::new(compare),
        }
    }

    /// Keys compared as unsigned byte strings.
    pub fn bytewise(key_length: usize) -> Self {
        Self::new(key_length, |a, b| a.cmp(b))
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }
}

impl fmt::Debug for FixedSizeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeKeys")
            .field("key_length", &self.key_length)
            .finish_non_exhaustive()
    }
}

/// Describes the keys inserted into a [`Unique`](crate::Unique) tree.
#[derive(Debug)]
pub enum KeyDescriptor {
    /// Every key is `key_length` bytes long.
    Fixed(FixedSizeKeys),
    /// Keys are length-prefixed packed records.
    Variable(VariableSizeKeys),
}

impl KeyDescriptor {
    /// Descriptor for `key_length`-byte keys ordered by `compare`.
    pub fn fixed<F>(key_length: usize, compare: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + 'static,
    {
        Self::Fixed(FixedSizeKeys::new(key_length, compare))
    }

    /// Descriptor for packed keys of at most `max_key_length` bytes, including
    /// the length prefix.  Call [`setup`](Self::setup) before packing.
    pub fn variable(max_key_length: usize) -> Self {
        Self::Variable(VariableSizeKeys::new(max_key_length))
    }

    /// Returns the fixed key length, or the maximum key length for
    /// variable-size keys.
    pub fn key_length(&self) -> usize {
        match self {
            Self::Fixed(fixed) => fixed.key_length(),
            Self::Variable(variable) => variable.max_key_length(),
        }
    }

    /// Returns the number of bytes of the key that starts at `key[0]`.
    ///
    /// Returns 0 if `key` is too short to hold a length prefix.
    pub fn get_length_of_key(&self, key: &[u8]) -> usize {
        match self {
            Self::Fixed(fixed) => fixed.key_length(),
            Self::Variable(_) => VariableSizeKeys::read_packed_length(key).unwrap_or(0),
        }
    }

    /// Returns the number of leading bytes needed to learn a key's length.
    pub(crate) fn length_probe_size(&self) -> usize {
        match self {
            Self::Fixed(fixed) => fixed.key_length(),
            Self::Variable(_) => SIZE_OF_LENGTH_FIELD,
        }
    }

    pub fn is_variable_sized(&self) -> bool {
        matches!(self, Self::Variable(_))
    }

    /// The total order used to place keys in the tree and to merge runs.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Fixed(fixed) => fixed.compare_keys(a, b),
            Self::Variable(variable) => variable.compare_keys(a, b),
        }
    }

    /// Compares only the first key part.  Equivalent to
    /// [`compare_keys`](Self::compare_keys) for single-part keys.
    pub fn compare_keys_for_single_arg(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Fixed(fixed) => fixed.compare_keys(a, b),
            Self::Variable(variable) => variable.compare_keys_for_single_arg(a, b),
        }
    }

    /// Prepares a variable-size descriptor to pack keys made of `fields`.
    /// Fixed-size descriptors need no preparation.
    pub fn setup(&mut self, fields: Vec<SortField>) -> Result<(), DescriptorError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Variable(variable) => variable.setup(fields),
        }
    }

    /// [`setup`](Self::setup) for a key made of a single field.
    pub fn setup_single(&mut self, field: SortField) -> Result<(), DescriptorError> {
        self.setup(vec![field])
    }

    /// Packs `values` into the scratch buffer and returns the packed length,
    /// prefix included.
    ///
    /// Returns 0 when `exclude_nulls` is set and any value is NULL, and always
    /// for fixed-size descriptors, which do no packing.
    pub fn make_packed_record(
        &mut self,
        values: &[Datum<'_>],
        exclude_nulls: bool,
    ) -> Result<usize, DescriptorError> {
        match self {
            Self::Fixed(_) => Ok(0),
            Self::Variable(variable) => variable.make_packed_record(values, exclude_nulls),
        }
    }

    /// Returns the record most recently packed by
    /// [`make_packed_record`](Self::make_packed_record).
    pub fn packed_rec(&self) -> Option<&[u8]> {
        match self {
            Self::Fixed(_) => None,
            Self::Variable(variable) => Some(variable.packed_rec()),
        }
    }

    /// Lends out the packed record so it can be inserted while the descriptor
    /// compares keys.  Hand it back with
    /// [`restore_packed_rec`](Self::restore_packed_rec).
    pub(crate) fn take_packed_rec(&mut self) -> Vec<u8> {
        match self {
            Self::Fixed(_) => Vec::new(),
            Self::Variable(variable) => variable.take_packed(),
        }
    }

    pub(crate) fn restore_packed_rec(&mut self, packed: Vec<u8>) {
        if let Self::Variable(variable) = self {
            variable.restore_packed(packed);
        }
    }

    /// Returns the key parts of a variable-size descriptor.
    pub fn sort_fields(&self) -> &[SortField] {
        match self {
            Self::Fixed(_) => &[],
            Self::Variable(variable) => variable.sort_fields(),
        }
    }
}

impl From<FixedSizeKeys> for KeyDescriptor {
    fn from(fixed: FixedSizeKeys) -> Self {
        Self::Fixed(fixed)
    }
}

impl From<VariableSizeKeys> for KeyDescriptor {
    fn from(variable: VariableSizeKeys) -> Self {
        Self::Variable(variable)
    }
}
