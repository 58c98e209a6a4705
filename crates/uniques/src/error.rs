use std::collections::TryReserveError;

use serde::Serialize;
use thiserror::Error;

use crate::storage::backend::StorageError;

/// An error raised while preparing a key descriptor or packing a key.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum DescriptorError {
    /// [`make_packed_record`](crate::KeyDescriptor::make_packed_record) was
    /// called before the descriptor was set up.
    #[error("The key descriptor has not been set up.")]
    NotSetUp,

    /// The sort fields can produce keys wider than the descriptor's maximum
    /// key length.
    #[error("Packed keys may need {required} bytes but at most {max} are allowed.")]
    KeyTooWide { required: usize, max: usize },

    /// A variable-length value is longer than its field allows.
    #[error("Value of {len} bytes exceeds the maximum of {max} bytes for key part {field}.")]
    ValueTooLong { field: usize, len: usize, max: usize },

    /// A value does not match the kind of its field.
    #[error("Value for key part {field} does not match the field's type.")]
    TypeMismatch { field: usize },

    /// A NULL value was supplied for a field that is not nullable.
    #[error("Key part {field} is not nullable.")]
    NullNotAllowed { field: usize },

    /// The number of values does not match the number of key parts.
    #[error("Expected {expected} key parts, got {actual}.")]
    ArityMismatch { expected: usize, actual: usize },

    /// A packed key could not be decoded.
    #[error("Packed key is truncated or malformed.")]
    Corrupted,

    /// The scratch packing buffer could not be allocated.
    #[error("Unable to allocate a packing buffer of {requested} bytes.")]
    OutOfMemory { requested: usize },
}

/// An error raised by the [`Unique`](crate::Unique) engine.
#[derive(Debug, Error)]
pub enum UniqueError {
    /// Reading or writing the spill file failed.
    #[error("Spill storage error: {0}")]
    Storage(#[from] StorageError),

    /// Packing a key failed.
    #[error("Key descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Memory for the tree, the run directory, or a merge buffer could not be
    /// allocated.
    #[error("Unable to allocate {requested} bytes.")]
    OutOfMemory { requested: usize },

    /// A spilled run ends in the middle of an entry.
    #[error("Spilled run is truncated at offset {offset}.")]
    CorruptedRun { offset: u64 },

    /// An earlier flush or merge failed.  The instance may only be reset or
    /// dropped.
    #[error("The unique instance is unusable after an earlier failure; reset it first.")]
    Poisoned,
}

impl UniqueError {
    pub(crate) fn out_of_memory(requested: usize) -> impl FnOnce(TryReserveError) -> Self {
        move |_| Self::OutOfMemory { requested }
    }
}
