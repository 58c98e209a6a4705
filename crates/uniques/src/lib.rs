//! Bounded-memory duplicate elimination.
//!
//! [`Unique`] computes the distinct keys of an input that may be much larger
//! than memory, together with the number of times each key occurs.  Keys are
//! held in an in-memory tree until a configurable budget is reached, then
//! written to a spill file as sorted runs that are merged when the result is
//! requested.
//!
//! Keys are byte strings described by a [`KeyDescriptor`]: either fixed-size
//! keys with a caller-supplied comparator, or variable-size keys packed from
//! typed values by the descriptor itself.  The [`cost`] module estimates what
//! deduplicating a given number of keys would cost before any work is done.

pub mod config;
pub mod cost;
pub mod descriptor;
pub mod error;
pub mod metrics;
pub mod storage;
mod tree;
pub mod unique;

pub use config::UniqueConfig;
pub use descriptor::{
    Datum, FieldKind, FixedSizeKeys, KeyComparator, KeyDescriptor, SortField, VariableSizeKeys,
};
pub use error::{DescriptorError, UniqueError};
pub use storage::backend::{StorageBackend, StorageError};
pub use tree::TREE_ELEMENT_SIZE;
pub use unique::{CountedKeyList, KeyList, ResultFile, ResultFileReader, Unique, UniqueSink};
