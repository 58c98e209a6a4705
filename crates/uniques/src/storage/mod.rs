//! Spill storage.
//!
//! The [backend] layer provides append-only spill files that the
//! [`Unique`](crate::Unique) engine writes sorted runs to and later reads
//! back while merging.
pub mod backend;

#[cfg(test)]
pub(crate) mod test;
