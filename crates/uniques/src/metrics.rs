//! Metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! spill backends and the [`Unique`](crate::Unique) engine maintain via
//! [`metrics`] crate interfaces.
use ::metrics::{describe_counter, Unit};
use std::sync::Once;

/// Total number of spill files created.
pub const FILES_CREATED: &str = "spill.total_files_created";

/// Total number of spill files deleted.
pub const FILES_DELETED: &str = "spill.total_files_deleted";

/// Total number of successful spill writes.
pub const WRITES_SUCCESS: &str = "spill.total_writes_success";

/// Total number of failed spill writes.
pub const WRITES_FAILED: &str = "spill.total_writes_failed";

/// Total number of successful spill reads.
pub const READS_SUCCESS: &str = "spill.total_reads_success";

/// Total number of failed spill reads.
pub const READS_FAILED: &str = "spill.total_reads_failed";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "spill.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "spill.total_bytes_read";

/// Total number of runs flushed from a unique tree to its spill file.
pub const RUNS_FLUSHED: &str = "unique.runs_flushed";

/// Total number of intermediate merge passes.
pub const MERGE_PASSES: &str = "unique.merge_passes";

/// Total number of keys handed to an output sink or walk visitor.
pub const KEYS_EMITTED: &str = "unique.keys_emitted";

/// Total number of keys dropped for having fewer than `min_dupl_count`
/// occurrences.
pub const KEYS_FILTERED: &str = "unique.keys_filtered";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(FILES_CREATED, "total number of spill files created");
        describe_counter!(FILES_DELETED, "total number of spill files deleted");
        describe_counter!(WRITES_SUCCESS, "total number of spill writes");
        describe_counter!(WRITES_FAILED, "total number of failed spill writes");
        describe_counter!(READS_SUCCESS, "total number of spill reads");
        describe_counter!(READS_FAILED, "total number of failed spill reads");

        describe_counter!(
            TOTAL_BYTES_WRITTEN,
            Unit::Bytes,
            "total number of bytes written to spill files"
        );
        describe_counter!(
            TOTAL_BYTES_READ,
            Unit::Bytes,
            "total number of bytes read from spill files"
        );

        describe_counter!(RUNS_FLUSHED, "total number of sorted runs spilled");
        describe_counter!(MERGE_PASSES, "total number of intermediate merge passes");
        describe_counter!(KEYS_EMITTED, "total number of distinct keys emitted");
        describe_counter!(
            KEYS_FILTERED,
            "total number of distinct keys dropped by the duplicate threshold"
        );
    });
}
