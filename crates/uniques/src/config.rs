//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default memory budget for a unique tree, in bytes.
pub const DEFAULT_MAX_IN_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for a [`Unique`](crate::Unique) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniqueConfig {
    /// Byte ceiling for keys held in the in-memory tree.  When an insertion
    /// would exceed it, the tree is flushed to the spill file as a sorted run.
    ///
    /// A budget too small for a single element is raised to fit exactly one.
    pub max_in_memory_size: usize,

    /// Minimum number of occurrences a key needs to appear in the output.
    ///
    /// 0 disables filtering (union semantics).  Values above 1 implement
    /// intersection-like semantics.
    pub min_dupl_count: u32,

    /// Whether spilled runs store an occurrence counter after each key.
    ///
    /// Without counters, every key is reported with a count of 1, whether or
    /// not it was spilled.  Always on when `min_dupl_count` is nonzero.
    pub with_counters: bool,

    /// Directory for spill files.
    ///
    /// If unset, spill files go to a per-thread temporary directory.
    pub spill_dir: Option<PathBuf>,
}

impl Default for UniqueConfig {
    fn default() -> Self {
        Self {
            max_in_memory_size: DEFAULT_MAX_IN_MEMORY_SIZE,
            min_dupl_count: 0,
            with_counters: true,
            spill_dir: None,
        }
    }
}

impl UniqueConfig {
    pub fn with_max_in_memory_size(self, max_in_memory_size: usize) -> Self {
        Self {
            max_in_memory_size,
            ..self
        }
    }

    pub fn with_min_dupl_count(self, min_dupl_count: u32) -> Self {
        Self {
            min_dupl_count,
            ..self
        }
    }

    pub fn with_counters(self, with_counters: bool) -> Self {
        Self {
            with_counters,
            ..self
        }
    }

    pub fn with_spill_dir(self, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: Some(spill_dir.into()),
            ..self
        }
    }

    /// Returns whether spilled runs carry occurrence counters.
    pub fn counters_stored(&self) -> bool {
        self.with_counters || self.min_dupl_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::{UniqueConfig, DEFAULT_MAX_IN_MEMORY_SIZE};
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_from_empty_json() {
        let config: UniqueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, UniqueConfig::default());
        assert_eq!(config.max_in_memory_size, DEFAULT_MAX_IN_MEMORY_SIZE);
        assert!(config.counters_stored());
    }

    #[test]
    fn partial_json() {
        let config: UniqueConfig = serde_json::from_str(
            r#"{"max_in_memory_size": 4096, "with_counters": false, "spill_dir": "/tmp/spill"}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            UniqueConfig::default()
                .with_max_in_memory_size(4096)
                .with_counters(false)
                .with_spill_dir("/tmp/spill")
        );
        assert!(!config.counters_stored());
        assert!(config.with_min_dupl_count(2).counters_stored());
    }
}
