//! Cost model for [`Unique`](crate::Unique).
//!
//! These functions let a planner estimate, before building anything, what it
//! costs to deduplicate `nkeys` keys with a unique tree under a memory budget,
//! so that it can pick between this and a plain sort.  Costs are in the same
//! units as one sequential page read; `compare_factor` is the number of key
//! comparisons that cost as much as that.

use std::{
    f64::consts::{E, LN_2, PI},
    mem::size_of,
};

use crate::tree::TREE_ELEMENT_SIZE;

/// Number of runs merged together by one intermediate merge step.
pub const MERGEBUFF: usize = 7;

/// Intermediate merge passes run while there are at least this many runs.
pub const MERGEBUFF2: usize = 15;

/// Size of one I/O request, in bytes.
pub const IO_SIZE: usize = 4096;

/// Cost of one disk seek, relative to reading one page sequentially.
pub const DISK_SEEK_BASE_COST: f64 = 0.9;

/// Size of the occurrence counter stored after a key in a spilled run.
pub const COUNTER_SIZE: usize = size_of::<u64>();

/// Rounds `size` up to the alignment of tree allocations.
pub const fn align_size(size: usize) -> usize {
    const ALIGN: usize = 8;
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Number of `key_size`-byte keys a tree can hold within
/// `max_in_memory_size`, never less than 1.
pub fn max_elements_in_tree(key_size: usize, max_in_memory_size: usize) -> usize {
    (max_in_memory_size / align_size(TREE_ELEMENT_SIZE + key_size)).max(1)
}

/// Expected cost of locating a key in a balanced tree of `tree_elems`
/// entries.
pub fn search_cost(tree_elems: u64, compare_factor: f64) -> f64 {
    (tree_elems as f64).ln() / (compare_factor * LN_2)
}

/// Size in bytes of the scratch buffer [`use_cost`] needs: one counter per
/// run the keys would be spilled into, plus one.
pub fn cost_calc_buff_size(nkeys: usize, key_size: usize, max_in_memory_size: usize) -> usize {
    size_of::<u32>() * (1 + nkeys / max_elements_in_tree(key_size, max_in_memory_size))
}

/// Approximates `log2(x!)` with Stirling's formula.
fn log2_n_fact(x: f64) -> f64 {
    ((2.0 * PI * x).ln() / 2.0 + x * (x / E).ln()) / LN_2
}

/// Cost of merging the runs whose sizes are `runs` into one.  Returns the
/// cost and the number of elements of the merged run.
fn merge_buffers_cost(runs: &[u64], elem_size: usize, compare_factor: f64) -> (f64, u64) {
    let total: u64 = runs.iter().sum();
    let cost = 2.0 * (total as f64 * elem_size as f64) / IO_SIZE as f64
        + total as f64 * (runs.len() as f64).ln() / (compare_factor * LN_2);
    (cost, total)
}

/// Cost of merging `n_full_trees` runs of `max_n_elems` elements and one run
/// of `last_n_elems` elements, following the same pass structure as the
/// engine's merge.  `buffer` is scratch space for run sizes.
fn merge_many_buffs_cost(
    buffer: &mut Vec<u64>,
    n_full_trees: usize,
    max_n_elems: u64,
    last_n_elems: u64,
    elem_size: usize,
    compare_factor: f64,
) -> f64 {
    buffer.clear();
    buffer.resize(n_full_trees, max_n_elems);
    buffer.push(last_n_elems);

    let mut total_cost = 0.0;
    while buffer.len() > MERGEBUFF2 {
        let mut merged = 0;
        let mut start = 0;
        while start + MERGEBUFF * 3 / 2 < buffer.len() {
            let (cost, total) =
                merge_buffers_cost(&buffer[start..start + MERGEBUFF], elem_size, compare_factor);
            total_cost += cost;
            buffer[merged] = total;
            merged += 1;
            start += MERGEBUFF;
        }
        let (cost, total) = merge_buffers_cost(&buffer[start..], elem_size, compare_factor);
        total_cost += cost;
        buffer[merged] = total;
        buffer.truncate(merged + 1);
    }

    // The final merge.
    total_cost + merge_buffers_cost(buffer, elem_size, compare_factor).0
}

/// Estimated cost of [`use_cost`], and whether the keys fit in memory.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UseCost {
    pub cost: f64,
    /// True if all `nkeys` keys fit in one tree, so nothing would be spilled.
    pub in_memory: bool,
}

/// Estimates the cost of deduplicating `nkeys` keys of `key_size` bytes with
/// a unique tree limited to `max_in_memory_size` bytes.
///
/// The estimate covers building the trees, writing all but the last to disk,
/// merging the runs, and reading the result back.  `intersect` accounts for
/// the occurrence counters stored with each key when a duplicate threshold is
/// in effect.
pub fn use_cost(
    nkeys: usize,
    key_size: usize,
    max_in_memory_size: usize,
    compare_factor: f64,
    intersect: bool,
) -> UseCost {
    let max_elements_in_tree = max_elements_in_tree(key_size, max_in_memory_size);
    let n_full_trees = nkeys / max_elements_in_tree;
    let last_tree_elems = nkeys % max_elements_in_tree;

    // Building the trees.
    let mut cost = 2.0 * log2_n_fact(last_tree_elems as f64 + 1.0);
    if n_full_trees > 0 {
        cost += n_full_trees as f64 * log2_n_fact(max_elements_in_tree as f64 + 1.0);
    }
    cost /= compare_factor;

    if n_full_trees == 0 {
        return UseCost {
            cost,
            in_memory: true,
        };
    }

    // Writing the runs, assuming sequential writes.
    cost += DISK_SEEK_BASE_COST
        * n_full_trees as f64
        * (key_size as f64 * max_elements_in_tree as f64 / IO_SIZE as f64).ceil();
    cost += DISK_SEEK_BASE_COST * (key_size as f64 * last_tree_elems as f64 / IO_SIZE as f64).ceil();

    // Merging them.
    let elem_size = if intersect {
        key_size + COUNTER_SIZE
    } else {
        key_size
    };
    let runs = cost_calc_buff_size(nkeys, key_size, max_in_memory_size) / size_of::<u32>();
    let mut buffer = Vec::with_capacity(runs);
    cost += merge_many_buffs_cost(
        &mut buffer,
        n_full_trees,
        max_elements_in_tree as u64,
        last_tree_elems as u64,
        elem_size,
        compare_factor,
    );

    // Reading the result, assuming no duplicates.
    cost += (key_size as f64 * nkeys as f64 / IO_SIZE as f64).ceil();

    UseCost {
        cost,
        in_memory: false,
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::LN_2;

    use super::{
        align_size, cost_calc_buff_size, max_elements_in_tree, merge_many_buffs_cost, search_cost,
        use_cost, IO_SIZE, MERGEBUFF2,
    };
    use crate::tree::TREE_ELEMENT_SIZE;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "{actual} is not close to {expected}"
        );
    }

    #[test]
    fn search_cost_is_log2() {
        assert_close(search_cost(1024, 1.0), 10.0);
        assert_close(search_cost(1024, 2.0), 5.0);
        assert_close(search_cost(1, 1.0), 0.0);
    }

    #[test]
    fn buffer_size() {
        let element = align_size(TREE_ELEMENT_SIZE + 8);

        // Room for 10 elements: 95 keys spill into 9 full trees plus a tail.
        assert_eq!(cost_calc_buff_size(95, 8, element * 10), 4 * (1 + 9));

        // A budget below one element still holds one.
        assert_eq!(max_elements_in_tree(8, 1), 1);
        assert_eq!(cost_calc_buff_size(3, 8, 1), 4 * 4);
    }

    #[test]
    fn in_memory_when_everything_fits() {
        let element = align_size(TREE_ELEMENT_SIZE + 16);
        let estimate = use_cost(99, 16, element * 100, 5.0, false);
        assert!(estimate.in_memory);
        assert!(estimate.cost > 0.0);

        // Exactly one full tree already counts as spilled.
        let estimate = use_cost(100, 16, element * 100, 5.0, false);
        assert!(!estimate.in_memory);
    }

    #[test]
    fn counters_make_merging_more_expensive() {
        let element = align_size(TREE_ELEMENT_SIZE + 16);
        let spills = use_cost(100_000, 16, element * 1000, 5.0, false);
        let intersect = use_cost(100_000, 16, element * 1000, 5.0, true);
        assert!(!spills.in_memory);
        assert!(intersect.cost > spills.cost);

        // Nothing is merged in memory, so counters change nothing there.
        let fits = use_cost(500, 16, element * 1000, 5.0, false);
        assert_eq!(fits, use_cost(500, 16, element * 1000, 5.0, true));
    }

    #[test]
    fn many_runs_use_intermediate_passes() {
        let element = align_size(TREE_ELEMENT_SIZE + 8);
        let few = use_cost(10 * MERGEBUFF2 - 1, 8, element * 10, 1.0, false);
        let many = use_cost(10 * MERGEBUFF2 * 8, 8, element * 10, 1.0, false);
        assert!(!few.in_memory && !many.in_memory);
        assert!(many.cost.is_finite());
        assert!(many.cost > few.cost * 5.0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn more_keys_than_fit_in_u32() {
        let nkeys = 5_000_000_000;
        let estimate = use_cost(nkeys, 8, 1 << 20, 1.0, false);
        assert!(!estimate.in_memory);
        assert!(estimate.cost.is_finite());
        assert!(estimate.cost > use_cost(nkeys / 2, 8, 1 << 20, 1.0, false).cost);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn trees_larger_than_u32() {
        let per_tree = max_elements_in_tree(8, 1 << 40);
        assert!(per_tree as u64 > u64::from(u32::MAX));

        let estimate = use_cost(per_tree * 2 + 5, 8, 1 << 40, 1.0, false);
        assert!(!estimate.in_memory);
        assert!(estimate.cost.is_finite());

        // Three runs merged in one step: write and read every element once,
        // comparing against log2(3) candidates.
        let total = 2 * (u64::from(u32::MAX) + 1) + 1;
        let mut buffer = Vec::new();
        let cost = merge_many_buffs_cost(&mut buffer, 2, u64::from(u32::MAX) + 1, 1, 8, 1.0);
        let expected =
            2.0 * (total as f64 * 8.0) / IO_SIZE as f64 + total as f64 * 3f64.ln() / LN_2;
        assert!((cost - expected).abs() / expected < 1e-12, "{cost} != {expected}");
    }

    #[test]
    fn deterministic() {
        assert_eq!(
            use_cost(12345, 24, 4096, 3.0, true),
            use_cost(12345, 24, 4096, 3.0, true)
        );
    }
}
