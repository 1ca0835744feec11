//! Memory budget for everything the hosted consumer allocates.
//!
//! All four allocation primitives (plain, page-aligned contiguous, resize, free) go through a
//! [`MemoryBudget`], which refuses any request that would push the bytes outstanding above the
//! configured ceiling. Outstanding bytes are summed on demand from per-thread statistic shards, so
//! the allocation hot path never takes a global lock.
//!
//! Allocations are returned as owned [`Block`]s; dropping a block is the free primitive and cannot
//! fail.
#![forbid(unsafe_code)]

mod budget;
mod error;
mod ledger;

pub use budget::{AllocKind, Block, BudgetStats, KindStats, MemoryBudget, Tracking};
pub use error::{MemError, Result};
pub use ledger::{AllocationRecord, LeakReport};

/// Lower bound for the configured ceiling. A configured value below this is ignored.
pub const MIN_CEILING: usize = 32 << 20;

/// Granularity of contiguous allocations.
pub const PAGE_SIZE: usize = 4096;

/// Resolves the effective ceiling from an optional configured value.
///
/// The floor always wins: `None`, or any value below [`MIN_CEILING`], yields [`MIN_CEILING`].
pub fn effective_ceiling(configured: Option<usize>) -> usize {
    configured.unwrap_or(0).max(MIN_CEILING)
}

/// Rounds `size` up to a whole number of pages.
pub fn page_round_up(size: usize) -> Option<usize> {
    size.checked_add(PAGE_SIZE - 1).map(|v| v & !(PAGE_SIZE - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_wins_over_small_configured_ceiling() {
        assert_eq!(effective_ceiling(None), MIN_CEILING);
        assert_eq!(effective_ceiling(Some(1 << 20)), MIN_CEILING);
        assert_eq!(effective_ceiling(Some(64 << 20)), 64 << 20);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(1), Some(PAGE_SIZE));
        assert_eq!(page_round_up(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_round_up(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(page_round_up(usize::MAX), None);
    }
}
