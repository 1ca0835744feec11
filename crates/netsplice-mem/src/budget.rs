use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ledger::{LeakReport, Ledger, NullLedger, TrackingLedger};
use crate::{page_round_up, MemError, Result};

/// Number of statistic shards. Each thread is pinned to one shard on first use.
const STAT_SHARDS: usize = 16;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % STAT_SHARDS;
}

fn shard_index() -> usize {
    SHARD.with(|shard| *shard)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// General-purpose allocation, released with the plain free primitive.
    Plain,
    /// Page-granular contiguous allocation, released with the contiguous free primitive.
    Contiguous,
}

impl AllocKind {
    const COUNT: usize = 2;

    fn slot(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Contiguous => 1,
        }
    }
}

/// Which ledger implementation backs the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tracking {
    #[default]
    Off,
    /// Record file/line/size/comment of every live allocation for leak reports.
    Ledger,
}

/// Accounting for one allocation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindStats {
    pub outstanding: usize,
    pub allocations: u64,
    pub frees: u64,
}

/// Snapshot of budget accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetStats {
    pub ceiling: usize,
    pub outstanding: usize,
    pub allocations: u64,
    pub frees: u64,
    pub plain: KindStats,
    pub contiguous: KindStats,
}

impl BudgetStats {
    pub fn kind(&self, kind: AllocKind) -> KindStats {
        match kind {
            AllocKind::Plain => self.plain,
            AllocKind::Contiguous => self.contiguous,
        }
    }
}

#[derive(Default)]
struct ShardStats {
    // Signed: a block may be freed on a different thread (and shard) than it was allocated on.
    bytes: [AtomicIsize; AllocKind::COUNT],
    allocations: [AtomicU64; AllocKind::COUNT],
    frees: [AtomicU64; AllocKind::COUNT],
}

struct BudgetInner {
    ceiling: usize,
    shards: Box<[ShardStats]>,
    next_id: AtomicU64,
    ledger: Box<dyn Ledger>,
}

impl BudgetInner {
    fn kind_bytes(&self, kind: AllocKind) -> isize {
        self.shards
            .iter()
            .map(|s| s.bytes[kind.slot()].load(Ordering::SeqCst))
            .sum()
    }

    fn outstanding(&self) -> usize {
        let total: isize = self
            .shards
            .iter()
            .flat_map(|s| s.bytes.iter())
            .map(|b| b.load(Ordering::SeqCst))
            .sum();
        usize::try_from(total).unwrap_or(0)
    }

    /// Charges `requested` bytes to the calling thread's shard, then checks the summed total.
    ///
    /// Concurrent reservations each see the others' charges, so the ceiling holds without a
    /// shared lock; racing requests may both be refused, never both granted past the ceiling.
    fn reserve(&self, requested: usize, kind: AllocKind) -> Result<()> {
        let refuse = |outstanding| MemError::OutOfMemory {
            requested,
            outstanding,
            ceiling: self.ceiling,
        };
        if requested > self.ceiling {
            return Err(refuse(self.outstanding()));
        }
        let Ok(delta) = isize::try_from(requested) else {
            return Err(refuse(self.outstanding()));
        };
        let bytes = &self.shards[shard_index()].bytes[kind.slot()];
        bytes.fetch_add(delta, Ordering::SeqCst);
        let total = self.outstanding();
        if total > self.ceiling {
            bytes.fetch_sub(delta, Ordering::SeqCst);
            return Err(refuse(total.saturating_sub(requested)));
        }
        Ok(())
    }

    fn adjust(&self, kind: AllocKind, delta: isize) {
        self.shards[shard_index()].bytes[kind.slot()].fetch_add(delta, Ordering::SeqCst);
    }
}

/// Process-wide allocator wrapper enforcing a hard ceiling on outstanding bytes.
///
/// Cloning is cheap; all clones share the same accounting.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("ceiling", &self.inner.ceiling)
            .field("outstanding", &self.inner.outstanding())
            .finish()
    }
}

impl MemoryBudget {
    /// Budget with an exact ceiling and no allocation ledger.
    pub fn new(ceiling: usize) -> Self {
        Self::with_tracking(ceiling, Tracking::Off)
    }

    pub fn with_tracking(ceiling: usize, tracking: Tracking) -> Self {
        let ledger: Box<dyn Ledger> = match tracking {
            Tracking::Off => Box::new(NullLedger),
            Tracking::Ledger => Box::new(TrackingLedger::default()),
        };
        let shards = (0..STAT_SHARDS).map(|_| ShardStats::default()).collect();
        Self {
            inner: Arc::new(BudgetInner {
                ceiling,
                shards,
                next_id: AtomicU64::new(1),
                ledger,
            }),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    /// Bytes currently outstanding across all live blocks.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    pub fn stats(&self) -> BudgetStats {
        let kind_stats = |kind: AllocKind| {
            let (allocations, frees) = self.inner.shards.iter().fold((0, 0), |(a, f), s| {
                (
                    a + s.allocations[kind.slot()].load(Ordering::Relaxed),
                    f + s.frees[kind.slot()].load(Ordering::Relaxed),
                )
            });
            KindStats {
                outstanding: usize::try_from(self.inner.kind_bytes(kind)).unwrap_or(0),
                allocations,
                frees,
            }
        };
        let plain = kind_stats(AllocKind::Plain);
        let contiguous = kind_stats(AllocKind::Contiguous);
        BudgetStats {
            ceiling: self.inner.ceiling,
            outstanding: self.inner.outstanding(),
            allocations: plain.allocations + contiguous.allocations,
            frees: plain.frees + contiguous.frees,
            plain,
            contiguous,
        }
    }

    /// Plain allocation of exactly `size` zeroed bytes.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> Result<Block> {
        self.allocate(size, AllocKind::Plain, None, Location::caller())
    }

    /// Like [`MemoryBudget::alloc`], with a note carried into leak reports.
    #[track_caller]
    pub fn alloc_commented(&self, size: usize, comment: &'static str) -> Result<Block> {
        self.allocate(size, AllocKind::Plain, Some(comment), Location::caller())
    }

    /// Contiguous allocation rounded up to whole pages.
    #[track_caller]
    pub fn alloc_contig(&self, size: usize) -> Result<Block> {
        self.allocate(size, AllocKind::Contiguous, None, Location::caller())
    }

    /// Removes and returns every allocation the ledger still considers live.
    ///
    /// With [`Tracking::Off`] the report is always empty.
    pub fn check_for_leaks(&self) -> LeakReport {
        let report = self.inner.ledger.take_leaks();
        if !report.is_empty() {
            for a in &report.allocations {
                tracing::error!(
                    id = a.id,
                    size = a.size,
                    kind = ?a.kind,
                    file = a.file,
                    line = a.line,
                    comment = a.comment.unwrap_or(""),
                    "leaked allocation"
                );
            }
            tracing::error!(
                allocations = report.allocations.len(),
                bytes = report.bytes,
                "leaked allocations"
            );
        }
        report
    }

    fn allocate(
        &self,
        size: usize,
        kind: AllocKind,
        comment: Option<&'static str>,
        site: &'static Location<'static>,
    ) -> Result<Block> {
        let size = match kind {
            AllocKind::Plain => size,
            AllocKind::Contiguous => {
                page_round_up(size).ok_or(MemError::Exhausted { requested: size })?
            }
        };
        self.inner.reserve(size, kind)?;
        let data = zeroed(size).inspect_err(|_| self.inner.adjust(kind, -(size as isize)))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.shards[shard_index()].allocations[kind.slot()].fetch_add(1, Ordering::Relaxed);
        self.inner.ledger.record(id, size, kind, site, comment);

        Ok(Block {
            data,
            kind,
            id,
            budget: self.inner.clone(),
        })
    }
}

fn zeroed(size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| MemError::Exhausted { requested: size })?;
    data.resize(size, 0);
    Ok(data)
}

/// Memory granted by a [`MemoryBudget`]. Dropping the block frees it.
pub struct Block {
    data: Vec<u8>,
    kind: AllocKind,
    id: u64,
    budget: Arc<BudgetInner>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Block {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resize in place. Only growth is checked against the ceiling; shrinking always succeeds.
    ///
    /// Contiguous blocks keep page granularity.
    #[track_caller]
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        let site = Location::caller();
        let new_size = match self.kind {
            AllocKind::Plain => new_size,
            AllocKind::Contiguous => {
                page_round_up(new_size).ok_or(MemError::Exhausted { requested: new_size })?
            }
        };
        let old_size = self.data.len();
        if new_size > old_size {
            let grow = new_size - old_size;
            self.budget.reserve(grow, self.kind)?;
            if self.data.try_reserve_exact(grow).is_err() {
                self.budget.adjust(self.kind, -(grow as isize));
                return Err(MemError::Exhausted { requested: grow });
            }
            self.data.resize(new_size, 0);
        } else if new_size < old_size {
            self.data.truncate(new_size);
            self.data.shrink_to_fit();
            self.budget
                .adjust(self.kind, -((old_size - new_size) as isize));
        }
        self.budget.ledger.resized(self.id, new_size, site);
        Ok(())
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for Block {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let slot = self.kind.slot();
        let shard = &self.budget.shards[shard_index()];
        shard.bytes[slot].fetch_sub(self.data.len() as isize, Ordering::SeqCst);
        shard.frees[slot].fetch_add(1, Ordering::Relaxed);
        self.budget.ledger.forget(self.id);
    }
}
