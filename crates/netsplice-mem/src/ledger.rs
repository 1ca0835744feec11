use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::Mutex;

use crate::budget::AllocKind;

/// One live allocation as seen by the tracking ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: u64,
    pub size: usize,
    pub kind: AllocKind,
    pub file: &'static str,
    pub line: u32,
    pub comment: Option<&'static str>,
}

/// Allocations still live when the ledger was checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    pub allocations: Vec<AllocationRecord>,
    pub bytes: usize,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// Bookkeeping hook invoked by the budget around every primitive.
///
/// Selected once when the budget is built; it never influences whether an allocation succeeds.
pub(crate) trait Ledger: Send + Sync {
    fn record(
        &self,
        id: u64,
        size: usize,
        kind: AllocKind,
        site: &'static Location<'static>,
        comment: Option<&'static str>,
    );
    fn resized(&self, id: u64, size: usize, site: &'static Location<'static>);
    fn forget(&self, id: u64);
    fn take_leaks(&self) -> LeakReport;
}

pub(crate) struct NullLedger;

impl Ledger for NullLedger {
    fn record(
        &self,
        _id: u64,
        _size: usize,
        _kind: AllocKind,
        _site: &'static Location<'static>,
        _comment: Option<&'static str>,
    ) {
    }

    fn resized(&self, _id: u64, _size: usize, _site: &'static Location<'static>) {}

    fn forget(&self, _id: u64) {}

    fn take_leaks(&self) -> LeakReport {
        LeakReport::default()
    }
}

/// Ledger keyed by allocation id, guarded by its own lock.
#[derive(Default)]
pub(crate) struct TrackingLedger {
    live: Mutex<BTreeMap<u64, AllocationRecord>>,
}

impl Ledger for TrackingLedger {
    fn record(
        &self,
        id: u64,
        size: usize,
        kind: AllocKind,
        site: &'static Location<'static>,
        comment: Option<&'static str>,
    ) {
        let record = AllocationRecord {
            id,
            size,
            kind,
            file: site.file(),
            line: site.line(),
            comment,
        };
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, record);
    }

    fn resized(&self, id: u64, size: usize, site: &'static Location<'static>) {
        let mut live = self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match live.get_mut(&id) {
            Some(record) => {
                record.size = size;
                record.file = site.file();
                record.line = site.line();
            }
            None => tracing::warn!(
                id,
                size,
                loc = %site,
                "could not track resize of unknown allocation"
            ),
        }
    }

    fn forget(&self, id: u64) {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if removed.is_none() {
            // Allocations reported by an earlier leak check land here once their owner drops them.
            tracing::debug!(id, "free of untracked allocation");
        }
    }

    fn take_leaks(&self) -> LeakReport {
        let live = std::mem::take(
            &mut *self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let allocations: Vec<AllocationRecord> = live.into_values().collect();
        let bytes = allocations.iter().map(|a| a.size).sum();
        LeakReport { allocations, bytes }
    }
}
