//! Shared ownership of frame memory across the host chain / flat buffer boundary.

use std::fmt;
use std::sync::Arc;

use netsplice_mem::{AllocKind, Block};

use crate::chain::HostBuf;

/// How a proxied allocation is returned to the budget.
///
/// The kind mirrors the block's [`AllocKind`]; dropping the block credits the matching per-kind
/// statistics in [`netsplice_mem::BudgetStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Freed with the contiguous free primitive.
    Page,
    /// Freed with the plain free primitive.
    Transient,
}

impl From<AllocKind> for ReleaseKind {
    fn from(kind: AllocKind) -> Self {
        match kind {
            AllocKind::Contiguous => Self::Page,
            AllocKind::Plain => Self::Transient,
        }
    }
}

struct Backing {
    block: Block,
    kind: ReleaseKind,
}

impl Drop for Backing {
    fn drop(&mut self) {
        tracing::trace!(kind = ?self.kind, len = self.block.len(), "releasing proxied buffer");
    }
}

/// Reference-counted owner of a budget allocation.
///
/// Every chain segment or flat buffer that points into the allocation holds one clone; the
/// allocation is freed exactly once, when the last clone is dropped.
#[derive(Clone)]
pub struct BufferProxy(Arc<Backing>);

impl fmt::Debug for BufferProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferProxy")
            .field("kind", &self.0.kind)
            .field("len", &self.0.block.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl BufferProxy {
    pub fn new(block: Block) -> Self {
        let kind = ReleaseKind::from(block.kind());
        Self(Arc::new(Backing { block, kind }))
    }

    pub fn kind(&self) -> ReleaseKind {
        self.0.kind
    }

    pub fn len(&self) -> usize {
        self.0.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.block.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.block.as_slice()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Backing memory of a chain segment or flat buffer.
#[derive(Debug, Clone)]
pub enum Storage {
    /// A host pool cluster, returned to the host when the last reference drops.
    Host(HostBuf),
    /// A consumer allocation made through the memory budget.
    External(BufferProxy),
}

impl Storage {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Host(buf) => buf.as_slice(),
            Self::External(proxy) => proxy.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Externally visible `(bytes, offset, length)` view over shared backing memory.
#[derive(Debug, Clone)]
pub struct FlatBuffer {
    storage: Storage,
    offset: usize,
    len: usize,
}

impl FlatBuffer {
    pub fn new(storage: Storage, offset: usize, len: usize) -> Self {
        Self {
            storage,
            offset,
            len,
        }
    }

    /// Wraps a whole budget allocation.
    pub fn from_block(block: Block) -> Self {
        let len = block.len();
        Self::new(Storage::External(BufferProxy::new(block)), 0, len)
    }

    /// Another view over the same backing memory.
    pub fn window(&self, offset: usize, len: usize) -> Self {
        Self::new(self.storage.clone(), offset, len)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The viewed bytes, clipped to the backing memory.
    pub fn as_slice(&self) -> &[u8] {
        let bytes = self.storage.as_slice();
        let start = self.offset.min(bytes.len());
        let end = start.saturating_add(self.len).min(bytes.len());
        &bytes[start..end]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsplice_mem::MemoryBudget;

    #[test]
    fn proxy_frees_once_when_last_clone_drops() {
        let budget = MemoryBudget::new(1 << 20);
        let proxy = BufferProxy::new(budget.alloc(100).unwrap());
        assert_eq!(proxy.kind(), ReleaseKind::Transient);
        let a = proxy.clone();
        let b = proxy.clone();
        assert_eq!(proxy.ref_count(), 3);

        drop(proxy);
        drop(a);
        assert_eq!(budget.outstanding(), 100);
        assert_eq!(b.ref_count(), 1);
        drop(b);
        assert_eq!(budget.outstanding(), 0);
        assert_eq!(budget.stats().frees, 1);
    }

    #[test]
    fn page_allocations_are_tagged_page() {
        let budget = MemoryBudget::new(1 << 20);
        let proxy = BufferProxy::new(budget.alloc_contig(10).unwrap());
        assert_eq!(proxy.kind(), ReleaseKind::Page);
        assert_eq!(proxy.len(), netsplice_mem::PAGE_SIZE);

        drop(proxy);
        let stats = budget.stats();
        assert_eq!(stats.contiguous.frees, 1);
        assert_eq!(stats.plain.frees, 0);
    }

    #[test]
    fn window_is_clipped_to_backing() {
        let budget = MemoryBudget::new(1 << 20);
        let mut block = budget.alloc(8).unwrap();
        block.as_mut_slice().copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let buf = FlatBuffer::from_block(block);
        assert_eq!(buf.window(2, 3).as_slice(), &[2, 3, 4]);
        assert_eq!(buf.window(6, 10).as_slice(), &[6, 7]);
        assert!(buf.window(20, 1).as_slice().is_empty());
    }
}
