//! Host-native buffer chains: packets made of segments, segments pointing at shared storage.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::host::IfIndex;
use crate::mac::{MacAddr, ETHER_ADDR_LEN};
use crate::proxy::Storage;

/// Largest payload a single chain segment carries.
pub const SEGMENT_CAP: usize = 2048;

#[derive(Debug, Default)]
struct PoolInner {
    limit: Option<usize>,
    segments_live: AtomicUsize,
    segments_released: AtomicU64,
    clusters_live: AtomicUsize,
    clusters_released: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub segments_live: usize,
    pub segments_released: u64,
    pub clusters_live: usize,
    pub clusters_released: u64,
}

/// The host's pool of segment headers and data clusters.
#[derive(Debug, Clone, Default)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that refuses segment headers once `max_segments` are live.
    pub fn with_limit(max_segments: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limit: Some(max_segments),
                ..Default::default()
            }),
        }
    }

    /// Takes one segment header, or `None` if the pool is exhausted.
    pub fn get(&self) -> Option<SegmentTicket> {
        let mut live = self.inner.segments_live.load(Ordering::Relaxed);
        loop {
            if self.inner.limit.is_some_and(|limit| live >= limit) {
                return None;
            }
            match self.inner.segments_live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }
        Some(SegmentTicket {
            pool: self.inner.clone(),
        })
    }

    /// Copies `bytes` into a fresh host cluster.
    pub fn cluster(&self, bytes: &[u8]) -> HostBuf {
        self.inner.clusters_live.fetch_add(1, Ordering::Relaxed);
        HostBuf(Arc::new(Cluster {
            data: bytes.into(),
            pool: self.inner.clone(),
        }))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            segments_live: self.inner.segments_live.load(Ordering::Relaxed),
            segments_released: self.inner.segments_released.load(Ordering::Relaxed),
            clusters_live: self.inner.clusters_live.load(Ordering::Relaxed),
            clusters_released: self.inner.clusters_released.load(Ordering::Relaxed),
        }
    }
}

/// A segment header checked out of a [`SegmentPool`].
#[derive(Debug)]
pub struct SegmentTicket {
    pool: Arc<PoolInner>,
}

impl Drop for SegmentTicket {
    fn drop(&mut self) {
        self.pool.segments_live.fetch_sub(1, Ordering::AcqRel);
        self.pool.segments_released.fetch_add(1, Ordering::Relaxed);
    }
}

struct Cluster {
    data: Box<[u8]>,
    pool: Arc<PoolInner>,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.pool.clusters_live.fetch_sub(1, Ordering::Relaxed);
        self.pool.clusters_released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reference to host cluster memory.
#[derive(Clone)]
pub struct HostBuf(Arc<Cluster>);

impl fmt::Debug for HostBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuf")
            .field("len", &self.0.data.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl HostBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.0.data
    }

    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// One link of a packet: a window into shared storage plus the header it occupies.
#[derive(Debug)]
pub struct Segment {
    storage: Storage,
    offset: usize,
    len: usize,
    _ticket: SegmentTicket,
}

impl Segment {
    /// The window is clipped to the storage.
    pub fn new(ticket: SegmentTicket, storage: Storage, offset: usize, len: usize) -> Self {
        let offset = offset.min(storage.len());
        let len = len.min(storage.len() - offset);
        Self {
            storage,
            offset,
            len,
            _ticket: ticket,
        }
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

    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_slice()[self.offset..self.offset + self.len]
    }

    /// Releases the header and hands back the storage reference and window.
    pub fn into_window(self) -> (Storage, usize, usize) {
        (self.storage, self.offset, self.len)
    }

    fn share(&self, pool: &SegmentPool) -> Option<Self> {
        Some(Self {
            storage: self.storage.clone(),
            offset: self.offset,
            len: self.len,
            _ticket: pool.get()?,
        })
    }
}

/// A frame as a chain of segments, optionally followed by further frames.
#[derive(Debug, Default)]
pub struct Packet {
    segments: Vec<Segment>,
    rcvif: Option<IfIndex>,
    next: Option<Box<Packet>>,
}

impl Packet {
    pub fn new(segments: Vec<Segment>, rcvif: Option<IfIndex>) -> Self {
        Self {
            segments,
            rcvif,
            next: None,
        }
    }

    /// Builds a packet from host clusters of at most `segment_cap` bytes each.
    ///
    /// Returns `None` if the pool cannot supply enough segment headers.
    pub fn from_bytes(
        pool: &SegmentPool,
        bytes: &[u8],
        segment_cap: usize,
        rcvif: Option<IfIndex>,
    ) -> Option<Self> {
        let segment_cap = segment_cap.max(1);
        let mut segments = Vec::with_capacity(bytes.len().div_ceil(segment_cap));
        for piece in bytes.chunks(segment_cap) {
            let ticket = pool.get()?;
            let buf = pool.cluster(piece);
            segments.push(Segment::new(ticket, Storage::Host(buf), 0, piece.len()));
        }
        Some(Self::new(segments, rcvif))
    }

    /// Total length of this frame (not including chained frames).
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_multi_segment(&self) -> bool {
        self.segments.len() > 1
    }

    pub fn rcvif(&self) -> Option<IfIndex> {
        self.rcvif
    }

    pub fn set_rcvif(&mut self, rcvif: Option<IfIndex>) {
        self.rcvif = rcvif;
    }

    /// Copies frame bytes starting at the front into `out`; returns the number copied.
    pub fn copy_data(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for seg in &self.segments {
            if copied == out.len() {
                break;
            }
            let src = seg.as_slice();
            let n = src.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        }
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.copy_data(&mut out);
        out
    }

    /// Destination link-layer address, gathered across segments if needed.
    pub fn destination(&self) -> Option<MacAddr> {
        let mut dst = [0u8; ETHER_ADDR_LEN];
        (self.copy_data(&mut dst) == ETHER_ADDR_LEN).then_some(MacAddr(dst))
    }

    /// Duplicates this frame's segment chain, sharing the underlying storage.
    ///
    /// Chained frames are not copied.
    pub fn copy_packet(&self, pool: &SegmentPool) -> Option<Self> {
        let segments = self
            .segments
            .iter()
            .map(|seg| seg.share(pool))
            .collect::<Option<Vec<_>>>()?;
        Some(Self::new(segments, self.rcvif))
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Appends `packet` at the end of the frame chain.
    pub fn push_packet(&mut self, packet: Packet) {
        match self.next.as_deref_mut() {
            Some(next) => next.push_packet(packet),
            None => self.next = Some(Box::new(packet)),
        }
    }

    /// Detaches and returns the frames chained after this one.
    pub fn take_next(&mut self) -> Option<Packet> {
        self.next.take().map(|next| *next)
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Number of frames in the chain, including this one.
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.next.as_deref();
        while let Some(p) = cur {
            n += 1;
            cur = p.next.as_deref();
        }
        n
    }
}
