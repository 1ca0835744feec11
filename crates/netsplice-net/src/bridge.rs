//! Translation between host chains and consumer flat buffers.
//!
//! Receive side: each queued segment becomes a [`FlatBuffer`] over the same storage; the host
//! cluster goes back to the pool when the consumer drops the last view. Transmit side: consumer
//! buffers are cut into segment-sized windows, each holding its own reference to the backing
//! allocation.

use netsplice_mem::{MemError, MemoryBudget};

use crate::chain::{Packet, Segment, SegmentPool, SEGMENT_CAP};
use crate::host::{Host, IfIndex};
use crate::proxy::FlatBuffer;
use crate::registry::Registry;
use crate::{NetError, Result};

fn segment_view(segment: Segment) -> FlatBuffer {
    let (storage, offset, len) = segment.into_window();
    FlatBuffer::new(storage, offset, len)
}

/// One zero-copy view per segment of `packet`.
pub fn wrap_segments(packet: Packet) -> Vec<FlatBuffer> {
    packet.into_segments().into_iter().map(segment_view).collect()
}

/// Copies a frame into one contiguous budget allocation.
pub fn flatten(packet: &Packet, budget: &MemoryBudget) -> Result<FlatBuffer> {
    let mut block = budget.alloc_commented(packet.len(), "flattened frame")?;
    packet.copy_data(block.as_mut_slice());
    Ok(FlatBuffer::from_block(block))
}

/// Builds one host frame out of consumer buffers without copying their contents.
///
/// Any segments taken before a pool refusal are released again.
pub fn build_chain(
    pool: &SegmentPool,
    buffers: &[FlatBuffer],
    rcvif: Option<IfIndex>,
) -> Result<Packet> {
    let mut segments = Vec::new();
    for buf in buffers {
        let storage = buf.storage();
        let mut offset = buf.offset();
        let mut remaining = buf.len().min(storage.len().saturating_sub(offset));
        while remaining > 0 {
            let piece = remaining.min(SEGMENT_CAP);
            let ticket = pool.get().ok_or(MemError::PoolExhausted { segments: 1 })?;
            segments.push(Segment::new(ticket, storage.clone(), offset, piece));
            offset += piece;
            remaining -= piece;
        }
    }
    Ok(Packet::new(segments, rcvif))
}

/// Empties the queue of `id`, one view per segment in queue order. Unknown ids yield nothing.
pub fn drain_all(registry: &Registry, id: u32) -> Vec<FlatBuffer> {
    let Some(plug) = registry.find_by_id(id) else {
        return Vec::new();
    };
    let out: Vec<FlatBuffer> = plug
        .rxq()
        .drain()
        .into_iter()
        .flat_map(wrap_segments)
        .collect();
    tracing::trace!(id, buffers = out.len(), "drained rx queue");
    out
}

/// Takes the most recent queued frame of `id` as a single buffer.
///
/// Single-segment frames are returned by reference; anything else is copied into a fresh
/// contiguous allocation.
pub fn take_one(registry: &Registry, budget: &MemoryBudget, id: u32) -> Result<Option<FlatBuffer>> {
    let plug = registry.find_by_id(id).ok_or(NetError::NotFound)?;
    let Some(packet) = plug.rxq().take_packet() else {
        return Ok(None);
    };
    if packet.segments().len() == 1 {
        return Ok(packet.into_segments().pop().map(segment_view));
    }
    let flat = flatten(&packet, budget).inspect_err(|err| {
        tracing::debug!(id, %err, len = packet.len(), "dropping frame that could not be flattened");
    })?;
    Ok(Some(flat))
}

/// Sends consumer buffers out through plugged interface `id`.
///
/// Frames for the interface's own MAC go up the host stack, frames for anyone else go out the
/// wire, broadcasts go both ways. Unknown ids and empty frames are ignored.
pub fn submit(host: &dyn Host, registry: &Registry, id: u32, buffers: &[FlatBuffer]) -> Result<()> {
    let Some(plug) = registry.find_by_id(id) else {
        tracing::debug!(id, "submit on unknown id ignored");
        return Ok(());
    };
    let ifindex = plug.ifindex();
    let pool = host.segment_pool();
    let frame = build_chain(pool, buffers, Some(ifindex))?;
    if frame.is_empty() {
        return Ok(());
    }

    let total = frame.len();
    let mtu = host
        .interfaces()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(ifindex)
        .map(|iface| iface.mtu as usize);
    if let Some(mtu) = mtu.filter(|&mtu| total > mtu) {
        tracing::warn!(ifname = plug.name(), len = total, mtu, "frame exceeds interface mtu");
        plug.note_mtu_exceeded();
    }

    let dst = frame.destination();
    let broadcast = dst.is_some_and(|d| d.is_broadcast());
    let to_stack = broadcast || dst == Some(plug.real_mac());
    tracing::trace!(ifname = plug.name(), len = total, segments = frame.segments().len(), to_stack, broadcast, "submitting frame");

    if broadcast {
        let copy = frame
            .copy_packet(pool)
            .ok_or(MemError::PoolExhausted {
                segments: frame.segments().len(),
            })?;
        host.if_input(ifindex, copy);
        host.if_transmit(ifindex, frame);
    } else if to_stack {
        host.if_input(ifindex, frame);
    } else {
        host.if_transmit(ifindex, frame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Storage;

    fn consumer_buffer(budget: &MemoryBudget, bytes: &[u8]) -> FlatBuffer {
        let mut block = budget.alloc(bytes.len()).unwrap();
        block.as_mut_slice().copy_from_slice(bytes);
        FlatBuffer::from_block(block)
    }

    #[test]
    fn build_chain_cuts_buffers_at_segment_cap() {
        let pool = SegmentPool::new();
        let budget = MemoryBudget::new(1 << 20);
        let a = consumer_buffer(&budget, &[1u8; 2500]);
        let b = consumer_buffer(&budget, &[2u8; 500]);

        let pkt = build_chain(&pool, &[a.window(100, 2400), b.clone()], None).unwrap();
        let lens: Vec<usize> = pkt.segments().iter().map(Segment::len).collect();
        assert_eq!(lens, vec![2048, 352, 500]);
        assert_eq!(pkt.len(), 2900);
        match a.storage() {
            Storage::External(proxy) => assert_eq!(proxy.ref_count(), 3),
            Storage::Host(_) => panic!("expected consumer storage"),
        }

        drop((a, b));
        assert_eq!(budget.outstanding(), 3000);
        drop(pkt);
        assert_eq!(budget.outstanding(), 0);
        assert_eq!(budget.stats().frees, 2);
    }

    #[test]
    fn build_chain_unwinds_on_pool_refusal() {
        let pool = SegmentPool::with_limit(1);
        let budget = MemoryBudget::new(1 << 20);
        let buf = consumer_buffer(&budget, &[0u8; 3000]);
        assert_eq!(
            build_chain(&pool, &[buf.clone()], None).unwrap_err(),
            NetError::OutOfMemory(MemError::PoolExhausted { segments: 1 })
        );
        assert_eq!(pool.stats().segments_live, 0);
        match buf.storage() {
            Storage::External(proxy) => assert_eq!(proxy.ref_count(), 1),
            Storage::Host(_) => panic!("expected consumer storage"),
        }
    }

    #[test]
    fn window_past_backing_is_clipped() {
        let pool = SegmentPool::new();
        let budget = MemoryBudget::new(1 << 20);
        let buf = consumer_buffer(&budget, &[7u8; 10]);
        let pkt = build_chain(&pool, &[buf.window(4, 100), buf.window(50, 5)], None).unwrap();
        assert_eq!(pkt.to_vec(), vec![7u8; 6]);
    }

    #[test]
    fn wrapped_segments_keep_host_memory_alive() {
        let pool = SegmentPool::new();
        let pkt = Packet::from_bytes(&pool, &[5u8; 3000], SEGMENT_CAP, None).unwrap();
        let views = wrap_segments(pkt);
        assert_eq!(views.len(), 2);
        assert_eq!(pool.stats().segments_live, 0);
        assert_eq!(pool.stats().clusters_live, 2);
        assert_eq!(views[0].len() + views[1].len(), 3000);
        drop(views);
        assert_eq!(pool.stats().clusters_live, 0);
    }

    #[test]
    fn flatten_copies_into_budget() {
        let pool = SegmentPool::new();
        let budget = MemoryBudget::new(1 << 20);
        let bytes: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let pkt = Packet::from_bytes(&pool, &bytes, SEGMENT_CAP, None).unwrap();
        let flat = flatten(&pkt, &budget).unwrap();
        drop(pkt);
        assert_eq!(flat.to_vec(), bytes);
        assert_eq!(budget.outstanding(), 3000);

        let tight = MemoryBudget::new(100);
        let pkt = Packet::from_bytes(&pool, &bytes, SEGMENT_CAP, None).unwrap();
        assert!(matches!(flatten(&pkt, &tight), Err(NetError::OutOfMemory(_))));
    }
}
