//! Per-interface receive queue shared by the interception path and the consumer.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use netsplice_mem::{Block, MemoryBudget};

use crate::chain::Packet;

/// A queued host chain plus the budget charge for its queue node.
#[derive(Debug)]
struct PendingFrame {
    packet: Packet,
    _node: Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Nodes currently queued.
    pub queued: usize,
    /// Frames admitted since plug.
    pub admitted: u64,
    /// Frames dropped on admission (budget or pool refusal).
    pub dropped: u64,
    /// Frames handed to the consumer.
    pub extracted: u64,
}

/// Head-inserted, head-consumed list of pending frames.
///
/// The most recently admitted frame is returned first.
#[derive(Debug, Default)]
pub struct RxQueue {
    frames: Mutex<VecDeque<PendingFrame>>,
    admitted: AtomicU64,
    dropped: AtomicU64,
    extracted: AtomicU64,
}

impl RxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingFrame>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `packet`, charging its node to `budget`.
    ///
    /// If the budget refuses, the frame is released and counted as dropped; returns whether it was
    /// queued.
    pub fn push(&self, packet: Packet, budget: &MemoryBudget) -> bool {
        let node = match budget.alloc_commented(mem::size_of::<PendingFrame>(), "rx queue node") {
            Ok(node) => node,
            Err(err) => {
                tracing::trace!(%err, len = packet.len(), "rx admission refused, dropping frame");
                self.record_drop();
                return false;
            }
        };
        self.lock().push_front(PendingFrame {
            packet,
            _node: node,
        });
        self.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes one frame from the head of the queue.
    ///
    /// A node holding several back-to-back frames gives up only its first one; the rest stay
    /// queued in place.
    pub fn take_packet(&self) -> Option<Packet> {
        let released;
        let packet = {
            let mut frames = self.lock();
            let head = frames.front_mut()?;
            match head.packet.take_next() {
                Some(rest) => {
                    released = None;
                    mem::replace(&mut head.packet, rest)
                }
                None => {
                    let node = frames.pop_front()?;
                    released = Some(node._node);
                    node.packet
                }
            }
        };
        drop(released);
        self.extracted.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Empties the queue, returning every frame in queue order.
    pub fn drain(&self) -> Vec<Packet> {
        let nodes = mem::take(&mut *self.lock());
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut packet = node.packet;
            loop {
                let next = packet.take_next();
                out.push(packet);
                match next {
                    Some(next) => packet = next,
                    None => break,
                }
            }
        }
        self.extracted.fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    /// Releases every queued frame unread; returns how many nodes were released.
    pub fn clear(&self) -> usize {
        let nodes = mem::take(&mut *self.lock());
        nodes.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
        }
    }
}
