//! Link-layer hooks that divert frames for plugged interfaces into their receive queues.

use std::sync::{Arc, OnceLock};

use netsplice_mem::MemoryBudget;

use crate::chain::{Packet, SegmentPool};
use crate::host::{EtherHooks, HookError, IfIndex};
use crate::mac::MacAddr;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Addressed to the virtual MAC only: the consumer takes the frame.
    Mine,
    /// All-ones destination: the consumer gets a copy, the host keeps the original.
    Broadcast,
    /// Not of interest to the consumer.
    Foreign,
}

pub fn classify(dst: MacAddr, virtual_mac: MacAddr) -> Verdict {
    if dst.is_broadcast() {
        Verdict::Broadcast
    } else if dst == virtual_mac {
        Verdict::Mine
    } else {
        Verdict::Foreign
    }
}

/// Installed in place of the host's hooks; chains to whatever was there before.
pub struct Interceptor {
    registry: Arc<Registry>,
    budget: MemoryBudget,
    pool: SegmentPool,
    previous: OnceLock<Option<Arc<dyn EtherHooks>>>,
}

impl Interceptor {
    pub fn new(registry: Arc<Registry>, budget: MemoryBudget, pool: SegmentPool) -> Self {
        Self {
            registry,
            budget,
            pool,
            previous: OnceLock::new(),
        }
    }

    /// Records the hook set displaced by installing this one. Only the first call has effect.
    pub fn set_previous(&self, previous: Option<Arc<dyn EtherHooks>>) {
        if self.previous.set(previous).is_err() {
            tracing::warn!("previous hooks already recorded");
        }
    }

    pub fn previous(&self) -> Option<Arc<dyn EtherHooks>> {
        self.previous.get().cloned().flatten()
    }

    /// Queues the frame for the consumer if it belongs to a plugged interface.
    ///
    /// Returns the frame if the host should keep processing it.
    fn capture(&self, ifindex: IfIndex, frame: Packet) -> Option<Packet> {
        if self.registry.is_empty() {
            return Some(frame);
        }
        let Some(plug) = self.registry.find_by_index(ifindex) else {
            return Some(frame);
        };
        let Some(dst) = frame.destination() else {
            return Some(frame);
        };

        let verdict = classify(dst, plug.virtual_mac());
        tracing::trace!(ifname = plug.name(), %dst, ?verdict, len = frame.len(), "classified frame");
        match verdict {
            Verdict::Foreign => Some(frame),
            Verdict::Mine => {
                plug.rxq().push(frame, &self.budget);
                None
            }
            Verdict::Broadcast => {
                match frame.copy_packet(&self.pool) {
                    Some(copy) => {
                        plug.rxq().push(copy, &self.budget);
                    }
                    None => {
                        tracing::trace!(ifname = plug.name(), "no segments to copy broadcast frame");
                        plug.rxq().record_drop();
                    }
                }
                Some(frame)
            }
        }
    }
}

impl EtherHooks for Interceptor {
    fn input(&self, ifindex: IfIndex, frame: Packet) -> Option<Packet> {
        let frame = self.capture(ifindex, frame)?;
        match self.previous() {
            Some(previous) => previous.input(ifindex, frame),
            None => Some(frame),
        }
    }

    fn output(&self, ifindex: IfIndex, frame: Packet) -> Result<Option<Packet>, HookError> {
        let Some(frame) = self.capture(ifindex, frame) else {
            return Ok(None);
        };
        match self.previous() {
            Some(previous) => previous.output(ifindex, frame),
            None => Ok(Some(frame)),
        }
    }

    fn input_orphan(&self, ifindex: IfIndex, frame: Packet) {
        if let Some(previous) = self.previous() {
            previous.input_orphan(ifindex, frame);
        }
    }

    fn attach(&self, ifindex: IfIndex) {
        if let Some(previous) = self.previous() {
            previous.attach(ifindex);
        }
    }

    fn detach(&self, ifindex: IfIndex) {
        if let Some(previous) = self.previous() {
            previous.detach(ifindex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_wins_over_virtual_match() {
        let vmac = MacAddr([2, 0, 0, 0, 0, 1]);
        assert_eq!(classify(vmac, vmac), Verdict::Mine);
        assert_eq!(classify(MacAddr::BROADCAST, vmac), Verdict::Broadcast);
        assert_eq!(
            classify(MacAddr::BROADCAST, MacAddr::BROADCAST),
            Verdict::Broadcast
        );
        assert_eq!(classify(MacAddr([2, 0, 0, 0, 0, 2]), vmac), Verdict::Foreign);
    }
}
