//! Plugged-interface registry.
//!
//! Plug and unplug take the host interface table lock first and the registry lock second. The
//! interception path only ever takes the registry lock (for reading), so it never waits on the
//! host table.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use netsplice_mem::{Block, MemoryBudget};

use crate::host::{names_match, HookAttachment, Host, IfFlags, IfIndex};
use crate::mac::MacAddr;
use crate::rxq::{QueueStats, RxQueue};
use crate::{NetError, Result, MIN_MTU};

/// Counters for one plugged interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceStats {
    pub queue: QueueStats,
    pub mtu_warnings: u64,
}

/// A host interface bound to a consumer-visible id.
#[derive(Debug)]
pub struct PluggedInterface {
    id: u32,
    ifindex: IfIndex,
    name: String,
    real_mac: MacAddr,
    virtual_mac: MacAddr,
    flags: IfFlags,
    set_marker: bool,
    rxq: RxQueue,
    mtu_warnings: AtomicU64,
    _record: Block,
}

impl PluggedInterface {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ifindex(&self) -> IfIndex {
        self.ifindex
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn real_mac(&self) -> MacAddr {
        self.real_mac
    }

    pub fn virtual_mac(&self) -> MacAddr {
        self.virtual_mac
    }

    /// Interface flags as they were at plug time.
    pub fn flags(&self) -> IfFlags {
        self.flags
    }

    pub fn rxq(&self) -> &RxQueue {
        &self.rxq
    }

    pub(crate) fn note_mtu_exceeded(&self) {
        self.mtu_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> InterfaceStats {
        InterfaceStats {
            queue: self.rxq.stats(),
            mtu_warnings: self.mtu_warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Vec<Arc<PluggedInterface>>>,
    plugged: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<PluggedInterface>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<PluggedInterface>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock-free check used before every intercepted frame.
    pub fn is_empty(&self) -> bool {
        self.plugged.load(Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.plugged.load(Ordering::Acquire)
    }

    pub fn find_by_id(&self, id: u32) -> Option<Arc<PluggedInterface>> {
        self.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn find_by_index(&self, ifindex: IfIndex) -> Option<Arc<PluggedInterface>> {
        self.read().iter().find(|p| p.ifindex == ifindex).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<PluggedInterface>> {
        self.read()
            .iter()
            .find(|p| names_match(&p.name, name))
            .cloned()
    }

    /// Consumer ids in plug order.
    pub fn ids(&self) -> Vec<u32> {
        self.read().iter().map(|p| p.id).collect()
    }

    /// Binds host interface `name` to consumer `id`; returns whether the interface was up.
    pub fn plug(
        &self,
        host: &dyn Host,
        budget: &MemoryBudget,
        name: &str,
        id: u32,
        virtual_mac: MacAddr,
    ) -> Result<bool> {
        let mut table = host
            .interfaces()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let iface = table.find_by_name_mut(name).ok_or(NetError::NotFound)?;
        let real_mac = iface.ether_addr().ok_or(NetError::NotFound)?;

        let mut entries = self.write();
        if entries
            .iter()
            .any(|p| p.id == id || p.ifindex == iface.index)
        {
            return Err(NetError::AlreadyPlugged);
        }
        let record = budget.alloc_commented(
            mem::size_of::<PluggedInterface>(),
            "plugged interface record",
        )?;

        if iface.mtu < MIN_MTU {
            tracing::debug!(ifname = %iface.name, from = iface.mtu, to = MIN_MTU, "raising mtu");
            iface.mtu = MIN_MTU;
        }
        let set_marker = iface.attachment == HookAttachment::None;
        if set_marker {
            iface.attachment = HookAttachment::Synthetic;
        }
        let was_up = iface.flags.contains(IfFlags::UP);

        entries.push(Arc::new(PluggedInterface {
            id,
            ifindex: iface.index,
            name: iface.name.clone(),
            real_mac,
            virtual_mac,
            flags: iface.flags,
            set_marker,
            rxq: RxQueue::new(),
            mtu_warnings: AtomicU64::new(0),
            _record: record,
        }));
        self.plugged.fetch_add(1, Ordering::Release);

        tracing::info!(
            ifname = %iface.name,
            id,
            ifindex = %iface.index,
            real = %real_mac,
            virtual_mac = %virtual_mac,
            was_up,
            "plugged interface"
        );
        Ok(was_up)
    }

    /// Unbinds consumer `id`, releasing anything still queued. Returns whether it was plugged.
    pub fn unplug(&self, host: &dyn Host, id: u32) -> bool {
        let entry = {
            let mut table = host
                .interfaces()
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut entries = self.write();
            let Some(pos) = entries.iter().position(|p| p.id == id) else {
                tracing::debug!(id, "unplug of unknown id ignored");
                return false;
            };
            let entry = entries.remove(pos);
            self.plugged.fetch_sub(1, Ordering::Release);
            if entry.set_marker {
                if let Some(iface) = table.get_mut(entry.ifindex) {
                    if iface.attachment == HookAttachment::Synthetic {
                        iface.attachment = HookAttachment::None;
                    }
                }
            }
            entry
        };

        let released = entry.rxq.clear();
        tracing::info!(ifname = %entry.name, id, released, "unplugged interface");
        true
    }

    /// Unplugs every record; returns how many there were.
    pub fn unplug_all(&self, host: &dyn Host) -> usize {
        self.ids()
            .into_iter()
            .filter(|&id| self.unplug(host, id))
            .count()
    }
}
