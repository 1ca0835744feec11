use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use netsplice_mem::{Block, MemoryBudget, PAGE_SIZE};

use crate::bridge;
use crate::host::{EtherHooks, Host};
use crate::intercept::Interceptor;
use crate::mac::MacAddr;
use crate::proxy::FlatBuffer;
use crate::registry::{InterfaceStats, Registry};
use crate::{NetError, Result};

/// Consumer-facing network splice over one host.
///
/// Creating it installs the interception hooks; [`Netif::deinit`] (or dropping it) puts the
/// previous hooks back and unplugs everything.
pub struct Netif {
    host: Arc<dyn Host>,
    budget: MemoryBudget,
    registry: Arc<Registry>,
    interceptor: Arc<Interceptor>,
    active: AtomicBool,
}

impl Netif {
    pub fn init(host: Arc<dyn Host>, budget: MemoryBudget) -> Self {
        let registry = Arc::new(Registry::new());
        let interceptor = Arc::new(Interceptor::new(
            registry.clone(),
            budget.clone(),
            host.segment_pool().clone(),
        ));
        let previous = host.install_hooks(interceptor.clone() as Arc<dyn EtherHooks>);
        tracing::debug!(chained = previous.is_some(), "installed ethernet hooks");
        interceptor.set_previous(previous);
        Self {
            host,
            budget,
            registry,
            interceptor,
            active: AtomicBool::new(true),
        }
    }

    /// Restores the previous hooks, then unplugs every interface. Idempotent.
    pub fn deinit(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.host.restore_hooks(self.interceptor.previous());
        let unplugged = self.registry.unplug_all(self.host.as_ref());
        tracing::debug!(unplugged, "network splice torn down");
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Names of host interfaces that carry an Ethernet address, in host order.
    pub fn list_interfaces(&self) -> Vec<String> {
        self.host
            .interfaces()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|iface| iface.ether_addr().is_some())
            .map(|iface| iface.name.clone())
            .collect()
    }

    /// Returns whether the interface was administratively up.
    pub fn plug(&self, name: &str, id: u32, virtual_mac: MacAddr) -> Result<bool> {
        self.registry
            .plug(self.host.as_ref(), &self.budget, name, id, virtual_mac)
    }

    pub fn unplug(&self, id: u32) {
        self.registry.unplug(self.host.as_ref(), id);
    }

    pub fn drain_all(&self, id: u32) -> Vec<FlatBuffer> {
        bridge::drain_all(&self.registry, id)
    }

    pub fn take_one(&self, id: u32) -> Result<Option<FlatBuffer>> {
        bridge::take_one(&self.registry, &self.budget, id)
    }

    pub fn submit(&self, id: u32, buffers: &[FlatBuffer]) -> Result<()> {
        bridge::submit(self.host.as_ref(), &self.registry, id, buffers)
    }

    /// `n` zeroed pages for the consumer to fill, released through the contiguous primitive.
    pub fn alloc_pages(&self, n: usize) -> Result<Block> {
        let size = n
            .checked_mul(PAGE_SIZE)
            .ok_or(NetError::OutOfMemory(netsplice_mem::MemError::Exhausted {
                requested: usize::MAX,
            }))?;
        Ok(self.budget.alloc_contig(size)?)
    }

    /// A transient buffer of `len` zeroed bytes.
    pub fn alloc_buffer(&self, len: usize) -> Result<Block> {
        Ok(self.budget.alloc(len)?)
    }

    /// Copies `bytes` into a transient allocation wrapped as a flat buffer.
    pub fn buffer_from(&self, bytes: &[u8]) -> Result<FlatBuffer> {
        let mut block = self.alloc_buffer(bytes.len())?;
        block.as_mut_slice().copy_from_slice(bytes);
        Ok(FlatBuffer::from_block(block))
    }

    pub fn stats(&self, id: u32) -> Option<InterfaceStats> {
        self.registry.find_by_id(id).map(|plug| plug.stats())
    }
}

impl Drop for Netif {
    fn drop(&mut self) {
        self.deinit();
    }
}
