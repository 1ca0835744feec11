//! In-process host used by tests and the simulation binary.
//!
//! Frames injected on an interface run through the installed input hook and, if not consumed,
//! land in the stack log. Frames sent by the stack run through the output hook and land in the
//! wire log. [`Host::if_transmit`] bypasses the hooks like a driver would.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::chain::{Packet, SegmentPool, SEGMENT_CAP};
use crate::host::{
    EtherHooks, HookAttachment, HookError, Host, HostInterface, IfFlags, IfIndex, InterfaceTable,
    LinkAddr,
};
use crate::mac::MacAddr;

/// A frame that reached the stack or the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub ifindex: IfIndex,
    pub bytes: Vec<u8>,
    pub segments: usize,
}

impl Delivered {
    fn record(ifindex: IfIndex, frame: Packet, log: &Mutex<Vec<Delivered>>) {
        let mut frame = Some(frame);
        let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(mut packet) = frame.take() {
            frame = packet.take_next();
            log.push(Delivered {
                ifindex,
                bytes: packet.to_vec(),
                segments: packet.segments().len(),
            });
        }
    }
}

pub struct SimHost {
    table: RwLock<InterfaceTable>,
    pool: SegmentPool,
    hooks: RwLock<Option<Arc<dyn EtherHooks>>>,
    stack: Mutex<Vec<Delivered>>,
    wire: Mutex<Vec<Delivered>>,
    next_index: AtomicU16,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::with_pool(SegmentPool::new())
    }
}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: SegmentPool) -> Self {
        Self {
            table: RwLock::new(InterfaceTable::new()),
            pool,
            hooks: RwLock::new(None),
            stack: Mutex::new(Vec::new()),
            wire: Mutex::new(Vec::new()),
            next_index: AtomicU16::new(1),
        }
    }

    fn table_mut(&self) -> std::sync::RwLockWriteGuard<'_, InterfaceTable> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, name: &str, addrs: Vec<LinkAddr>, mtu: u32, flags: IfFlags) -> IfIndex {
        let index = IfIndex(self.next_index.fetch_add(1, Ordering::Relaxed));
        self.table_mut().insert(HostInterface {
            index,
            name: name.to_string(),
            mtu,
            flags,
            addrs,
            attachment: HookAttachment::None,
        });
        index
    }

    pub fn add_interface(&self, name: &str, mac: MacAddr, mtu: u32, flags: IfFlags) -> IfIndex {
        self.add(name, vec![LinkAddr::Ether(mac)], mtu, flags)
    }

    pub fn add_interface_without_link(&self, name: &str, mtu: u32, flags: IfFlags) -> IfIndex {
        self.add(name, vec![LinkAddr::Other], mtu, flags)
    }

    pub fn interface(&self, index: IfIndex) -> Option<HostInterface> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(index)
            .cloned()
    }

    pub fn interface_by_name(&self, name: &str) -> Option<HostInterface> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .find_by_name(name)
            .cloned()
    }

    pub fn set_mtu(&self, name: &str, mtu: u32) {
        if let Some(iface) = self.table_mut().find_by_name_mut(name) {
            iface.mtu = mtu;
        }
    }

    pub fn set_attachment(&self, name: &str, attachment: HookAttachment) {
        if let Some(iface) = self.table_mut().find_by_name_mut(name) {
            iface.attachment = attachment;
        }
    }

    fn hooks(&self) -> Option<Arc<dyn EtherHooks>> {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn hooks_installed(&self) -> bool {
        self.hooks().is_some()
    }

    fn receive(&self, ifindex: IfIndex, mut frame: Packet) {
        frame.set_rcvif(Some(ifindex));
        let frame = match self.hooks() {
            Some(hooks) => hooks.input(ifindex, frame),
            None => Some(frame),
        };
        if let Some(frame) = frame {
            Delivered::record(ifindex, frame, &self.stack);
        }
    }

    /// A frame arriving from the wire on `ifindex`, cut into standard segments.
    pub fn inject(&self, ifindex: IfIndex, bytes: &[u8]) {
        self.inject_segmented(ifindex, bytes, SEGMENT_CAP);
    }

    pub fn inject_segmented(&self, ifindex: IfIndex, bytes: &[u8], segment_cap: usize) {
        match Packet::from_bytes(&self.pool, bytes, segment_cap, Some(ifindex)) {
            Some(frame) => self.receive(ifindex, frame),
            None => tracing::debug!(%ifindex, len = bytes.len(), "no segments, dropping inbound frame"),
        }
    }

    /// A frame the local stack sends out `ifindex`.
    pub fn send(&self, ifindex: IfIndex, bytes: &[u8]) -> Result<(), HookError> {
        let Some(frame) = Packet::from_bytes(&self.pool, bytes, SEGMENT_CAP, None) else {
            tracing::debug!(%ifindex, len = bytes.len(), "no segments, dropping outbound frame");
            return Ok(());
        };
        let frame = match self.hooks() {
            Some(hooks) => hooks.output(ifindex, frame)?,
            None => Some(frame),
        };
        if let Some(frame) = frame {
            Delivered::record(ifindex, frame, &self.wire);
        }
        Ok(())
    }

    /// Frames delivered to the local stack since the last call.
    pub fn take_stack(&self) -> Vec<Delivered> {
        std::mem::take(&mut *self.stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Frames put on the wire since the last call.
    pub fn take_wire(&self) -> Vec<Delivered> {
        std::mem::take(&mut *self.wire.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Host for SimHost {
    fn interfaces(&self) -> &RwLock<InterfaceTable> {
        &self.table
    }

    fn segment_pool(&self) -> &SegmentPool {
        &self.pool
    }

    fn install_hooks(&self, hooks: Arc<dyn EtherHooks>) -> Option<Arc<dyn EtherHooks>> {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(hooks)
    }

    fn restore_hooks(&self, previous: Option<Arc<dyn EtherHooks>>) {
        *self
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = previous;
    }

    fn if_input(&self, ifindex: IfIndex, frame: Packet) {
        self.receive(ifindex, frame);
    }

    fn if_transmit(&self, ifindex: IfIndex, frame: Packet) {
        Delivered::record(ifindex, frame, &self.wire);
    }
}
