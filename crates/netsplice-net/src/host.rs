//! What the splice needs from the host network stack.

use std::fmt;
use std::sync::{Arc, RwLock};

use bitflags::bitflags;

use crate::chain::{Packet, SegmentPool};
use crate::mac::MacAddr;

/// Longest interface name, including the terminator the host reserves.
pub const IFNAMSIZ: usize = 16;

/// Host-assigned interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfIndex(pub u16);

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IfFlags: u32 {
        const UP = 0x1;
        const BROADCAST = 0x2;
        const LOOPBACK = 0x8;
        const RUNNING = 0x40;
        const PROMISC = 0x100;
        const MULTICAST = 0x8000;
    }
}

/// A link-layer address attached to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAddr {
    Ether(MacAddr),
    /// Any non-Ethernet link type (loopback, tunnels, ...).
    Other,
}

/// Whether the host considers an interface to have a link-layer hook consumer attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAttachment {
    #[default]
    None,
    /// Placeholder set by a plug so the host routes frames through the hooks.
    Synthetic,
    /// A genuine hook consumer node.
    Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub index: IfIndex,
    pub name: String,
    pub mtu: u32,
    pub flags: IfFlags,
    pub addrs: Vec<LinkAddr>,
    pub attachment: HookAttachment,
}

impl HostInterface {
    /// First Ethernet address of the interface.
    pub fn ether_addr(&self) -> Option<MacAddr> {
        self.addrs.iter().find_map(|addr| match addr {
            LinkAddr::Ether(mac) => Some(*mac),
            LinkAddr::Other => None,
        })
    }
}

/// The host's interface list, guarded by the host-wide interface lock.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    ifaces: Vec<HostInterface>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, iface: HostInterface) {
        self.ifaces.retain(|i| i.index != iface.index);
        self.ifaces.push(iface);
    }

    pub fn remove(&mut self, index: IfIndex) -> Option<HostInterface> {
        let pos = self.ifaces.iter().position(|i| i.index == index)?;
        Some(self.ifaces.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostInterface> {
        self.ifaces.iter()
    }

    pub fn get(&self, index: IfIndex) -> Option<&HostInterface> {
        self.ifaces.iter().find(|i| i.index == index)
    }

    pub fn get_mut(&mut self, index: IfIndex) -> Option<&mut HostInterface> {
        self.ifaces.iter_mut().find(|i| i.index == index)
    }

    /// Name comparison is limited to the host's name length, as the host itself does.
    pub fn find_by_name(&self, name: &str) -> Option<&HostInterface> {
        self.ifaces.iter().find(|i| names_match(&i.name, name))
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut HostInterface> {
        self.ifaces
            .iter_mut()
            .find(|i| names_match(&i.name, name))
    }
}

pub(crate) fn names_match(a: &str, b: &str) -> bool {
    let a = &a.as_bytes()[..a.len().min(IFNAMSIZ)];
    let b = &b.as_bytes()[..b.len().min(IFNAMSIZ)];
    a == b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("output hook failed with code {0}")]
pub struct HookError(pub i32);

/// Link-layer hook set the host calls for every Ethernet frame.
///
/// `input`/`output` return the frame if it should continue through the host, or `None` if the
/// hook consumed it.
pub trait EtherHooks: Send + Sync {
    fn input(&self, ifindex: IfIndex, frame: Packet) -> Option<Packet>;

    fn output(&self, ifindex: IfIndex, frame: Packet) -> Result<Option<Packet>, HookError>;

    fn input_orphan(&self, ifindex: IfIndex, frame: Packet);

    fn attach(&self, ifindex: IfIndex);

    fn detach(&self, ifindex: IfIndex);
}

/// Host network stack capabilities.
pub trait Host: Send + Sync {
    fn interfaces(&self) -> &RwLock<InterfaceTable>;

    fn segment_pool(&self) -> &SegmentPool;

    /// Installs `hooks`, returning whatever was installed before.
    fn install_hooks(&self, hooks: Arc<dyn EtherHooks>) -> Option<Arc<dyn EtherHooks>>;

    /// Puts back a hook set previously returned by [`Host::install_hooks`].
    fn restore_hooks(&self, previous: Option<Arc<dyn EtherHooks>>);

    /// Delivers a frame to the host's receive path, as if it arrived on `ifindex`.
    fn if_input(&self, ifindex: IfIndex, frame: Packet);

    /// Hands a frame to the driver of `ifindex` for transmission.
    fn if_transmit(&self, ifindex: IfIndex, frame: Packet);
}
