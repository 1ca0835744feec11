//! Splices plugged host interfaces into a consumer's packet loop.
//!
//! [`Netif`] installs [`intercept::Interceptor`] as the host's Ethernet hooks. Frames addressed to
//! a plugged interface's virtual MAC are queued for the consumer instead of reaching the host
//! stack; broadcasts are queued as a copy and still reach the host. The consumer drains queued
//! frames as [`FlatBuffer`] views over host memory and submits its own buffers back, which are
//! cut into host segments without copying.
#![forbid(unsafe_code)]

pub mod bridge;
pub mod chain;
mod error;
pub mod host;
pub mod intercept;
mod mac;
mod netif;
pub mod proxy;
pub mod registry;
pub mod rxq;
pub mod sim;

pub use chain::{Packet, PoolStats, SegmentPool, SEGMENT_CAP};
pub use error::{NetError, Result};
pub use host::{EtherHooks, HookError, Host, IfFlags, IfIndex};
pub use mac::{MacAddr, ParseMacError, ETHER_ADDR_LEN};
pub use netif::Netif;
pub use proxy::{BufferProxy, FlatBuffer, ReleaseKind, Storage};
pub use registry::InterfaceStats;
pub use rxq::QueueStats;

/// Smallest MTU a plugged interface is left with, so a full Ethernet frame fits.
pub const MIN_MTU: u32 = 1514;
