//! Hosts a packet-processing consumer on top of a host network stack.
//!
//! A [`Module`] owns one consumer instance: on load it resolves its [`ModuleConfig`], creates the
//! memory budget, installs the network splice and starts the worker thread that drives the
//! consumer; on unload it tears all of that down again and reports leaks.
#![forbid(unsafe_code)]

pub mod config;
pub mod module;

pub use config::{ConfigSource, EnvConfig, MapConfig, ModuleConfig};
pub use module::{
    ConsumerContext, ConsumerFactory, Module, ModuleError, ModuleEvent, Result, UnloadSummary,
};

pub use netsplice_mem as mem;
pub use netsplice_net as net;
pub use netsplice_worker as worker;
