//! Load/unload glue tying the budget, the network splice and the worker together.

use std::sync::Arc;

use netsplice_mem::{LeakReport, MemError, MemoryBudget};
use netsplice_net::{Host, NetError, Netif};
use netsplice_worker::{
    Blocker, Consumer, Shutdown, Worker, WorkerConfig, WorkerError, WorkerState,
};

use crate::config::{ConfigSource, ModuleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEvent {
    Load,
    Unload,
    Quiesce,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// Load while loaded, or unload while not loaded.
    #[error("module is already in the requested state")]
    AlreadyActive,

    #[error("unsupported module event {0:?}")]
    Unsupported(ModuleEvent),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Mem(#[from] MemError),
}

pub type Result<T> = std::result::Result<T, ModuleError>;

/// What a consumer gets to work with.
pub struct ConsumerContext {
    pub instance: String,
    pub netif: Arc<Netif>,
    pub rtparams: Option<String>,
    pub blocker: Blocker,
}

/// Builds the consumer on every load.
pub type ConsumerFactory = Box<dyn FnMut(ConsumerContext) -> Box<dyn Consumer> + Send>;

#[derive(Debug)]
pub struct UnloadSummary {
    pub shutdown: Shutdown,
    /// Live allocations still recorded by the ledger (always empty without tracking).
    pub leaks: LeakReport,
    /// Bytes the budget still counted as outstanding after teardown.
    pub outstanding: usize,
}

struct Loaded {
    config: ModuleConfig,
    budget: MemoryBudget,
    netif: Arc<Netif>,
    worker: Worker,
}

pub struct Module {
    instance: String,
    host: Arc<dyn Host>,
    source: Box<dyn ConfigSource + Send>,
    factory: ConsumerFactory,
    loaded: Option<Loaded>,
}

impl Module {
    pub fn new(
        instance: impl Into<String>,
        host: Arc<dyn Host>,
        source: Box<dyn ConfigSource + Send>,
        factory: ConsumerFactory,
    ) -> Self {
        Self {
            instance: instance.into(),
            host,
            source,
            factory,
            loaded: None,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn config(&self) -> Option<&ModuleConfig> {
        self.loaded.as_ref().map(|l| &l.config)
    }

    pub fn netif(&self) -> Option<&Arc<Netif>> {
        self.loaded.as_ref().map(|l| &l.netif)
    }

    pub fn budget(&self) -> Option<&MemoryBudget> {
        self.loaded.as_ref().map(|l| &l.budget)
    }

    pub fn worker_state(&self) -> WorkerState {
        self.loaded
            .as_ref()
            .map_or(WorkerState::None, |l| l.worker.state())
    }

    pub fn handle_event(&mut self, event: ModuleEvent) -> Result<()> {
        match event {
            ModuleEvent::Load => self.load(),
            ModuleEvent::Unload => self.unload().map(drop),
            other => Err(ModuleError::Unsupported(other)),
        }
    }

    pub fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Err(ModuleError::AlreadyActive);
        }
        let config = ModuleConfig::resolve(self.source.as_ref(), &self.instance);
        tracing::info!(
            instance = %self.instance,
            maxmem_mib = config.maxmem >> 20,
            tracking = ?config.tracking,
            "module loading"
        );

        let budget = MemoryBudget::with_tracking(config.maxmem, config.tracking);
        let netif = Arc::new(Netif::init(self.host.clone(), budget.clone()));
        let consumer = (self.factory)(ConsumerContext {
            instance: self.instance.clone(),
            netif: netif.clone(),
            rtparams: config.rtparams.clone(),
            blocker: Blocker::new(config.hz),
        });
        let worker = Worker::init(
            consumer,
            WorkerConfig {
                name: format!("netsplice-{}", self.instance),
                shutdown_timeout: config.shutdown_timeout,
                ..WorkerConfig::default()
            },
        )?;
        worker.launch()?;

        self.loaded = Some(Loaded {
            config,
            budget,
            netif,
            worker,
        });
        Ok(())
    }

    pub fn unload(&mut self) -> Result<UnloadSummary> {
        let Some(loaded) = self.loaded.take() else {
            tracing::warn!(instance = %self.instance, "unload without load");
            return Err(ModuleError::AlreadyActive);
        };
        let Loaded {
            budget,
            netif,
            mut worker,
            ..
        } = loaded;

        let shutdown = worker.shutdown();
        tracing::info!(instance = %self.instance, ?shutdown, "module unloading");
        netif.deinit();
        drop(worker);
        drop(netif);

        let leaks = budget.check_for_leaks();
        let outstanding = budget.outstanding();
        if outstanding > 0 {
            tracing::warn!(instance = %self.instance, outstanding, "memory still outstanding after unload");
        }
        Ok(UnloadSummary {
            shutdown,
            leaks,
            outstanding,
        })
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.loaded.is_some() {
            if let Err(err) = self.unload() {
                tracing::warn!(%err, "unload on drop failed");
            }
        }
    }
}
