use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netsplice::mem::{Tracking, MIN_CEILING};
use netsplice::net::sim::SimHost;
use netsplice::net::{IfFlags, MacAddr};
use netsplice::worker::{Consumer, Shutdown, Step, WorkerState};
use netsplice::{ConsumerContext, ConsumerFactory, MapConfig, Module, ModuleError, ModuleEvent};

const VMAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);

#[derive(Default)]
struct Seen {
    rtparams: Mutex<Option<Option<String>>>,
    finalized: AtomicBool,
    complete: AtomicBool,
}

struct Idle {
    ctx: ConsumerContext,
    seen: Arc<Seen>,
}

impl Consumer for Idle {
    fn startup(&mut self) -> anyhow::Result<()> {
        *self.seen.rtparams.lock().unwrap() = Some(self.ctx.rtparams.clone());
        self.ctx.netif.plug("eth0", 1, VMAC)?;
        Ok(())
    }

    fn run_once(&mut self) -> Step {
        if self.seen.complete.load(Ordering::SeqCst) {
            return Step::Completed;
        }
        self.ctx.blocker.block(0.001);
        Step::Continue
    }

    fn finalize(&mut self) {
        self.seen.finalized.store(true, Ordering::SeqCst);
    }
}

fn module(source: MapConfig) -> (Module, Arc<SimHost>, Arc<Seen>) {
    let host = Arc::new(SimHost::new());
    host.add_interface("eth0", MacAddr([0, 0x1b, 0x21, 0, 0, 1]), 1500, IfFlags::UP);
    let seen = Arc::new(Seen::default());
    let shared = seen.clone();
    let factory: ConsumerFactory = Box::new(move |ctx: ConsumerContext| {
        Box::new(Idle {
            ctx,
            seen: shared.clone(),
        }) as Box<dyn Consumer>
    });
    let module = Module::new("echo", host.clone(), Box::new(source), factory);
    (module, host, seen)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

#[test]
fn unload_before_load_is_already_active() {
    let (mut module, _host, _seen) = module(MapConfig::new());
    assert!(matches!(
        module.handle_event(ModuleEvent::Unload),
        Err(ModuleError::AlreadyActive)
    ));
}

#[test]
fn other_events_are_unsupported() {
    let (mut module, _host, _seen) = module(MapConfig::new());
    for event in [ModuleEvent::Quiesce, ModuleEvent::Shutdown] {
        assert!(matches!(
            module.handle_event(event),
            Err(ModuleError::Unsupported(e)) if e == event
        ));
    }
    assert!(!module.is_loaded());
}

#[test]
fn load_runs_consumer_with_resolved_config() {
    let source = MapConfig::new()
        .set("netsplice.maxmem", "1")
        .set("netsplice.echo.rtparams", "mode=test")
        .set("netsplice.memtrack", "1");
    let (mut module, host, seen) = module(source);

    module.handle_event(ModuleEvent::Load).unwrap();
    assert!(matches!(
        module.handle_event(ModuleEvent::Load),
        Err(ModuleError::AlreadyActive)
    ));

    let config = module.config().unwrap().clone();
    assert_eq!(config.maxmem, MIN_CEILING);
    assert_eq!(config.tracking, Tracking::Ledger);
    assert!(wait_until(|| module.worker_state() == WorkerState::Running));
    assert!(host.hooks_installed());
    assert!(wait_until(|| {
        module
            .netif()
            .is_some_and(|n| n.registry().find_by_id(1).is_some())
    }));
    assert_eq!(
        *seen.rtparams.lock().unwrap(),
        Some(Some("mode=test".to_string()))
    );

    let summary = module.unload().unwrap();
    assert_eq!(summary.shutdown, Shutdown::Stopped);
    assert!(summary.leaks.is_empty(), "{:?}", summary.leaks);
    assert_eq!(summary.outstanding, 0);
    assert!(seen.finalized.load(Ordering::SeqCst));
    assert!(!host.hooks_installed());
    assert!(!module.is_loaded());
    assert_eq!(module.worker_state(), WorkerState::None);
}

#[test]
fn completed_consumer_unloads_cleanly() {
    let (mut module, _host, seen) = module(MapConfig::new());
    module.load().unwrap();
    seen.complete.store(true, Ordering::SeqCst);
    assert!(wait_until(|| module.worker_state() == WorkerState::None));

    let summary = module.unload().unwrap();
    assert_eq!(summary.shutdown, Shutdown::NotRunning);
    assert!(seen.finalized.load(Ordering::SeqCst));

    // The module can be loaded again afterwards.
    seen.complete.store(false, Ordering::SeqCst);
    module.load().unwrap();
    module.handle_event(ModuleEvent::Unload).unwrap();
}
