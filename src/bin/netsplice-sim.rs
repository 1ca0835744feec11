#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use netsplice::net::sim::SimHost;
use netsplice::net::{FlatBuffer, IfFlags, MacAddr, Netif};
use netsplice::worker::{Blocker, Consumer, Step, WorkerState};
use netsplice::{ConsumerContext, ConsumerFactory, EnvConfig, Module, ModuleEvent};

const PLUG_ID: u32 = 0;
const HOST_MAC: MacAddr = MacAddr([0x00, 0x1b, 0x21, 0x00, 0x00, 0x01]);
const PEER_MAC: MacAddr = MacAddr([0x00, 0x1b, 0x21, 0x00, 0x00, 0xfe]);

#[derive(Debug, Parser)]
#[command(about = "Runs an echo consumer spliced into a simulated host interface")]
struct Args {
    /// Module instance name; selects `NETSPLICE_<INSTANCE>_*` settings.
    #[arg(long, default_value = "echo")]
    instance: String,

    /// Interface to plug.
    #[arg(long, default_value = "eth0")]
    ifname: String,

    /// Virtual MAC the consumer answers on.
    #[arg(long, default_value = "02:00:00:00:00:01")]
    mac: MacAddr,

    /// Frames to inject before expecting the consumer to finish.
    #[arg(long, default_value_t = 16)]
    frames: u64,

    /// Payload bytes per injected frame.
    #[arg(long, default_value_t = 64)]
    payload: usize,

    /// How long to wait for the consumer, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

/// Sends every frame it receives back to its sender.
struct Echo {
    netif: Arc<Netif>,
    blocker: Blocker,
    ifname: String,
    mac: MacAddr,
    target: u64,
    echoed: u64,
}

impl Echo {
    fn reply(&self, frame: &FlatBuffer) -> netsplice::net::Result<()> {
        let bytes = frame.as_slice();
        if bytes.len() < 12 {
            return Ok(());
        }
        let mut block = self.netif.alloc_buffer(bytes.len())?;
        let out = block.as_mut_slice();
        out.copy_from_slice(bytes);
        out[..6].copy_from_slice(&bytes[6..12]);
        out[6..12].copy_from_slice(&self.mac.0);
        self.netif.submit(PLUG_ID, &[FlatBuffer::from_block(block)])
    }
}

impl Consumer for Echo {
    fn startup(&mut self) -> anyhow::Result<()> {
        let was_up = self
            .netif
            .plug(&self.ifname, PLUG_ID, self.mac)
            .with_context(|| format!("plugging {}", self.ifname))?;
        tracing::info!(ifname = %self.ifname, mac = %self.mac, was_up, "echo consumer started");
        Ok(())
    }

    fn run_once(&mut self) -> Step {
        let frames = self.netif.drain_all(PLUG_ID);
        if frames.is_empty() {
            self.blocker.block(0.01);
            return Step::Continue;
        }
        for frame in &frames {
            match self.reply(frame) {
                Ok(()) => self.echoed += 1,
                Err(err) => tracing::warn!(%err, "echo failed"),
            }
        }
        if self.echoed >= self.target {
            Step::Completed
        } else {
            Step::Continue
        }
    }

    fn finalize(&mut self) {
        tracing::info!(echoed = self.echoed, "echo consumer finished");
    }

    fn teardown(&mut self) {
        self.netif.unplug(PLUG_ID);
    }
}

fn frame(dst: MacAddr, src: MacAddr, payload: usize, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + payload);
    out.extend_from_slice(&dst.0);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(&[0x88, 0xb5]);
    out.extend((0..payload).map(|i| (seq as usize + i) as u8));
    out
}

fn wait_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let host = Arc::new(SimHost::new());
    let ifindex = host.add_interface(
        &args.ifname,
        HOST_MAC,
        1500,
        IfFlags::UP | IfFlags::BROADCAST | IfFlags::RUNNING,
    );

    let (ifname, mac, target) = (args.ifname.clone(), args.mac, args.frames);
    let factory: ConsumerFactory = Box::new(move |ctx: ConsumerContext| {
        Box::new(Echo {
            netif: ctx.netif,
            blocker: ctx.blocker,
            ifname: ifname.clone(),
            mac,
            target,
            echoed: 0,
        }) as Box<dyn Consumer>
    });
    let mut module = Module::new(args.instance.clone(), host.clone(), Box::new(EnvConfig), factory);
    module.handle_event(ModuleEvent::Load)?;

    let deadline = Instant::now() + Duration::from_millis(args.timeout_ms);
    let netif = module.netif().cloned().context("module did not load")?;
    if !wait_until(deadline, || netif.registry().find_by_id(PLUG_ID).is_some()) {
        bail!("consumer never plugged {}", args.ifname);
    }
    drop(netif);

    for seq in 0..args.frames {
        host.inject(ifindex, &frame(args.mac, PEER_MAC, args.payload, seq));
    }
    let finished = wait_until(deadline, || module.worker_state() == WorkerState::None);

    let echoed = host.take_wire();
    let summary = module.unload()?;
    tracing::info!(
        shutdown = ?summary.shutdown,
        leaked = summary.leaks.allocations.len(),
        outstanding = summary.outstanding,
        "module unloaded"
    );
    println!("injected {} frames, {} echoed", args.frames, echoed.len());

    if !finished {
        bail!("consumer did not finish within {} ms", args.timeout_ms);
    }
    if echoed.iter().any(|f| f.bytes.get(..6) != Some(&PEER_MAC.0[..])) {
        bail!("echoed frame not addressed to the sender");
    }
    Ok(())
}
