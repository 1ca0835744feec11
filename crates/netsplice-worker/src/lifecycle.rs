use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{Result, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    None,
    Running,
    Stopped,
}

/// Outcome of a single consumer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Completed,
}

/// The hosted consumer, reached only through its entry points.
///
/// `run_once` must return between iterations; the worker cannot interrupt an iteration in
/// progress.
pub trait Consumer: Send + 'static {
    /// Runs on the worker thread before the first iteration. On error the run loop is skipped.
    fn startup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn run_once(&mut self) -> Step;

    fn finalize(&mut self) {}

    /// Releases the consumer's runtime resources. Always called last.
    fn teardown(&mut self) {}
}

impl<C: Consumer + ?Sized> Consumer for Box<C> {
    fn startup(&mut self) -> anyhow::Result<()> {
        (**self).startup()
    }

    fn run_once(&mut self) -> Step {
        (**self).run_once()
    }

    fn finalize(&mut self) {
        (**self).finalize()
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Upper bound on how long [`Worker::shutdown`] waits for the run loop to exit.
    pub shutdown_timeout: Duration,
    /// Unconditional pause after the shutdown wait, covering a missed wakeup.
    pub fallback_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "netsplice".to_string(),
            shutdown_timeout: Duration::from_secs(1),
            fallback_pause: Duration::from_millis(10),
        }
    }
}

/// How a [`Worker::shutdown`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The worker had already finished (or was never created).
    NotRunning,
    /// The run loop observed the stop request and exited.
    Stopped,
    /// The worker was never launched; its thread exited without running the consumer.
    Cancelled,
    /// The run loop did not exit within the bounded wait. The thread is detached.
    TimedOut,
}

struct Control {
    state: WorkerState,
    launched: bool,
    cancelled: bool,
    stop_requested: bool,
}

struct Shared {
    control: Mutex<Control>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> WorkerState {
        self.lock().state
    }
}

/// Sets `NONE` and wakes waiters when the worker body exits, including by panic.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut control = self.0.lock();
        control.state = WorkerState::None;
        self.0.changed.notify_all();
    }
}

pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates the worker thread without scheduling the consumer. The state becomes `STOPPED`.
    pub fn init<C: Consumer>(consumer: C, config: WorkerConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: WorkerState::Stopped,
                launched: false,
                cancelled: false,
                stop_requested: false,
            }),
            changed: Condvar::new(),
        });

        let body_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || body(body_shared, consumer))
            .map_err(|err| {
                tracing::error!(name = %config.name, "could not create worker thread: {err}");
                shared.lock().state = WorkerState::None;
                WorkerError::Spawn(err)
            })?;

        tracing::debug!(name = %config.name, "worker initialized");
        Ok(Self {
            shared,
            thread: Some(thread),
            config,
        })
    }

    /// Lets the worker thread begin running the consumer.
    pub fn launch(&self) -> Result<()> {
        if self.thread.is_none() {
            return Err(WorkerError::NotInitialized);
        }
        let mut control = self.shared.lock();
        if control.launched {
            return Err(WorkerError::AlreadyLaunched);
        }
        control.launched = true;
        self.shared.changed.notify_all();
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Blocks until the worker reaches `want` or `timeout` elapses. Returns the last state seen.
    pub fn wait_for(&self, want: WorkerState, timeout: Duration) -> WorkerState {
        let control = self.shared.lock();
        let (control, _) = self
            .shared
            .changed
            .wait_timeout_while(control, timeout, |c| c.state != want)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        control.state
    }

    /// Requests a cooperative stop and waits, bounded, for the run loop to exit.
    ///
    /// Once [`Worker::launch`] has succeeded the consumer always gets its `finalize` and
    /// `teardown`, even if the stop arrives before the thread reaches its first iteration.
    pub fn shutdown(&mut self) -> Shutdown {
        let Some(thread) = self.thread.take() else {
            return Shutdown::NotRunning;
        };

        let mut control = self.shared.lock();
        let outcome = match (control.state, control.launched) {
            (WorkerState::None, _) => {
                drop(control);
                Shutdown::NotRunning
            }
            (WorkerState::Stopped, false) => {
                control.cancelled = true;
                self.shared.changed.notify_all();
                drop(control);
                Shutdown::Cancelled
            }
            (WorkerState::Running, _) | (WorkerState::Stopped, true) => {
                control.state = WorkerState::Stopped;
                control.stop_requested = true;
                self.shared.changed.notify_all();
                let (control, wait) = self
                    .shared
                    .changed
                    .wait_timeout_while(control, self.config.shutdown_timeout, |c| {
                        c.state != WorkerState::None
                    })
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                drop(control);
                thread::sleep(self.config.fallback_pause);
                if wait.timed_out() {
                    tracing::warn!(
                        name = %self.config.name,
                        timeout = ?self.config.shutdown_timeout,
                        "worker did not stop in time; detaching"
                    );
                    return Shutdown::TimedOut;
                }
                Shutdown::Stopped
            }
        };

        if thread.join().is_err() {
            tracing::error!(name = %self.config.name, "worker thread panicked");
        }
        tracing::debug!(name = %self.config.name, ?outcome, "worker shut down");
        outcome
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn body<C: Consumer>(shared: Arc<Shared>, mut consumer: C) {
    let _exit = ExitGuard(shared.clone());
    {
        let mut control = shared.lock();
        while !control.launched && !control.cancelled {
            control = shared
                .changed
                .wait(control)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if control.cancelled {
            return;
        }
        if !control.stop_requested {
            control.state = WorkerState::Running;
        }
    }

    match consumer.startup() {
        Ok(()) => {
            let mut iterations: u64 = 0;
            while shared.state() == WorkerState::Running {
                iterations += 1;
                if consumer.run_once() == Step::Completed {
                    tracing::info!(iterations, "consumer run loop completed");
                    break;
                }
            }
        }
        Err(err) => tracing::error!("consumer startup failed: {err:#}"),
    }

    consumer.finalize();
    consumer.teardown();
}
