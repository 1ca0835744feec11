use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsplice_worker::{Consumer, Shutdown, Step, Worker, WorkerConfig, WorkerError, WorkerState};

#[derive(Clone, Default)]
struct Log {
    events: Arc<Mutex<Vec<&'static str>>>,
    iterations: Arc<AtomicU64>,
}

impl Log {
    fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

struct Counting {
    log: Log,
    complete_after: Option<u64>,
    fail_startup: bool,
}

impl Consumer for Counting {
    fn startup(&mut self) -> anyhow::Result<()> {
        self.log.push("startup");
        if self.fail_startup {
            anyhow::bail!("runtime entry point missing");
        }
        Ok(())
    }

    fn run_once(&mut self) -> Step {
        let n = self.log.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        match self.complete_after {
            Some(limit) if n >= limit => Step::Completed,
            _ => {
                std::thread::sleep(Duration::from_millis(1));
                Step::Continue
            }
        }
    }

    fn finalize(&mut self) {
        self.log.push("finalize");
    }

    fn teardown(&mut self) {
        self.log.push("teardown");
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        name: "netsplice-test".to_string(),
        shutdown_timeout: Duration::from_secs(5),
        fallback_pause: Duration::from_millis(1),
    }
}

#[test]
fn run_loop_completion_moves_running_to_none() {
    let log = Log::default();
    let mut worker = Worker::init(
        Counting {
            log: log.clone(),
            complete_after: Some(3),
            fail_startup: false,
        },
        config(),
    )
    .unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);

    worker.launch().unwrap();
    assert_eq!(
        worker.wait_for(WorkerState::None, Duration::from_secs(5)),
        WorkerState::None
    );
    assert_eq!(log.iterations.load(Ordering::SeqCst), 3);
    assert_eq!(worker.shutdown(), Shutdown::NotRunning);
    assert_eq!(log.events(), vec!["startup", "finalize", "teardown"]);
}

#[test]
fn requested_shutdown_stops_at_iteration_boundary() {
    let log = Log::default();
    let mut worker = Worker::init(
        Counting {
            log: log.clone(),
            complete_after: None,
            fail_startup: false,
        },
        config(),
    )
    .unwrap();
    worker.launch().unwrap();
    assert_eq!(
        worker.wait_for(WorkerState::Running, Duration::from_secs(5)),
        WorkerState::Running
    );

    assert_eq!(worker.shutdown(), Shutdown::Stopped);
    assert_eq!(worker.state(), WorkerState::None);
    assert!(log.iterations.load(Ordering::SeqCst) >= 1);
    assert_eq!(log.events(), vec!["startup", "finalize", "teardown"]);

    // A second request is a no-op.
    assert_eq!(worker.shutdown(), Shutdown::NotRunning);
}

#[test]
fn shutdown_before_launch_never_runs_consumer() {
    let log = Log::default();
    let mut worker = Worker::init(
        Counting {
            log: log.clone(),
            complete_after: None,
            fail_startup: false,
        },
        config(),
    )
    .unwrap();

    assert_eq!(worker.shutdown(), Shutdown::Cancelled);
    assert_eq!(worker.state(), WorkerState::None);
    assert!(log.events().is_empty());
    assert!(matches!(worker.launch(), Err(WorkerError::NotInitialized)));
}

#[test]
fn launch_twice_is_rejected() {
    let log = Log::default();
    let worker = Worker::init(
        Counting {
            log,
            complete_after: Some(1),
            fail_startup: false,
        },
        config(),
    )
    .unwrap();
    worker.launch().unwrap();
    assert!(matches!(worker.launch(), Err(WorkerError::AlreadyLaunched)));
}

#[test]
fn failed_startup_skips_loop_but_still_finalizes() {
    let log = Log::default();
    let mut worker = Worker::init(
        Counting {
            log: log.clone(),
            complete_after: None,
            fail_startup: true,
        },
        config(),
    )
    .unwrap();
    worker.launch().unwrap();
    assert_eq!(
        worker.wait_for(WorkerState::None, Duration::from_secs(5)),
        WorkerState::None
    );
    assert_eq!(log.iterations.load(Ordering::SeqCst), 0);
    assert_eq!(log.events(), vec!["startup", "finalize", "teardown"]);
    assert_eq!(worker.shutdown(), Shutdown::NotRunning);
}

struct Stuck {
    release: mpsc::Receiver<()>,
    entered: mpsc::Sender<()>,
}

impl Consumer for Stuck {
    fn run_once(&mut self) -> Step {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        Step::Completed
    }
}

#[test]
fn consumer_stuck_in_an_iteration_times_out() {
    let (release_tx, release_rx) = mpsc::channel();
    let (entered_tx, entered_rx) = mpsc::channel();
    let mut worker = Worker::init(
        Stuck {
            release: release_rx,
            entered: entered_tx,
        },
        WorkerConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..config()
        },
    )
    .unwrap();
    worker.launch().unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(worker.shutdown(), Shutdown::TimedOut);
    assert_eq!(worker.state(), WorkerState::Stopped);

    release_tx.send(()).unwrap();
    assert_eq!(
        worker.wait_for(WorkerState::None, Duration::from_secs(5)),
        WorkerState::None
    );
}

#[test]
fn shutdown_right_after_launch_still_finalizes() {
    for _ in 0..100 {
        let log = Log::default();
        let mut worker = Worker::init(
            Counting {
                log: log.clone(),
                complete_after: None,
                fail_startup: false,
            },
            config(),
        )
        .unwrap();
        worker.launch().unwrap();

        assert_eq!(worker.shutdown(), Shutdown::Stopped);
        assert_eq!(worker.state(), WorkerState::None);
        assert_eq!(log.events(), vec!["startup", "finalize", "teardown"]);
    }
}
