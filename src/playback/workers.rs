//! Engine-scoped worker runtime
//!
//! Three thread groups back the engine, all owned by it and joined on
//! shutdown (no process globals):
//!
//! - the serial loading worker: executes load requests one at a time and
//!   runs audible-region scans in the same slot, so a scan never preempts a
//!   load;
//! - the read-ahead pool: eight workers sweeping a registry of ring-fill
//!   tasks, yielding between decks;
//! - (the visualization thread lives with the level tracker.)

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

use crate::playback::deck::{self, LoadTask, ScanTask};
use crate::playback::read_ahead::FillTask;

/// Number of read-ahead worker slots.
const READ_AHEAD_WORKERS: usize = 8;

/// Idle park between pool sweeps that made no progress.
const POOL_IDLE_PARK: Duration = Duration::from_millis(2);

/// Jobs for the serial loading worker.
pub(crate) enum WorkerJob {
    Load(LoadTask),
    Scan(ScanTask),
    Shutdown,
}

/// Registry of ring-fill tasks swept by the read-ahead pool.
#[derive(Clone)]
pub(crate) struct PoolRegistry {
    tasks: Arc<Mutex<Vec<Weak<FillTask>>>>,
}

impl PoolRegistry {
    fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a deck's fill task. Dead entries are pruned on the way in.
    pub fn register(&self, task: &Arc<FillTask>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| t.upgrade().is_some_and(|t| t.is_attached()));
        tasks.push(Arc::downgrade(task));
    }

    /// One sweep over every live task. Returns true if any made progress.
    fn sweep(&self) -> bool {
        let snapshot: Vec<Arc<FillTask>> = {
            let tasks = self.tasks.lock().unwrap();
            tasks.iter().filter_map(|t| t.upgrade()).collect()
        };

        let mut progressed = false;
        for task in snapshot {
            if task.is_attached() && task.service() {
                progressed = true;
            }
        }
        progressed
    }
}

/// Owns the loading worker and the read-ahead pool.
pub(crate) struct WorkerRuntime {
    load_tx: Sender<WorkerJob>,
    registry: PoolRegistry,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn spawn() -> Self {
        let (load_tx, load_rx) = unbounded::<WorkerJob>();
        let registry = PoolRegistry::new();
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handles = Vec::new();

        // Serial loading worker: loads and scans share the slot.
        {
            let scan_tx = load_tx.clone();
            let handle = std::thread::Builder::new()
                .name("segue-loader".to_string())
                .spawn(move || {
                    while let Ok(job) = load_rx.recv() {
                        match job {
                            WorkerJob::Load(task) => deck::perform_load(task, &scan_tx),
                            WorkerJob::Scan(task) => deck::perform_scan(task),
                            WorkerJob::Shutdown => break,
                        }
                    }
                    debug!("loading worker exited");
                })
                .expect("failed to spawn loading worker");
            handles.push(handle);
        }

        // Read-ahead pool.
        for i in 0..READ_AHEAD_WORKERS {
            let registry = registry.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("segue-readahead-{i}"))
                .spawn(move || {
                    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
                        if !registry.sweep() {
                            std::thread::sleep(POOL_IDLE_PARK);
                        }
                    }
                })
                .expect("failed to spawn read-ahead worker");
            handles.push(handle);
        }

        Self {
            load_tx,
            registry,
            shutdown,
            handles,
        }
    }

    pub fn load_tx(&self) -> Sender<WorkerJob> {
        self.load_tx.clone()
    }

    pub fn registry(&self) -> PoolRegistry {
        self.registry.clone()
    }

    /// Stop all workers and join them. Idempotent.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        let _ = self.load_tx.send(WorkerJob::Shutdown);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
