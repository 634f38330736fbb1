//! Worker pool: the table of running worker processes and the launch seam.
//!
//! The scheduler never blocks on a worker. Each launched process gets a
//! tokio task that awaits the child and reports its exit code over a oneshot
//! channel; the pool polls those channels with `try_recv`.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{Phase, WorkspaceMode};
use crate::error::{Error, Result};
use crate::state::TaskStore;

/// Everything a worker needs to run one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub task_id: String,
    pub run_id: String,
    pub role: String,
    pub phase: Phase,
    pub workspace: PathBuf,
    pub mode: WorkspaceMode,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    /// Ended without an exit code: killed, signalled, or its waiter vanished.
    Signaled,
}

impl WorkerExit {
    pub fn describe(&self) -> String {
        match self {
            WorkerExit::Code(c) => format!("worker exited with code {c}"),
            WorkerExit::Signaled => "worker terminated without an exit code".to_string(),
        }
    }
}

/// Handle to one launched worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    exit_rx: oneshot::Receiver<Option<i32>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub fn new(
        pid: Option<u32>,
        exit_rx: oneshot::Receiver<Option<i32>>,
        kill_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            pid,
            exit_rx,
            kill_tx,
        }
    }

    /// A handle whose process has already exited with `code`.
    pub fn finished(code: Option<i32>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(code);
        Self::new(None, rx, None)
    }

    /// Non-blocking completion check.
    pub fn try_poll(&mut self) -> Option<WorkerExit> {
        match self.exit_rx.try_recv() {
            Ok(Some(code)) => Some(WorkerExit::Code(code)),
            Ok(None) => Some(WorkerExit::Signaled),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(WorkerExit::Signaled),
        }
    }

    /// Ask the waiter task to kill the process. Idempotent.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Starts worker processes. The scheduler only sees this trait.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, invocation: &WorkerInvocation) -> Result<WorkerHandle>;
}

/// Launches `<program> --state-dir <dir> worker <role> --once ...` as a child
/// process, with output captured to the run's log file.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    state_dir: PathBuf,
    store: TaskStore,
    debug: bool,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, state_dir: &Path, store: TaskStore) -> Self {
        Self {
            program,
            state_dir: state_dir.to_path_buf(),
            store,
            debug: false,
        }
    }

    /// Use the running executable as the worker program.
    pub fn current_exe(state_dir: &Path, store: TaskStore) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, state_dir, store))
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn args(&self, inv: &WorkerInvocation) -> Vec<String> {
        let mut args = vec!["--state-dir".to_string(), self.state_dir.display().to_string()];
        if self.debug {
            args.push("--debug".to_string());
        }
        args.extend([
            "worker".to_string(),
            inv.role.clone(),
            "--once".to_string(),
            "--task-id".to_string(),
            inv.task_id.clone(),
            "--run-id".to_string(),
            inv.run_id.clone(),
            "--workspace".to_string(),
            inv.workspace.display().to_string(),
            "--phase".to_string(),
            inv.phase.to_string(),
            "--mode".to_string(),
            inv.mode.to_string(),
        ]);
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, inv: &WorkerInvocation) -> Result<WorkerHandle> {
        let log_path = self.store.log_path(&inv.task_id, &inv.run_id);
        let log = File::create(&log_path)
            .map_err(|e| Error::Spawn(format!("{}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::Spawn(format!("{}: {e}", log_path.display())))?;

        let mut child = Command::new(&self.program)
            .args(self.args(inv))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.program.display())))?;
        let pid = child.id();
        debug!(task_id = %inv.task_id, run_id = %inv.run_id, phase = %inv.phase, ?pid, "worker launched");

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let task_id = inv.task_id.clone();
        tokio::spawn(async move {
            // A dropped handle closes kill_rx, which also kills the worker.
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let code = match waited {
                Some(Ok(status)) => status.code(),
                Some(Err(e)) => {
                    warn!(task_id, error = %e, "waiting on worker failed");
                    None
                }
                None => {
                    debug!(task_id, "killing worker");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(WorkerHandle::new(pid, exit_rx, Some(kill_tx)))
    }
}

/// A worker the scheduler is tracking.
#[derive(Debug)]
pub struct ActiveWorker {
    pub handle: WorkerHandle,
    pub run_id: String,
    pub phase: Phase,
    pub role: String,
    pub workspace: PathBuf,
    pub mode: WorkspaceMode,
}

/// Active-worker table with per-role and global caps.
#[derive(Debug)]
pub struct WorkerPool {
    workers: HashMap<String, ActiveWorker>,
    caps: BTreeMap<String, usize>,
}

impl WorkerPool {
    pub fn new(caps: BTreeMap<String, usize>) -> Self {
        Self {
            workers: HashMap::new(),
            caps,
        }
    }

    /// Sum of all role caps.
    pub fn global_cap(&self) -> usize {
        self.caps.values().sum()
    }

    /// Cap for a role; unknown roles get none.
    pub fn cap_for(&self, role: &str) -> usize {
        self.caps.get(role).copied().unwrap_or(0)
    }

    pub fn active_for(&self, role: &str) -> usize {
        self.workers.values().filter(|w| w.role == role).count()
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self, role: &str) -> bool {
        self.active_for(role) < self.cap_for(role) && self.active_count() < self.global_cap()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.workers.contains_key(task_id)
    }

    /// Every tracked `(task_id, worker)`, in no particular order.
    pub fn tracked(&self) -> impl Iterator<Item = (&str, &ActiveWorker)> {
        self.workers.iter().map(|(id, w)| (id.as_str(), w))
    }

    /// Track a worker, returning the entry it replaced.
    pub fn insert(&mut self, task_id: &str, worker: ActiveWorker) -> Option<ActiveWorker> {
        self.workers.insert(task_id.to_string(), worker)
    }

    /// Remove and return every worker that has exited, in task id order.
    pub fn poll_finished(&mut self) -> Vec<(String, ActiveWorker, WorkerExit)> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        let mut finished = Vec::new();
        for id in ids {
            let exit = match self.workers.get_mut(&id) {
                Some(worker) => worker.handle.try_poll(),
                None => None,
            };
            if let Some(exit) = exit {
                if let Some(worker) = self.workers.remove(&id) {
                    finished.push((id, worker, exit));
                }
            }
        }
        finished
    }

    /// Kill a tracked worker. It stays tracked until its exit is observed.
    pub fn abort(&mut self, task_id: &str) -> bool {
        match self.workers.get_mut(task_id) {
            Some(worker) => {
                worker.handle.kill();
                true
            }
            None => false,
        }
    }
}
