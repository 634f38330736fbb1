//! Scheduler: the single writer of task state.
//!
//! Each tick runs three scans in order: dispatch queued tasks whose
//! dependencies are complete and whose role has capacity, monitor running
//! workers and advance or retry their tasks, then reclaim zombies. Workers
//! run as separate processes and report back through result records; the
//! loop never waits on one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{new_run_id, Phase, ResultRecord, ResultStatus, Task, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::health::{FailureAction, RecoveryPolicy};
use crate::orchestration::pool::{
    ActiveWorker, WorkerExit, WorkerHandle, WorkerInvocation, WorkerLauncher, WorkerPool,
};
use crate::state::TaskStore;
use crate::util;
use crate::workspace::WorkspaceProvisioner;

const PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Task lifecycle notifications. Sent best-effort; a full channel drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: String,
        role: String,
        run_id: String,
    },
    /// A later phase began in the same workspace.
    PhaseStarted {
        task_id: String,
        phase: Phase,
        run_id: String,
    },
    TaskCompleted {
        task_id: String,
    },
    /// Back in the queue without consuming a retry.
    TaskRequeued {
        task_id: String,
        reason: String,
    },
    TaskRetried {
        task_id: String,
        retry_count: u32,
        reason: String,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    ZombieRecovered {
        task_id: String,
    },
}

/// Counts of what one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub phases_started: usize,
    pub completed: usize,
    pub requeued: usize,
    pub retried: usize,
    pub failed: usize,
    pub blocked: usize,
    pub recovered: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

enum Readiness {
    Ready,
    Waiting,
    Broken(String),
}

pub struct Scheduler {
    config: Config,
    store: TaskStore,
    provisioner: WorkspaceProvisioner,
    launcher: Arc<dyn WorkerLauncher>,
    pool: WorkerPool,
    policy: RecoveryPolicy,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(config: Config, store: TaskStore, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let provisioner = WorkspaceProvisioner::new(&config.workspace_root(), &config.repo_path());
        let pool = WorkerPool::new(config.role_caps.clone());
        let policy = RecoveryPolicy::from_config(&config);
        Self {
            config,
            store,
            provisioner,
            launcher,
            pool,
            policy,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "scheduler event dropped");
            }
        }
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// A failed tick is logged and the loop carries on. Workers still
    /// running when the scheduler is dropped are killed with their handles;
    /// zombie recovery requeues their tasks on the next start.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let interval = self.config.poll_interval();
        info!(
            poll_ms = interval.as_millis() as u64,
            global_cap = self.pool.global_cap(),
            mode = %self.config.mode,
            "scheduler started"
        );
        while !shutdown.is_cancelled() {
            match self.tick().await {
                Ok(summary) if !summary.is_idle() => debug!(?summary, "tick"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(active = self.pool.active_count(), "scheduler stopped");
        Ok(())
    }

    /// One tick, then keep monitoring the workers it started until the pool
    /// drains or `limit` passes. Nothing new is dispatched after the first
    /// tick; a task whose apply succeeds still gets its test phase.
    ///
    /// Workers still running at the limit are killed when the scheduler is
    /// dropped, and zombie recovery requeues their tasks later.
    pub async fn run_once(&mut self, limit: Duration) -> Result<TickSummary> {
        let mut summary = self.tick().await?;
        let deadline = tokio::time::Instant::now() + limit;
        let interval = self.config.poll_interval();
        while self.pool.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    active = self.pool.active_count(),
                    limit_secs = limit.as_secs(),
                    "workers still running at the single-run limit"
                );
                break;
            }
            tokio::time::sleep(interval).await;
            self.monitor_active(&mut summary)?;
        }
        Ok(summary)
    }

    /// One poll cycle: dispatch, monitor, zombie recovery.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        self.dispatch_queued(&mut summary).await?;
        self.monitor_active(&mut summary)?;
        self.recover_zombies(&mut summary)?;
        Ok(summary)
    }

    /// Kill a running worker. Its exit is handled as a phase failure on the
    /// next monitor pass.
    pub fn abort_worker(&mut self, task_id: &str) -> bool {
        let aborted = self.pool.abort(task_id);
        if aborted {
            warn!(task_id, "worker aborted");
        }
        aborted
    }

    fn readiness(&self, task: &Task) -> Result<Readiness> {
        let mut waiting = false;
        for dep in &task.depends_on {
            match self.store.get(dep)? {
                None => {
                    warn!(task_id = %task.id, dependency = %dep, "unknown dependency");
                    waiting = true;
                }
                Some(d) => match d.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed | TaskStatus::Blocked => {
                        return Ok(Readiness::Broken(format!("dependency {dep} is {}", d.status)));
                    }
                    _ => waiting = true,
                },
            }
        }
        Ok(if waiting { Readiness::Waiting } else { Readiness::Ready })
    }

    async fn dispatch_queued(&mut self, summary: &mut TickSummary) -> Result<()> {
        let queue = self.store.load_queue()?;
        let mut leaving = Vec::new();

        for task_id in queue {
            if self.pool.contains(&task_id) {
                continue;
            }
            let mut task = match self.store.get(&task_id) {
                Ok(Some(task)) => task,
                Ok(None) => {
                    warn!(%task_id, "queued task has no record, dropping from queue");
                    leaving.push(task_id);
                    continue;
                }
                Err(Error::InvalidTaskId(_)) => {
                    warn!(%task_id, "invalid id in queue, dropping");
                    leaving.push(task_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if task.status != TaskStatus::Queued {
                if task.status.is_terminal() {
                    leaving.push(task_id);
                }
                continue;
            }

            match self.readiness(&task)? {
                Readiness::Ready => {}
                Readiness::Waiting => continue,
                Readiness::Broken(reason) => {
                    info!(%task_id, %reason, "task blocked by dependency");
                    task.block(&reason);
                    self.store.save(&mut task)?;
                    leaving.push(task_id.clone());
                    summary.blocked += 1;
                    self.emit(SchedulerEvent::TaskBlocked { task_id, reason });
                    continue;
                }
            }

            let role = self.config.role_for_tags(&task.tags);
            if !self.pool.has_capacity(&role) {
                debug!(%task_id, role, "no capacity");
                continue;
            }
            if let Some(holder) = self.workspace_holder(&role, &task_id)? {
                warn!(%task_id, %holder, role, "workspace held by another task, leaving queued");
                continue;
            }

            if self.start_task(task, &role, summary).await? {
                leaving.push(task_id);
            }
        }

        if !leaving.is_empty() {
            self.store.remove_from_queue(&leaving)?;
        }
        Ok(())
    }

    /// Another live task whose canonical workspace is the one `task_id`
    /// would get. Distinct ids can slug to the same directory and branch.
    fn workspace_holder(&self, role: &str, task_id: &str) -> Result<Option<String>> {
        let wanted = self.provisioner.workspace_path(role, task_id);
        let tracked = self
            .pool
            .tracked()
            .find(|(id, w)| *id != task_id && self.provisioner.workspace_path(&w.role, id) == wanted);
        if let Some((id, _)) = tracked {
            return Ok(Some(id.to_string()));
        }
        let held = self.store.list_all()?.into_iter().find(|t| {
            t.id != task_id
                && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
                && t.assignee
                    .as_deref()
                    .is_some_and(|r| self.provisioner.workspace_path(r, &t.id) == wanted)
        });
        Ok(held.map(|t| t.id))
    }

    /// Provision, launch `apply` and persist. Returns false on spawn failure.
    async fn start_task(&mut self, mut task: Task, role: &str, summary: &mut TickSummary) -> Result<bool> {
        let mode = self.config.mode;
        let provisioner = self.provisioner.clone();
        let (r, id) = (role.to_string(), task.id.clone());
        let provisioned = util::blocking_with_timeout(PROVISION_TIMEOUT, move || provisioner.provision(&r, &id, mode));
        let workspace = match provisioned.await {
            Ok(ws) => ws,
            Err(e) => {
                self.spawn_failed(&mut task, &e, summary)?;
                return Ok(false);
            }
        };

        task.assign(role, workspace.path.clone(), workspace.branch.clone(), workspace.workspace_type);
        let invocation = WorkerInvocation {
            task_id: task.id.clone(),
            run_id: new_run_id(),
            role: role.to_string(),
            phase: Phase::Apply,
            workspace: workspace.path,
            mode,
        };
        let mut handle = match self.launcher.launch(&invocation) {
            Ok(handle) => handle,
            Err(e) => {
                self.spawn_failed(&mut task, &e, summary)?;
                return Ok(false);
            }
        };

        task.start(Phase::Apply);
        if let Err(e) = self.store.save(&mut task) {
            handle.kill();
            return Err(e);
        }
        info!(
            task_id = %task.id,
            role,
            run_id = %invocation.run_id,
            workspace = %invocation.workspace.display(),
            "task dispatched"
        );
        self.track(invocation.clone(), handle);
        summary.dispatched += 1;
        self.emit(SchedulerEvent::TaskStarted {
            task_id: invocation.task_id,
            role: invocation.role,
            run_id: invocation.run_id,
        });
        Ok(true)
    }

    fn track(&mut self, inv: WorkerInvocation, handle: WorkerHandle) {
        self.pool.insert(
            &inv.task_id,
            ActiveWorker {
                handle,
                run_id: inv.run_id,
                phase: inv.phase,
                role: inv.role,
                workspace: inv.workspace,
                mode: inv.mode,
            },
        );
    }

    /// Provisioning or launch failed: back to the queue, no retry consumed.
    fn spawn_failed(&self, task: &mut Task, err: &Error, summary: &mut TickSummary) -> Result<()> {
        error!(task_id = %task.id, error = %err, "failed to start worker, requeueing");
        task.requeue();
        self.store.save(task)?;
        self.store.enqueue(&task.id)?;
        summary.requeued += 1;
        self.emit(SchedulerEvent::TaskRequeued {
            task_id: task.id.clone(),
            reason: err.to_string(),
        });
        Ok(())
    }

    fn monitor_active(&mut self, summary: &mut TickSummary) -> Result<()> {
        let mut first_err = None;
        for (task_id, worker, exit) in self.pool.poll_finished() {
            if let Err(e) = self.on_worker_exit(&task_id, worker, exit, summary) {
                error!(%task_id, error = %e, "handling worker exit failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_worker_exit(
        &mut self,
        task_id: &str,
        worker: ActiveWorker,
        exit: WorkerExit,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let record = self.store.load_result(task_id, &worker.run_id)?;
        let Some(mut task) = self.store.get(task_id)? else {
            warn!(task_id, "finished worker's task has no record");
            return Ok(());
        };
        if task.status.is_terminal() {
            warn!(task_id, status = %task.status, "ignoring worker exit for finished task");
            return Ok(());
        }
        debug!(
            task_id,
            phase = %worker.phase,
            run_id = %worker.run_id,
            ?exit,
            result = ?record.as_ref().map(|r| r.status),
            "worker finished"
        );

        let succeeded = exit == WorkerExit::Code(0) && record.as_ref().is_some_and(|r| r.is_success());
        match (succeeded, worker.phase) {
            (true, Phase::Test) => {
                task.complete();
                self.store.save(&mut task)?;
                self.store.remove_from_queue(&[task.id.clone()])?;
                info!(task_id, "task completed");
                summary.completed += 1;
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                });
            }
            (true, _) => self.start_test(task, &worker, summary)?,
            (false, _) => self.phase_failed(task, &worker, exit, record.as_ref(), summary)?,
        }
        Ok(())
    }

    /// Apply succeeded: run `test` in the same workspace, skipping the
    /// dependency and capacity checks.
    fn start_test(&mut self, mut task: Task, worker: &ActiveWorker, summary: &mut TickSummary) -> Result<()> {
        let invocation = WorkerInvocation {
            task_id: task.id.clone(),
            run_id: new_run_id(),
            role: worker.role.clone(),
            phase: Phase::Test,
            workspace: worker.workspace.clone(),
            mode: worker.mode,
        };
        let mut handle = match self.launcher.launch(&invocation) {
            Ok(handle) => handle,
            Err(e) => return self.spawn_failed(&mut task, &e, summary),
        };
        task.start(Phase::Test);
        if let Err(e) = self.store.save(&mut task) {
            handle.kill();
            return Err(e);
        }
        info!(task_id = %task.id, run_id = %invocation.run_id, "test phase started");
        self.track(invocation.clone(), handle);
        summary.phases_started += 1;
        self.emit(SchedulerEvent::PhaseStarted {
            task_id: invocation.task_id,
            phase: Phase::Test,
            run_id: invocation.run_id,
        });
        Ok(())
    }

    fn phase_failed(
        &mut self,
        mut task: Task,
        worker: &ActiveWorker,
        exit: WorkerExit,
        record: Option<&ResultRecord>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let reason = failure_reason(worker.phase, exit, record);
        let task_id = task.id.clone();
        match self.policy.on_failure(&task) {
            FailureAction::Retry => {
                task.retry(&reason);
                self.store.save(&mut task)?;
                self.store.enqueue(&task_id)?;
                warn!(%task_id, retry = task.retry_count, %reason, "phase failed, retrying");
                summary.retried += 1;
                self.emit(SchedulerEvent::TaskRetried {
                    task_id,
                    retry_count: task.retry_count,
                    reason,
                });
            }
            FailureAction::GiveUp => {
                let blocked = record.is_some_and(|r| r.status == ResultStatus::Blocked);
                if blocked {
                    task.block(&reason);
                } else {
                    task.fail(&reason);
                }
                self.store.save(&mut task)?;
                self.store.remove_from_queue(&[task_id.clone()])?;
                error!(%task_id, status = %task.status, retries = task.retry_count, %reason, "task gave up");
                if blocked {
                    summary.blocked += 1;
                    self.emit(SchedulerEvent::TaskBlocked { task_id, reason });
                } else {
                    summary.failed += 1;
                    self.emit(SchedulerEvent::TaskFailed { task_id, reason });
                }
            }
        }
        Ok(())
    }

    fn recover_zombies(&mut self, summary: &mut TickSummary) -> Result<()> {
        let now = Utc::now();
        for mut task in self.store.list_all()? {
            if !self.policy.is_zombie(&task, self.pool.contains(&task.id), now) {
                continue;
            }
            info!(
                task_id = %task.id,
                status = %task.status,
                started_at = ?task.started_at,
                "recovering zombie task"
            );
            task.requeue();
            self.store.save(&mut task)?;
            self.store.enqueue(&task.id)?;
            summary.recovered += 1;
            self.emit(SchedulerEvent::ZombieRecovered { task_id: task.id });
        }
        Ok(())
    }
}

fn failure_reason(phase: Phase, exit: WorkerExit, record: Option<&ResultRecord>) -> String {
    match (record, exit) {
        (_, WorkerExit::Signaled) => format!("{phase} aborted: {}", exit.describe()),
        (Some(r), _) if !r.notes.trim().is_empty() => {
            format!("{phase} {}: {}", r.status, r.notes.trim())
        }
        (Some(r), _) => format!("{phase} {}: {}", r.status, exit.describe()),
        (None, _) => format!("{phase} failed: {} without a result record", exit.describe()),
    }
}
