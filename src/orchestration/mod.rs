//! Orchestration layer.
//!
//! The scheduler dispatches queued tasks to worker processes and advances
//! them through `apply` and `test`. Each worker drives the Claude tool in
//! headless stream-json mode for one phase and reports a result record.

mod claude;
mod health;
mod pool;
mod prompt;
mod scheduler;
mod worker;

pub use claude::{
    ClaudeHeadless, StreamMessage, StreamSummary, ToolAction, ToolRun, DEFAULT_TIMEOUT_SECS,
};
pub use health::{FailureAction, RecoveryPolicy};
pub use pool::{
    ActiveWorker, ProcessLauncher, WorkerExit, WorkerHandle, WorkerInvocation, WorkerLauncher,
    WorkerPool,
};
pub use prompt::{build_instruction, ContextSummary};
pub use scheduler::{Scheduler, SchedulerEvent, TickSummary};
pub use worker::{reconcile, PhaseRequest, PhaseRunner};
