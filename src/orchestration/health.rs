//! Failure and liveness policy for tasks.
//!
//! `RecoveryPolicy` decides what happens after a phase fails (retry or give
//! up) and which persisted tasks are zombies: marked running but owned by no
//! worker the scheduler knows about.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{Config, DEFAULT_MAX_RETRIES, DEFAULT_ZOMBIE_THRESHOLD_SECS};
use crate::core::{Task, TaskStatus};

/// What to do with a task whose phase just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Requeue, consuming one retry.
    Retry,
    /// Retries exhausted; the task becomes terminal.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Age after which an untracked running task is reclaimed.
    pub zombie_threshold: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            zombie_threshold: Duration::from_secs(DEFAULT_ZOMBIE_THRESHOLD_SECS),
        }
    }
}

impl RecoveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            zombie_threshold: config.zombie_threshold(),
        }
    }

    pub fn on_failure(&self, task: &Task) -> FailureAction {
        if task.retry_count < self.max_retries {
            FailureAction::Retry
        } else {
            FailureAction::GiveUp
        }
    }

    /// True if `task` claims to be running, is not `tracked` by the pool, and
    /// its start (or assignment) is older than the threshold or unknown.
    pub fn is_zombie(&self, task: &Task, tracked: bool, now: DateTime<Utc>) -> bool {
        if tracked || !matches!(task.status, TaskStatus::InProgress | TaskStatus::Assigned) {
            return false;
        }
        let Some(since) = task.started_at.or(task.assigned_at) else {
            return true;
        };
        match (now - since).to_std() {
            Ok(age) => age > self.zombie_threshold,
            // Start time in the future: clock skew, not stale.
            Err(_) => false,
        }
    }
}
