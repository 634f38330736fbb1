//! TaskStore - durable task records, queue index and result records.
//!
//! Layout under the store root:
//!
//! ```text
//! tasks/<task_id>.json             one record per task
//! tasks/_queue.json                queue index
//! results/<task_id>__<run_id>.json immutable result records
//! logs/<task_id>__<run_id>.log     worker output
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::atomic::write_atomic;
use crate::core::{slug, validate_task_id, ResultRecord, Task};
use crate::{Error, Result};

const QUEUE_FILE: &str = "_queue.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueIndex {
    tasks: Vec<String>,
    updated_at: DateTime<Utc>,
}

/// File-backed store. Cheap to clone; holds only paths.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Open a store rooted at `root`, creating its directories.
    pub fn open(root: &Path) -> Result<Self> {
        debug!(root = %root.display(), "TaskStore::open");
        let store = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.tasks_dir())?;
        fs::create_dir_all(store.results_dir())?;
        fs::create_dir_all(store.logs_dir())?;
        Ok(store)
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    fn task_path(&self, task_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.tasks_dir().join(format!("{task_id}.json")))
    }

    fn queue_path(&self) -> PathBuf {
        self.tasks_dir().join(QUEUE_FILE)
    }

    fn result_path(&self, task_id: &str, run_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.results_dir().join(format!("{task_id}__{run_id}.json")))
    }

    /// Where a worker run's stdout/stderr is captured.
    pub fn log_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{task_id}__{run_id}.log"))
    }

    pub fn load(&self, task_id: &str) -> Result<Task> {
        let path = self.task_path(task_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::TaskNotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Like `load`, mapping a missing task to `None`.
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        match self.load(task_id) {
            Ok(task) => Ok(Some(task)),
            Err(Error::TaskNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist the full record, stamping `updated_at`.
    pub fn save(&self, task: &mut Task) -> Result<()> {
        let path = self.task_path(&task.id)?;
        task.updated_at = Utc::now();
        let contents = serde_json::to_vec_pretty(task)?;
        write_atomic(&path, &contents)?;
        debug!(task_id = %task.id, status = %task.status, "task saved");
        Ok(())
    }

    /// Add a new task and append it to the queue.
    ///
    /// Ids that slug to an existing task's slug are rejected: the two would
    /// share a workspace directory and branch.
    pub fn create(&self, task: &mut Task) -> Result<()> {
        let path = self.task_path(&task.id)?;
        if path.exists() {
            return Err(Error::TaskExists(task.id.clone()));
        }
        let wanted = slug(&task.id);
        if let Some(other) = self.list_all()?.into_iter().find(|t| slug(&t.id) == wanted) {
            return Err(Error::Validation(format!(
                "task id {} collides with {} (both map to {wanted})",
                task.id, other.id
            )));
        }
        self.save(task)?;
        self.enqueue(&task.id)?;
        Ok(())
    }

    /// All task records, sorted by id. The queue index is not a task.
    pub fn list_all(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(self.tasks_dir())? {
            let path = entry?.path();
            let is_json = path.extension().is_some_and(|e| e == "json");
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !is_json || name == QUEUE_FILE || name.starts_with('.') {
                continue;
            }
            match fs::read_to_string(&path).map(|c| serde_json::from_str::<Task>(&c)) {
                Ok(Ok(task)) => tasks.push(task),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task file"),
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    pub fn load_queue(&self) -> Result<Vec<String>> {
        match fs::read_to_string(self.queue_path()) {
            Ok(contents) => Ok(serde_json::from_str::<QueueIndex>(&contents)?.tasks),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_queue(&self, queue: &[String]) -> Result<()> {
        let index = QueueIndex {
            tasks: queue.to_vec(),
            updated_at: Utc::now(),
        };
        write_atomic(&self.queue_path(), &serde_json::to_vec_pretty(&index)?)
    }

    /// Append to the queue unless already present.
    pub fn enqueue(&self, task_id: &str) -> Result<()> {
        let mut queue = self.load_queue()?;
        if !queue.iter().any(|id| id == task_id) {
            queue.push(task_id.to_string());
            self.save_queue(&queue)?;
        }
        Ok(())
    }

    /// Drop ids from the queue, keeping the order of everything else.
    pub fn remove_from_queue(&self, task_ids: &[String]) -> Result<()> {
        let queue = self.load_queue()?;
        let kept: Vec<String> = queue
            .iter()
            .filter(|id| !task_ids.contains(id))
            .cloned()
            .collect();
        if kept.len() != queue.len() {
            self.save_queue(&kept)?;
        }
        Ok(())
    }

    /// Write a result record. Never overwrites an existing record.
    pub fn write_result(&self, record: &ResultRecord) -> Result<PathBuf> {
        let path = self.result_path(&record.task_id, &record.run_id)?;
        let contents = serde_json::to_vec_pretty(record)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::ResultExists(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&contents)?;
        file.sync_all()?;
        debug!(task_id = %record.task_id, run_id = %record.run_id, "result record written");
        Ok(path)
    }

    pub fn load_result(&self, task_id: &str, run_id: &str) -> Result<Option<ResultRecord>> {
        let path = self.result_path(task_id, run_id)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every result record for a task, oldest first.
    pub fn results_for(&self, task_id: &str) -> Result<Vec<ResultRecord>> {
        validate_task_id(task_id)?;
        let prefix = format!("{task_id}__");
        let mut records = Vec::new();
        for entry in fs::read_dir(self.results_dir())? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"));
            if !matches {
                continue;
            }
            match serde_json::from_str::<ResultRecord>(&fs::read_to_string(&path)?) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable result"),
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.run_id.cmp(&b.run_id)));
        Ok(records)
    }

    pub fn latest_result(&self, task_id: &str) -> Result<Option<ResultRecord>> {
        Ok(self.results_for(task_id)?.pop())
    }
}
