//! Core data types: tasks and result records.

pub mod result;
pub mod task;

pub use result::{new_run_id, FileChanges, ResultRecord, ResultStatus};
pub use task::{slug, validate_task_id, Phase, Task, TaskStatus, WorkspaceMode, WorkspaceType};
