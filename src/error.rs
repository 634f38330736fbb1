use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Result record already exists: {0}")]
    ResultExists(String),

    #[error("Workspace provisioning failed: {0}")]
    Provision(String),

    #[error("Code-generation tool not found (set KILN_TOOL_PATH)")]
    ToolNotFound,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
