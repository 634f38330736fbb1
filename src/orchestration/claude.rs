//! Claude Code headless executor.
//!
//! Runs the code-generation tool non-interactively (`-p`) with
//! `--output-format stream-json`, reading its stdout as newline-delimited
//! JSON messages while the process runs. Two completion signals are tracked
//! independently: an explicit `result` message and the process exit code.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// Default timeout for one tool run (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Time between SIGTERM and a forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const STDERR_TAIL_BYTES: usize = 4 * 1024;
const STDERR_DRAIN_WAIT: Duration = Duration::from_secs(2);

/// One structured message on the tool's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Assistant {
        message: AssistantMessage,
    },
    /// Tool-result echoes.
    User {
        #[serde(default)]
        message: serde_json::Value,
    },
    /// Explicit completion.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// What a tool invocation asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAction {
    Command(String),
    FileRead(String),
    FileWrite(String),
    Other(String),
}

impl ToolAction {
    pub fn from_tool_use(name: &str, input: &serde_json::Value) -> Self {
        let field = |key: &str| {
            input
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match name {
            "Bash" => ToolAction::Command(field("command")),
            "Read" => ToolAction::FileRead(field("file_path")),
            "Write" | "Edit" | "MultiEdit" => ToolAction::FileWrite(field("file_path")),
            "NotebookEdit" => ToolAction::FileWrite(field("notebook_path")),
            other => ToolAction::Other(other.to_string()),
        }
    }
}

/// Running tally of a tool's output stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub line_count: usize,
    pub result_seen: bool,
    pub result_is_error: bool,
    pub result_text: Option<String>,
    pub last_text: Option<String>,
    pub actions: Vec<ToolAction>,
    pub tool_results: usize,
    pub opaque_lines: usize,
}

impl StreamSummary {
    /// Fold one stdout line into the summary.
    pub fn observe(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.line_count += 1;
        let message = match serde_json::from_str::<StreamMessage>(line) {
            Ok(m) => m,
            Err(_) => {
                trace!(line, "opaque tool output");
                self.opaque_lines += 1;
                return;
            }
        };
        match message {
            StreamMessage::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.last_text = Some(text),
                        ContentBlock::ToolUse { name, input } => {
                            let action = ToolAction::from_tool_use(&name, &input);
                            debug!(?action, "tool invocation");
                            self.actions.push(action);
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamMessage::User { .. } => self.tool_results += 1,
            StreamMessage::Result {
                subtype,
                is_error,
                result,
                num_turns,
                total_cost_usd,
            } => {
                debug!(?subtype, is_error, ?num_turns, ?total_cost_usd, "tool result message");
                self.result_seen = true;
                self.result_is_error = is_error || subtype.as_deref().is_some_and(|s| s.starts_with("error"));
                self.result_text = result;
            }
            StreamMessage::System { .. } => {}
            StreamMessage::Unknown => self.opaque_lines += 1,
        }
    }

    /// Final text worth reporting: the result message, else the last assistant text.
    pub fn final_text(&self) -> Option<&str> {
        self.result_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.last_text.as_deref())
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub summary: StreamSummary,
    pub stderr_tail: String,
}

/// Claude Code headless executor.
#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    /// Path to the Claude binary.
    binary: PathBuf,
    /// Extra arguments appended after the output-format flags.
    extra_args: Vec<String>,
    /// Timeout for execution.
    timeout: Duration,
}

impl ClaudeHeadless {
    /// Create a ClaudeHeadless executor with a specific binary path.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            extra_args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Set a custom timeout for execution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Get the timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, prompt: &str, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .args(&self.extra_args)
            .current_dir(cwd)
            .env("PWD", cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keep git discovery from walking above the workspace.
        if let Some(parent) = cwd.parent() {
            cmd.env("GIT_CEILING_DIRECTORIES", parent);
        }
        cmd
    }

    /// Run the tool with `prompt` inside `cwd` and consume its output stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or its stdout cannot
    /// be read. A timeout is not an error; it is reported in `ToolRun`.
    pub async fn execute(&self, prompt: &str, cwd: &Path) -> Result<ToolRun> {
        let mut child = self
            .command(prompt, cwd)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.binary.display())))?;
        debug!(pid = ?child.id(), cwd = %cwd.display(), "tool started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("stdout was not piped".to_string()))?;
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        let mut summary = StreamSummary::default();
        let outcome = tokio::time::timeout(self.timeout, async {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                summary.observe(&String::from_utf8_lossy(&buf));
            }
            child.wait().await
        })
        .await;

        let (exit_code, timed_out) = match outcome {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "tool timed out, terminating");
                terminate(&mut child, TERMINATE_GRACE).await;
                (None, true)
            }
        };

        let stderr_tail = match stderr_task {
            // Grandchildren can hold stderr open after a kill.
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_WAIT, task).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };
        debug!(?exit_code, timed_out, lines = summary.line_count, "tool finished");
        Ok(ToolRun {
            exit_code,
            timed_out,
            summary,
            stderr_tail,
        })
    }
}

/// SIGTERM first, then a forced kill once `grace` runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_sigterm(pid).await;
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("tool ignored SIGTERM, killing");
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
async fn send_sigterm(pid: u32) {
    let _ = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

#[cfg(not(unix))]
async fn send_sigterm(_pid: u32) {}

/// Drain a pipe, keeping only the last few KiB.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
