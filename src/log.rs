//! Structured logging for kiln.
//!
//! Log levels:
//! - ERROR: orchestration failures (store I/O, worker spawn)
//! - WARN: recoverable surprises (missing tasks, rename fallback, isolation check)
//! - INFO: task lifecycle (dispatch, phase results, retries, zombie recovery)
//! - DEBUG: per-cycle traces, tool stream details
//!
//! Debug mode can be enabled with `--debug` or `KILN_DEBUG=1`. `KILN_LOG`
//! accepts a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::Result;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that switches on debug mode.
pub const DEBUG_ENV: &str = "KILN_DEBUG";

/// Environment variable holding an explicit filter directive.
pub const FILTER_ENV: &str = "KILN_LOG";

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn build_filter(debug: bool) -> EnvFilter {
    let fallback = if debug { "kiln=debug" } else { "kiln=info" };
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Resolve debug mode from the CLI flag and the environment.
fn resolve_debug(flag: bool) -> bool {
    let enabled = flag || env_debug();
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    enabled
}

/// Initialize logging to a file, truncating it on startup.
///
/// Used by the long-running scheduler.
pub fn init_file(path: &Path, debug: bool) -> Result<()> {
    let debug = resolve_debug(debug);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(debug))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

/// Initialize logging to stderr.
///
/// Workers log here; the launcher redirects stderr into the per-run log.
pub fn init_stderr(debug: bool) {
    let debug = resolve_debug(debug);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(debug))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}
