//! Write-replace primitive used for every persisted record.
//!
//! Contents go to a uniquely named temp file in the target's directory and
//! are renamed over the target, so readers see either the old or the new
//! record. Renames that fail (some platforms refuse while another handle has
//! the target open) are retried with linear backoff; when every attempt
//! fails the bytes are written directly to the target. That last step is a
//! degradation, not part of the atomicity guarantee.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;

pub const RENAME_ATTEMPTS: u32 = 5;
pub const RENAME_BACKOFF: Duration = Duration::from_millis(10);

/// Path of the temp file used while replacing `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let unique = uuid::Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{}.{}.tmp", name, &unique[..12]))
}

/// Write `temp` fully and flush it to disk.
pub fn write_temp(temp: &Path, contents: &[u8]) -> Result<()> {
    write_temp_with(temp, contents, |file, bytes| {
        file.write_all(bytes)?;
        file.sync_all()
    })
}

/// `write_temp` with an injectable fill step. A temp file left partial by a
/// failed fill is removed before the error is returned.
pub fn write_temp_with<F>(temp: &Path, contents: &[u8], fill: F) -> Result<()>
where
    F: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
{
    let mut file = File::create(temp)?;
    if let Err(e) = fill(&mut file, contents) {
        drop(file);
        if let Err(rm) = fs::remove_file(temp) {
            warn!(path = %temp.display(), error = %rm, "could not remove partial temp file");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Replace `target` with `contents` atomically where the platform allows.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_with(target, contents, |from, to| fs::rename(from, to))
}

/// `write_atomic` with an injectable rename, so tests can simulate contention.
pub fn write_atomic_with<R>(target: &Path, contents: &[u8], mut rename: R) -> Result<()>
where
    R: FnMut(&Path, &Path) -> std::io::Result<()>,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path_for(target);
    write_temp(&temp, contents)?;

    let mut last_err = None;
    for attempt in 1..=RENAME_ATTEMPTS {
        match rename(&temp, target) {
            Ok(()) => {
                if attempt > 1 {
                    debug!(path = %target.display(), attempt, "rename succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => {
                last_err = Some(e);
                if attempt < RENAME_ATTEMPTS {
                    thread::sleep(RENAME_BACKOFF * attempt);
                }
            }
        }
    }

    warn!(
        path = %target.display(),
        error = ?last_err,
        "atomic rename kept failing, falling back to direct write"
    );
    let _ = fs::remove_file(&temp);
    fs::write(target, contents)?;
    Ok(())
}
