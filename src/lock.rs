//! Single-controller lease over the configuration root.
//!
//! The lock is a pidfile created with `create_new`, so acquisition is atomic.
//! A conflicting holder is probed for liveness (signal 0 plus a process
//! start-time cross-check against PID reuse); a dead holder's record is
//! reclaimed immediately, a live one means we back off and eventually fail
//! fatally. Running two controllers against one config root has no safe
//! degraded mode.

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::errors::{ControllerError, Result};

/// Proof of ownership. Exactly one valid, live token exists for a lock path.
#[derive(Debug)]
pub struct LockToken {
    pub path: PathBuf,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct LockRecord {
    pid: u32,
    start_time: Option<u64>,
}

fn parse_record(content: &str) -> Option<LockRecord> {
    let mut parts = content.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let start_time = parts.next().and_then(|s| s.parse().ok());
    Some(LockRecord { pid, start_time })
}

/// Unix start time of a process, used to tell a live holder apart from an
/// unrelated process that reused its PID.
fn process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        false,
        ProcessRefreshKind::nothing(),
    );
    sys.process(sysinfo_pid).map(|p| p.start_time())
}

/// Whether the recorded holder is still a live process.
fn holder_alive(record: &LockRecord) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid as NixPid;

        if kill(NixPid::from_raw(record.pid as i32), None).is_err() {
            return false;
        }
        // PID exists; reject it if the start time says it's a different
        // process than the one that wrote the record.
        match (record.start_time, process_start_time(record.pid)) {
            (Some(recorded), Some(actual)) => recorded.abs_diff(actual) <= 1,
            _ => true,
        }
    }
    #[cfg(not(unix))]
    {
        process_start_time(record.pid).is_some()
    }
}

/// Acquire the controller lock at `path` for the process `holder_pid`.
///
/// On conflict with a live holder, backs off and retries up to `retries`
/// times, then fails with `ControllerError::Lock`. A stale record (holder no
/// longer alive) is removed and the attempt repeats immediately.
pub async fn acquire(
    path: &Path,
    holder_pid: u32,
    retries: u32,
    backoff: Duration,
) -> Result<LockToken> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let start_time = process_start_time(holder_pid);
    let mut attempts = 0u32;

    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let acquired_at = Utc::now();
                writeln!(
                    file,
                    "{} {} {}",
                    holder_pid,
                    start_time.unwrap_or(0),
                    acquired_at.to_rfc3339()
                )?;
                info!("Acquired controller lock at {} (pid {})", path.display(), holder_pid);
                return Ok(LockToken {
                    path: path.to_path_buf(),
                    holder_pid,
                    acquired_at,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let content = std::fs::read_to_string(path).unwrap_or_default();
                match parse_record(&content) {
                    Some(record) if holder_alive(&record) => {
                        attempts += 1;
                        if attempts > retries {
                            return Err(ControllerError::Lock {
                                path: path.to_path_buf(),
                                reason: format!(
                                    "held by live process {} after {} attempts",
                                    record.pid, attempts
                                ),
                            });
                        }
                        debug!(
                            "Lock at {} held by live process {}, retrying in {:?} ({}/{})",
                            path.display(),
                            record.pid,
                            backoff,
                            attempts,
                            retries
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Some(record) => {
                        warn!(
                            "Removing stale lock at {} (holder {} is not alive)",
                            path.display(),
                            record.pid
                        );
                        let _ = std::fs::remove_file(path);
                    }
                    None => {
                        warn!(
                            "Removing unreadable lock record at {}",
                            path.display()
                        );
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Release the lock, but only if the record still names this holder. A record
/// reclaimed by some other process in the meantime is left alone.
pub fn release(token: &LockToken) -> Result<()> {
    let content = std::fs::read_to_string(&token.path).unwrap_or_default();
    match parse_record(&content) {
        Some(record) if record.pid == token.holder_pid => {
            std::fs::remove_file(&token.path)?;
            info!("Released controller lock at {}", token.path.display());
            Ok(())
        }
        Some(record) => {
            warn!(
                "Not releasing lock at {}: record names pid {} instead of {}",
                token.path.display(),
                record.pid,
                token.holder_pid
            );
            Ok(())
        }
        None => {
            debug!("Lock at {} already gone", token.path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests;
