//! File-backed, owner-tagged, TTL-bounded locks for change directories.
//!
//! The lock is the file `<change-dir>/.lock` holding a small JSON body:
//! `{ "owner": …, "since": epoch-millis, "ttl": seconds }`. A lock is live
//! while `now < since + ttl*1000`. Acquisition never blocks: it either
//! succeeds, scavenges a stale file and retries once, or reports the live
//! holder. The lock file is the sole serialising resource for writers of a
//! slug; readers stay lock-free.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tmcp_error::{ErrorCode, TaskError};
use tracing::{info, warn};

/// Name of the lock file inside a change directory.
pub const LOCK_FILE: &str = ".lock";

/// Monotonic nonce distinguishing temp files within one process.
static TMP_NONCE: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// LockInfo
// ---------------------------------------------------------------------------

/// On-disk body of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Caller-supplied holder identity (e.g. `pid-42@host`).
    pub owner: String,
    /// Acquisition instant, milliseconds since the Unix epoch.
    pub since: i64,
    /// Time-to-live in seconds.
    pub ttl: u64,
}

impl LockInfo {
    /// A lock is live while `now < since + ttl*1000`.
    pub fn is_live_at(&self, now_millis: i64) -> bool {
        now_millis < self.since.saturating_add((self.ttl as i64).saturating_mul(1000))
    }

    /// Liveness against the current clock.
    pub fn is_live(&self) -> bool {
        self.is_live_at(now_millis())
    }

    /// Whole seconds until expiry (0 when already expired).
    pub fn remaining_seconds(&self) -> u64 {
        let expiry = self.since.saturating_add((self.ttl as i64).saturating_mul(1000));
        let left = expiry.saturating_sub(now_millis());
        if left <= 0 { 0 } else { ((left + 999) / 1000) as u64 }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// LockHandle
// ---------------------------------------------------------------------------

/// Proof of a successful acquisition, consumed by [`release`].
///
/// Dropping a handle does **not** release the lock; the file either gets
/// released explicitly or lapses by TTL. That keeps crash semantics honest:
/// a dead holder's lock is scavenged, not silently cleaned.
#[derive(Debug, Clone)]
pub struct LockHandle {
    lock_path: PathBuf,
    info: LockInfo,
    /// True when acquisition passed through an existing same-owner lock.
    pub reentrant: bool,
}

impl LockHandle {
    /// Path of the lock file this handle refers to.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// The lock body this handle was acquired with.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// The holder identity.
    pub fn owner(&self) -> &str {
        &self.info.owner
    }
}

// ---------------------------------------------------------------------------
// Acquisition / release
// ---------------------------------------------------------------------------

/// Acquire the lock for `change_dir`, refusing any live lock.
///
/// Stale locks are scavenged and acquisition retried once, automatically.
///
/// # Errors
///
/// `ELOCKED` with holder and remaining TTL when a live lock exists (same
/// owner included), `ELOCK_STALE_REMOVED` when the scavenging retry lost the
/// race, `EIO` for filesystem failures.
pub fn acquire(change_dir: &Path, owner: &str, ttl_seconds: u64) -> Result<LockHandle, TaskError> {
    acquire_inner(change_dir, owner, ttl_seconds, false)
}

/// Acquire the lock for `change_dir`, passing through a live lock whose
/// owner equals `owner`.
///
/// This is the archive engine's mode: archive ignores its own owner's lock.
///
/// # Errors
///
/// As [`acquire`], except a same-owner live lock yields a reentrant handle.
pub fn acquire_reentrant(
    change_dir: &Path,
    owner: &str,
    ttl_seconds: u64,
) -> Result<LockHandle, TaskError> {
    acquire_inner(change_dir, owner, ttl_seconds, true)
}

fn acquire_inner(
    change_dir: &Path,
    owner: &str,
    ttl_seconds: u64,
    reenter_same_owner: bool,
) -> Result<LockHandle, TaskError> {
    let lock_path = change_dir.join(LOCK_FILE);
    let mut scavenged = false;

    // One automatic retry after a stale scavenge; never spin beyond that.
    for _attempt in 0..2 {
        match read(change_dir) {
            Some(existing) if existing.is_live() => {
                if reenter_same_owner && existing.owner == owner {
                    return Ok(LockHandle {
                        lock_path,
                        info: existing,
                        reentrant: true,
                    });
                }
                return Err(locked_error(&existing));
            }
            Some(stale) => {
                info!(
                    owner = %stale.owner,
                    path = %lock_path.display(),
                    "scavenging expired lock"
                );
                match fs::remove_file(&lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(TaskError::io(
                            format!("cannot scavenge stale lock {}", lock_path.display()),
                            e,
                        ));
                    }
                }
                scavenged = true;
                continue;
            }
            None => {
                let info = LockInfo {
                    owner: owner.to_string(),
                    since: now_millis(),
                    ttl: ttl_seconds,
                };
                write_lock_file(&lock_path, &info)?;
                return Ok(LockHandle {
                    lock_path,
                    info,
                    reentrant: false,
                });
            }
        }
    }

    // Both attempts found a removable file: someone keeps racing us.
    debug_assert!(scavenged);
    Err(TaskError::new(
        ErrorCode::LockStaleRemoved,
        format!(
            "scavenged a stale lock at {} but lost the re-acquisition race",
            lock_path.display()
        ),
    )
    .with_hint("retry the operation"))
}

/// Release a previously acquired lock. Idempotent.
///
/// The file is removed only while it still records the handle's owner; a
/// lock re-acquired by someone else after TTL lapse is left untouched.
///
/// # Errors
///
/// `EIO` when the lock file exists but cannot be removed.
pub fn release(handle: &LockHandle) -> Result<(), TaskError> {
    match read_raw(handle.path()) {
        Some(info) if info.owner == handle.owner() => {
            match fs::remove_file(handle.path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(TaskError::io(
                    format!("cannot release lock {}", handle.path().display()),
                    e,
                )),
            }
        }
        _ => Ok(()),
    }
}

/// Read the lock body for `change_dir`, if a parseable lock file exists.
///
/// Corrupt lock files are reported as stale (`since: 0, ttl: 0`) so the
/// scavenger reclaims them instead of wedging the slug forever.
pub fn read(change_dir: &Path) -> Option<LockInfo> {
    let path = change_dir.join(LOCK_FILE);
    let bytes = fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt lock file treated as stale");
            Some(LockInfo {
                owner: "<corrupt>".to_string(),
                since: 0,
                ttl: 0,
            })
        }
    }
}

/// Lock-free liveness probe used by the listing engine.
pub fn is_locked(change_dir: &Path) -> bool {
    read(change_dir).is_some_and(|info| info.is_live())
}

fn read_raw(lock_path: &Path) -> Option<LockInfo> {
    let bytes = fs::read(lock_path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn locked_error(existing: &LockInfo) -> TaskError {
    TaskError::new(
        ErrorCode::Locked,
        format!("change is locked by {}", existing.owner),
    )
    .with_hint(format!(
        "held by {}; retry in {}s or wait for TTL lapse",
        existing.owner,
        existing.remaining_seconds()
    ))
    .with_context("holder", &existing.owner)
    .with_context("remainingSeconds", existing.remaining_seconds())
}

/// Exclusive-create a temp sibling, fsync, rename over the lock path.
fn write_lock_file(lock_path: &Path, info: &LockInfo) -> Result<(), TaskError> {
    let parent = lock_path
        .parent()
        .ok_or_else(|| TaskError::internal("lock path has no parent"))?;
    fs::create_dir_all(parent)
        .map_err(|e| TaskError::io(format!("cannot create {}", parent.display()), e))?;

    let nonce = TMP_NONCE.fetch_add(1, Ordering::Relaxed);
    let tmp = parent.join(format!(".lock.tmp-{}-{nonce}", std::process::id()));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .map_err(|e| TaskError::io(format!("cannot create {}", tmp.display()), e))?;
    let body = serde_json::to_vec(info)
        .map_err(|e| TaskError::internal(format!("cannot encode lock body: {e}")))?;
    let result = file
        .write_all(&body)
        .and_then(|()| file.sync_all())
        .and_then(|()| fs::rename(&tmp, lock_path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TaskError::io(
            format!("cannot write lock {}", lock_path.display()),
            e,
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
