//! Cross-process advisory file locking behind a small, synchronous primitive (§9 design
//! note: "use the platform's advisory file-locking primitive behind a cross-platform
//! trait"). [`fs4`] wraps POSIX `flock` / Windows `LockFileEx` with one portable API; we
//! add the retry-with-backoff protocol from §4.1 on top since neither platform primitive
//! accepts a timeout directly.
//!
//! Acquisition blocks the calling thread (sleeping between retries); callers run it on a
//! `spawn_blocking` thread rather than an async task.

use fs4::fs_std::FileExt;
use rand::Rng as _;
use std::fs::File;
use std::time::Duration;

use crate::error::HuddleError;

/// §4.1 Append protocol constants.
pub const LOCK_MAX_ATTEMPTS: u32 = 20;
pub const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(50);
pub const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(500);
pub const LOCK_JITTER_MAX_MS: u64 = 30;

/// Acquires an exclusive advisory lock on `file`, retrying with exponential backoff and
/// jitter up to [`LOCK_MAX_ATTEMPTS`] times. Returns [`HuddleError::LockBusy`] after
/// exhaustion; never blocks indefinitely.
pub fn acquire_exclusive(file: &File) -> Result<(), HuddleError> {
    let mut attempt: u32 = 0;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(_busy) => {
                attempt += 1;
                if attempt >= LOCK_MAX_ATTEMPTS {
                    return Err(HuddleError::LockBusy(format!(
                        "could not acquire lock after {attempt} attempts"
                    )));
                }
                let backoff = LOCK_BACKOFF_BASE
                    .saturating_mul(1u32 << attempt.min(5))
                    .min(LOCK_BACKOFF_MAX);
                let jitter_ms = rand::thread_rng().gen_range(0..=LOCK_JITTER_MAX_MS);
                std::thread::sleep(backoff + Duration::from_millis(jitter_ms));
            }
        }
    }
}

/// Releases a lock taken via [`acquire_exclusive`]. Best-effort: the OS also releases the
/// lock when the file descriptor is dropped, so callers don't have to call this on every
/// path as long as the `File` is dropped promptly.
pub fn release(file: &File) {
    let _ = FileExt::unlock(file);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    /// **Scenario**: a single process can acquire and release a lock repeatedly.
    #[test]
    fn acquire_then_release_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();

        acquire_exclusive(&file).unwrap();
        release(&file);
        acquire_exclusive(&file).unwrap();
        release(&file);
    }
}
