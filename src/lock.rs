//! Cooperative, file-based exclusive/shared locking over a backup directory.
//!
//! Two files per backup directory do the work: the exclusive lock file holds a
//! single owning PID, and the shared lock file holds one PID per line. Both are
//! plain text so a stuck lock can be inspected and cleared by hand if needed.
//!
//! Unlike the C original, there is no process-wide `atexit` hook here: locks are
//! released by a scope-bound [`LockGuard`]'s `Drop` impl, per the design note to
//! replace global-registry-plus-exit-hook with ordinary RAII.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::catalog::paths;
use crate::errors::{BackupError, Result};

/// Set by the CLI's signal handler; polled in every retry/sleep loop here.
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[must_use]
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// How long the acquire loops wait before giving up. Exposed so tests don't
/// have to burn the production defaults (30s) on every stale-lock check.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeouts {
    /// Total seconds to wait for a live owner to release the lock.
    pub total_secs: u32,
    /// Attempts to wait out an empty (being-written) lock file before treating
    /// it as stale.
    pub stale_tries: u32,
    /// How often (in seconds) to log a "still waiting" message.
    pub log_every_secs: u32,
    pub poll_interval: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self { total_secs: 30, stale_tries: 30, log_every_secs: 5, poll_interval: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrabResult {
    Ok,
    Timeout,
    Enospc,
    Erofs,
}

/// Outcome of an `acquire_*` call that did not hard-fail.
pub enum LockOutcome {
    /// The lock (or, for shared mode on a read-only filesystem, a no-op stand-in
    /// for it) is held; dropping the guard releases it.
    Acquired(LockGuard),
    /// A live owner did not release within the configured timeout.
    Timeout,
    /// Exclusive acquisition hit `ENOSPC` in non-strict (delete) mode: the lock
    /// file could not actually be written, but the caller should behave as if
    /// it owns the lock, since `ENOSPC` may itself be the reason a delete is
    /// being attempted.
    TreatedAsLocked,
}

/// A held lock. Releases on drop; `forget_without_releasing` exists for the
/// rare case a caller wants to hand the lock off rather than release it here.
pub struct LockGuard {
    backup_dir: PathBuf,
    exclusive: bool,
    noop: bool,
    active: bool,
}

impl LockGuard {
    fn release(&mut self) {
        if !self.active || self.noop {
            self.active = false;
            return;
        }
        self.active = false;
        if self.exclusive {
            let _ = std::fs::remove_file(paths::exclusive_lock_path(&self.backup_dir));
            return;
        }
        // Releasing a shared lock needs a brief exclusive hold to rewrite the
        // shared-lock file without our own pid.
        match grab_excl_lock_file(&self.backup_dir, false, &LockTimeouts::default()) {
            GrabResult::Ok => {
                release_shared_lock_file(&self.backup_dir);
                let _ = std::fs::remove_file(paths::exclusive_lock_path(&self.backup_dir));
            }
            // Could not get the brief exclusive hold; leave our pid in the
            // shared file rather than block forever on release.
            _ => log::warn!("could not briefly acquire exclusive lock to release shared lock on {:?}", self.backup_dir),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn my_pid() -> u32 {
    std::process::id()
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // Any other errno (e.g. EPERM, meaning it exists but we can't signal it)
        // is treated as "still alive".
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(pid: u32) -> bool {
    pid == my_pid()
}

/// Acquire the exclusive lock file, waiting out a live owner. Mirrors the
/// source's `grab_excl_lock_file`.
fn grab_excl_lock_file(backup_dir: &Path, strict: bool, timeouts: &LockTimeouts) -> GrabResult {
    let lock_file = paths::exclusive_lock_path(backup_dir);
    let mut ntries: i64 = i64::from(timeouts.total_secs);
    let mut empty_tries: i64 = i64::from(timeouts.stale_tries);

    loop {
        if is_interrupted() {
            return GrabResult::Timeout;
        }

        match std::fs::OpenOptions::new().write(true).create_new(true).open(&lock_file) {
            Ok(mut fp) => {
                if writeln!(fp, "{}", my_pid()).is_err() || fp.flush().is_err() {
                    let _ = std::fs::remove_file(&lock_file);
                    return GrabResult::Timeout;
                }
                return GrabResult::Ok;
            }
            Err(e) if e.raw_os_error() == Some(libc_erofs()) => return GrabResult::Erofs,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // fall through to inspect the existing owner below
            }
            Err(e) if e.raw_os_error() == Some(libc_enospc()) => return GrabResult::Enospc,
            Err(_) => return GrabResult::Timeout,
        }

        let mut buf = String::new();
        match std::fs::File::open(&lock_file) {
            Ok(mut f) => {
                if f.read_to_string(&mut buf).is_err() {
                    return GrabResult::Timeout;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue, // raced with the owner unlinking it
            Err(_) => return GrabResult::Timeout,
        }

        if buf.trim().is_empty() {
            if empty_tries <= 0 {
                log::warn!("lock file {lock_file:?} is empty; treating as stale");
            } else {
                if empty_tries % i64::from(timeouts.log_every_secs.max(1)) == 0 {
                    log::warn!("waiting on empty exclusive lock file {lock_file:?}");
                }
                std::thread::sleep(timeouts.poll_interval);
                empty_tries -= 1;
                ntries += 1;
                continue;
            }
        } else {
            let owner: i64 = buf.trim().parse().unwrap_or(-1);
            if owner <= 0 {
                log::warn!("bogus data in lock file {lock_file:?}: {buf:?}");
            } else if owner as u32 == my_pid() {
                return GrabResult::Ok;
            } else if pid_is_alive(owner as u32) {
                if ntries <= 0 {
                    return GrabResult::Timeout;
                }
                if ntries % i64::from(timeouts.log_every_secs.max(1)) == 0 {
                    log::warn!("process {owner} still holds exclusive lock {lock_file:?}");
                }
                std::thread::sleep(timeouts.poll_interval);
                ntries -= 1;
                continue;
            }
            // else: owner is dead, fall through to reclaim.
        }

        if std::fs::remove_file(&lock_file).is_err() {
            // Lost the race to someone else cleaning it up; just retry.
        }
        if ntries <= 0 {
            return GrabResult::Timeout;
        }
        ntries -= 1;
    }
}

fn read_shared_pids(lock_file: &Path) -> Vec<u32> {
    let Ok(text) = std::fs::read_to_string(lock_file) else { return Vec::new() };
    text.lines()
        .filter_map(|l| l.trim().parse::<i64>().ok())
        .filter(|&pid| pid > 0)
        .map(|pid| pid as u32)
        .filter(|&pid| pid != my_pid() && pid_is_alive(pid))
        .collect()
}

fn write_shared_pids(lock_file: &Path, pids: &[u32]) {
    let body: String = pids.iter().map(|p| format!("{p}\n")).collect();
    let _ = crate::fsutil::atomic_write(lock_file, body.as_bytes());
}

fn grab_shared_lock_file(backup_dir: &Path) {
    let lock_file = paths::shared_lock_path(backup_dir);
    let mut pids = read_shared_pids(&lock_file);
    pids.push(my_pid());
    write_shared_pids(&lock_file, &pids);
}

fn release_shared_lock_file(backup_dir: &Path) {
    let lock_file = paths::shared_lock_path(backup_dir);
    let pids = read_shared_pids(&lock_file);
    if pids.is_empty() {
        // Open question (spec §9): the source ignores ENOENT here; we log
        // instead of erroring but don't treat it as a failure either way.
        if let Err(e) = std::fs::remove_file(&lock_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove shared lock file {lock_file:?}: {e}");
            }
        }
        return;
    }
    write_shared_pids(&lock_file, &pids);
}

/// Wait for every PID in the shared lock file to depart, then remove it.
/// Mirrors `wait_shared_owners`: returns `false` if some owner is still alive
/// after the timeout.
fn wait_shared_owners(backup_dir: &Path, timeouts: &LockTimeouts) -> bool {
    let lock_file = paths::shared_lock_path(backup_dir);
    let Ok(text) = std::fs::read_to_string(&lock_file) else { return true };

    for line in text.lines() {
        let Ok(pid) = line.trim().parse::<i64>() else { continue };
        if pid <= 0 {
            log::warn!("bogus data in lock file {lock_file:?}: {line:?}");
            continue;
        }
        let pid = pid as u32;
        if pid == my_pid() {
            continue;
        }
        let mut ntries: i64 = i64::from(timeouts.total_secs);
        loop {
            if is_interrupted() || !pid_is_alive(pid) {
                break;
            }
            if ntries <= 0 {
                return false;
            }
            if ntries % i64::from(timeouts.log_every_secs.max(1)) == 0 {
                log::warn!("process {pid} still holds a shared lock on {backup_dir:?}");
            }
            std::thread::sleep(timeouts.poll_interval);
            ntries -= 1;
        }
    }
    let _ = std::fs::remove_file(&lock_file);
    true
}

fn lock_backup(backup_dir: &Path, strict: bool, exclusive: bool, timeouts: &LockTimeouts) -> Result<LockOutcome> {
    std::fs::create_dir_all(backup_dir)?;
    let rc = grab_excl_lock_file(backup_dir, strict, timeouts);

    let mut treated_as_locked = false;
    match rc {
        GrabResult::Timeout => return Ok(LockOutcome::Timeout),
        GrabResult::Enospc => {
            treated_as_locked = true;
            if strict {
                return Ok(LockOutcome::TreatedAsLocked);
            }
        }
        GrabResult::Erofs => {
            return if exclusive {
                Err(BackupError::Lock(format!("{}: read-only filesystem", backup_dir.display())))
            } else {
                Ok(LockOutcome::Acquired(LockGuard {
                    backup_dir: backup_dir.to_path_buf(),
                    exclusive: false,
                    noop: true,
                    active: true,
                }))
            };
        }
        GrabResult::Ok => {}
    }

    let ok = if exclusive { wait_shared_owners(backup_dir, timeouts) } else {
        grab_shared_lock_file(backup_dir);
        true
    };

    if !ok {
        let _ = std::fs::remove_file(paths::exclusive_lock_path(backup_dir));
        return Ok(LockOutcome::Timeout);
    }

    if !exclusive {
        let _ = std::fs::remove_file(paths::exclusive_lock_path(backup_dir));
    }

    if exclusive && !strict && treated_as_locked {
        // The ENOSPC retry: releasing the shared lock file above may have
        // freed space. Try once more; if someone else grabbed it first, give up.
        return match grab_excl_lock_file(backup_dir, strict, timeouts) {
            GrabResult::Timeout => Ok(LockOutcome::Timeout),
            _ => Ok(LockOutcome::Acquired(LockGuard {
                backup_dir: backup_dir.to_path_buf(),
                exclusive: true,
                noop: false,
                active: true,
            })),
        };
    }

    Ok(LockOutcome::Acquired(LockGuard {
        backup_dir: backup_dir.to_path_buf(),
        exclusive,
        noop: false,
        active: true,
    }))
}

/// Acquire the exclusive lock on `backup_dir`. Only read-modify-write status
/// transitions and backup creation take exclusive locks.
/// # Errors
/// Returns an error if the filesystem is read-only (exclusive mode can never
/// succeed there) or another I/O failure occurs.
pub fn acquire_exclusive(backup_dir: &Path, strict: bool) -> Result<LockOutcome> {
    lock_backup(backup_dir, strict, true, &LockTimeouts::default())
}

/// Acquire a shared (read-only) lock on `backup_dir`. Used by validate/restore.
/// # Errors
/// Returns an error on unexpected I/O failure.
pub fn acquire_shared(backup_dir: &Path) -> Result<LockOutcome> {
    lock_backup(backup_dir, true, false, &LockTimeouts::default())
}

/// Test/production-tunable variants.
pub fn acquire_exclusive_with_timeouts(backup_dir: &Path, strict: bool, timeouts: &LockTimeouts) -> Result<LockOutcome> {
    lock_backup(backup_dir, strict, true, timeouts)
}

pub fn acquire_shared_with_timeouts(backup_dir: &Path, timeouts: &LockTimeouts) -> Result<LockOutcome> {
    lock_backup(backup_dir, true, false, timeouts)
}

/// Lock a contiguous range of an (ascending, by age) backup list in
/// descending (newest → oldest) order, so callers always release a later
/// backup before an earlier one — matching the parent-chain dependency
/// direction. `from` and `to` are inclusive indices into `dirs`.
/// # Errors
/// Returns an error if any lock in the range times out or fails.
pub fn lock_backup_list(dirs: &[PathBuf], from: usize, to: usize, strict: bool, exclusive: bool) -> Result<Vec<LockGuard>> {
    let (lo, hi) = (from.min(to), from.max(to));
    let mut guards = Vec::with_capacity(hi - lo + 1);
    for idx in (lo..=hi).rev() {
        let timeouts = LockTimeouts::default();
        match lock_backup(&dirs[idx], strict, exclusive, &timeouts)? {
            LockOutcome::Acquired(guard) => guards.push(guard),
            LockOutcome::TreatedAsLocked => {}
            LockOutcome::Timeout => {
                return Err(BackupError::Lock(format!("timed out locking {:?}", dirs[idx])));
            }
        }
    }
    Ok(guards)
}

#[cfg(unix)]
fn libc_erofs() -> i32 {
    nix::errno::Errno::EROFS as i32
}
#[cfg(not(unix))]
fn libc_erofs() -> i32 {
    -1
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    nix::errno::Errno::ENOSPC as i32
}
#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    -2
}
