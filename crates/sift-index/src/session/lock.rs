//! Single-owner lock file recording the daemon PID.
//!
//! Ownership is an advisory exclusive lock on the file, held for the life of
//! the [`SessionLock`]; the PID inside is only informational. The kernel
//! drops the lock when its owner dies, so a stale file is simply re-locked.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt as _;

use crate::error::{IndexError, Result};

/// Lock file name inside the state directory.
pub const LOCK_FILE: &str = "daemon.lock";

const STOP_POLL: Duration = Duration::from_millis(50);

/// How long a contended lock may go without naming a live owner.
const OWNER_WAIT: Duration = Duration::from_secs(1);
const OWNER_POLL: Duration = Duration::from_millis(10);

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum Acquire {
    Acquired(SessionLock),
    /// Another live process owns the project.
    Held { pid: u32 },
}

/// Exclusive ownership of one project's state directory.
///
/// Released on [`SessionLock::release`] or, best effort, on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    pid: u32,
    file: File,
    released: bool,
}

impl SessionLock {
    /// Take the advisory lock and record this process's PID in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or written, or if
    /// it stays locked without naming a live owner.
    pub fn acquire(path: &Path) -> Result<Acquire> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        let deadline = Instant::now() + OWNER_WAIT;

        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => {
                    // The owner may not have written its PID yet.
                    if let Some(owner) = read_owner(path)?.filter(|p| is_alive(*p)) {
                        return Ok(Acquire::Held { pid: owner });
                    }
                    if Instant::now() >= deadline {
                        return Err(IndexError::Lock(format!(
                            "{} is locked but names no live owner",
                            path.display()
                        )));
                    }
                    std::thread::sleep(OWNER_POLL);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            // A releasing owner may have unlinked the file we just locked.
            if !still_linked(&file, path)? {
                continue;
            }
            if let Some(previous) = read_owner(path)?.filter(|p| *p != pid) {
                tracing::warn!(path = %path.display(), previous, "reclaiming stale session lock");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{pid}")?;
            file.sync_all()?;
            tracing::debug!(path = %path.display(), pid, "session lock acquired");
            return Ok(Acquire::Acquired(Self {
                path: path.to_path_buf(),
                pid,
                file,
                released: false,
            }));
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock file if it still names this process, then unlock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    /// Unlinks while still locked so a waiter never inherits a dead inode.
    fn remove_if_owned(&self) -> Result<()> {
        let owned =
            read_owner(&self.path)? == Some(self.pid) && still_linked(&self.file, &self.path)?;
        let removed = if owned {
            remove_lock_file(&self.path)
        } else {
            Ok(())
        };
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), "unlock failed: {e}");
        }
        removed
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.remove_if_owned()
        {
            tracing::warn!(path = %self.path.display(), "failed to release session lock: {e}");
        }
    }
}

/// PID recorded in a lock file. `None` when the file is missing or does
/// not hold a PID.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_owner(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// True when some process currently holds the advisory lock on `path`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be opened or tested.
pub fn is_held(path: &Path) -> Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match fs2::FileExt::try_lock_shared(&file) {
        Ok(()) => {
            fs2::FileExt::unlock(&file)?;
            Ok(false)
        }
        Err(e) if is_contended(&e) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn still_linked(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

/// Remove a lock file nobody holds. Unlinking happens under the lock, the
/// same protocol [`SessionLock`] follows on release.
fn clear_stale(path: &Path) -> Result<()> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let removed = if still_linked(&file, path)? {
        remove_lock_file(path)
    } else {
        Ok(())
    };
    fs2::FileExt::unlock(&file)?;
    removed
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True when a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    pid != 0
}

/// Outcome of [`stop_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No lock file, or its owner was already gone.
    NotRunning,
    /// Owner exited after `SIGTERM`.
    Stopped { pid: u32 },
    /// Owner ignored `SIGTERM` for the grace period and was killed.
    Killed { pid: u32 },
}

/// Stop whichever process owns `lock_path`: `SIGTERM`, wait up to `grace`,
/// then `SIGKILL`. The lock file is removed once nobody holds it.
///
/// # Errors
///
/// Returns an error if the lock file cannot be read or removed, or if
/// signalling processes is unsupported on this platform.
#[cfg(unix)]
pub async fn stop_owner(lock_path: &Path, grace: Duration) -> Result<StopOutcome> {
    let owner = read_owner(lock_path)?;
    if owner == Some(std::process::id()) {
        return Err(IndexError::Lock("refusing to signal the current process".into()));
    }
    let Some(pid) = owner.filter(|pid| is_alive(*pid)) else {
        clear_stale(lock_path)?;
        return Ok(StopOutcome::NotRunning);
    };
    if !is_held(lock_path)? {
        // PID reused by an unrelated process.
        clear_stale(lock_path)?;
        return Ok(StopOutcome::NotRunning);
    }
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| IndexError::Lock(format!("pid {pid} out of range")))?;

    // SAFETY: plain signal delivery to a pid read from the lock file.
    unsafe {
        libc::kill(raw, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            clear_stale(lock_path)?;
            tracing::info!(pid, "daemon stopped");
            return Ok(StopOutcome::Stopped { pid });
        }
        tokio::time::sleep(STOP_POLL).await;
    }

    tracing::warn!(pid, ?grace, "daemon ignored SIGTERM, sending SIGKILL");
    // SAFETY: as above.
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }
    clear_stale(lock_path)?;
    Ok(StopOutcome::Killed { pid })
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
pub async fn stop_owner(lock_path: &Path, _grace: Duration) -> Result<StopOutcome> {
    match read_owner(lock_path)? {
        None => Ok(StopOutcome::NotRunning),
        Some(pid) => Err(IndexError::Lock(format!(
            "cannot signal pid {pid} on this platform"
        ))),
    }
}
