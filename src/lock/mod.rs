use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::Instant;

use crate::error::{UpdateError, UpdateResult};
use crate::util::sha1_hex;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cross-process mutual exclusion for one installation root.
///
/// Backed by an exclusively-created file in the shared temp directory named
/// from a hash of the root path: processes updating the same install collide,
/// different installs do not. The holder's PID is recorded so a lock leaked
/// by a crashed process can be reclaimed instead of blocking updates forever.
///
/// Callers must release the guard explicitly; dropping it without `release`
/// is a programming error that is reported (and cleaned up best-effort)
/// rather than silently ignored.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Acquire the update lock for `root`, polling every 250ms until
    /// `timeout` elapses.
    pub async fn acquire(root: &Path, timeout: Duration) -> UpdateResult<Self> {
        let path = lock_path(root);
        let deadline = Instant::now() + timeout;
        debug!("lock: acquiring {}", path.display());

        loop {
            match try_create(&path) {
                Ok(()) => {
                    info!("lock: acquired {}", path.display());
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if holder_is_dead(&path) {
                        warn!("lock: reclaiming lock from dead holder");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(UpdateError::LockTimeout);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Release the lock, deleting the lock file.
    pub fn release(mut self) -> UpdateResult<()> {
        self.released = true;
        fs::remove_file(&self.path)?;
        debug!("lock: released {}", self.path.display());
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if !self.released {
            error!(
                "lock: guard for {} dropped without release; cleaning up",
                self.path.display()
            );
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn lock_path(root: &Path) -> PathBuf {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_owned());
    let digest = sha1_hex(canonical.to_string_lossy().as_bytes());
    std::env::temp_dir().join(format!("slipstream-{}.lock", &digest[..12]))
}

/// Stage the PID in a private temp file, then link it into place. The link
/// either publishes PID and lock in one step or fails with `AlreadyExists`;
/// contenders never observe a lock file without its holder recorded.
fn try_create(path: &Path) -> std::io::Result<()> {
    let dir = path
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(std::env::temp_dir);
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    write!(staged, "{}", std::process::id())?;
    staged.flush()?;
    fs::hard_link(staged.path(), path)?;
    Ok(())
}

/// A lock whose recorded holder no longer runs is stale. Locks are published
/// with their PID already written, so unparsable contents are leftovers from
/// a crashed run and count as stale too.
fn holder_is_dead(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false; // deleted by a concurrent release; poll again
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return true;
    };
    if pid == std::process::id() {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_none()
}
