use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use walkdir::WalkDir;

use crate::manifest::PackageVersion;

/// Command-line lifecycle contract announced to dependent executables.
pub const HOOK_INSTALL: &str = "--squirrel-install";
pub const HOOK_UPDATED: &str = "--squirrel-updated";
pub const HOOK_OBSOLETE: &str = "--squirrel-obsolete";
pub const HOOK_UNINSTALL: &str = "--squirrel-uninstall";
pub const HOOK_FIRSTRUN: &str = "--squirrel-firstrun";

const HOOK_GRACE: Duration = Duration::from_secs(30);

/// Lifecycle event delivered to aware executables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Install,
    Updated,
    Obsolete,
    Uninstall,
}

impl HookEvent {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Install => HOOK_INSTALL,
            Self::Updated => HOOK_UPDATED,
            Self::Obsolete => HOOK_OBSOLETE,
            Self::Uninstall => HOOK_UNINSTALL,
        }
    }
}

/// External capability check: does this executable opt into update-lifecycle
/// callbacks? Implemented outside the engine by a binary-metadata reader;
/// the engine only consumes the declared contract version.
pub trait LifecycleProbe: Send + Sync {
    fn probe(&self, executable: &Path) -> Option<PackageVersion>;
}

/// Probe used when no metadata reader is wired in: nothing is aware.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAwarenessProbe;

impl LifecycleProbe for NoAwarenessProbe {
    fn probe(&self, _executable: &Path) -> Option<PackageVersion> {
        None
    }
}

/// OS shortcut / pinned-item repair collaborator. The engine only supplies
/// the before and after install paths.
pub trait ShellIntegration: Send + Sync {
    fn repair_shortcuts(&self, old_dir: Option<&Path>, new_dir: &Path) -> std::io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoShellIntegration;

impl ShellIntegration for NoShellIntegration {
    fn repair_shortcuts(&self, _old_dir: Option<&Path>, _new_dir: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// Invoke one lifecycle hook per executable, strictly sequentially: hook
/// order matters and hooks may mutate shared OS state. A failing or hung
/// hook is logged and skipped; it never aborts the remaining hooks.
pub async fn invoke_hooks(executables: &[PathBuf], event: HookEvent, version: &PackageVersion) {
    for exe in executables {
        debug!(
            "hooks: invoking {} {} {version}",
            exe.display(),
            event.flag()
        );
        let child = tokio::process::Command::new(exe)
            .arg(event.flag())
            .arg(version.to_string())
            .current_dir(exe.parent().unwrap_or(Path::new(".")))
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!("hooks: failed to start {}: {err}", exe.display());
                continue;
            }
        };

        match tokio::time::timeout(HOOK_GRACE, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                warn!("hooks: {} exited with {status}", exe.display());
            }
            Ok(Err(err)) => {
                warn!("hooks: waiting on {} failed: {err}", exe.display());
            }
            Err(_) => {
                warn!(
                    "hooks: {} did not finish within {HOOK_GRACE:?}; killing it",
                    exe.display()
                );
                let _ = child.kill().await;
            }
        }
    }
}

/// Launch executables once without waiting on them (first-install case with
/// no lifecycle-aware apps).
pub fn launch_once(executables: &[PathBuf]) {
    for exe in executables {
        debug!("hooks: first-run launching {}", exe.display());
        if let Err(err) = std::process::Command::new(exe)
            .arg(HOOK_FIRSTRUN)
            .current_dir(exe.parent().unwrap_or(Path::new(".")))
            .spawn()
        {
            warn!("hooks: failed to launch {}: {err}", exe.display());
        }
    }
}

/// Executables inside an installed version directory.
pub fn find_executables(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name().into_iter().flatten() {
        if entry.file_type().is_file() && is_executable(entry.path()) {
            found.push(entry.path().to_owned());
        }
    }
    found
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}
