use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use sysinfo::System;

use crate::delta::DeltaEngine;
use crate::env;
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{self, PackageVersion, ReleaseEntry};
use crate::package;
use crate::planner::UpdateInfo;
use crate::util::{ProgressReporter, RetryPolicy};

mod hooks;

pub use hooks::{
    HOOK_FIRSTRUN, HOOK_INSTALL, HOOK_OBSOLETE, HOOK_UNINSTALL, HOOK_UPDATED, HookEvent,
    LifecycleProbe, NoAwarenessProbe, NoShellIntegration, ShellIntegration, find_executables,
};

const UNINSTALL_GRACE: Duration = Duration::from_secs(5);
const ROOT_DELETE_RETRY: RetryPolicy = RetryPolicy::new(10, Duration::from_secs(1));

/// Phases of one apply run, in order. `Failed` is reachable from any phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApplyState {
    Idle,
    LockAcquired,
    PackagesResolved,
    Installed,
    SelfUpdated,
    HooksInvoked,
    ShortcutsFixed,
    CleanedUp,
    Done,
    Failed,
}

/// Installs resolved packages into versioned directories and runs the
/// post-install machinery: updater self-replacement, lifecycle hooks,
/// shortcut repair, and old-version cleanup.
///
/// The caller holds the [`InstanceLock`](crate::lock::InstanceLock) for the
/// whole run; this type never takes it itself.
pub struct ApplyEngine {
    root: PathBuf,
    updater_name: String,
    delta: DeltaEngine,
    probe: Box<dyn LifecycleProbe>,
    shell: Box<dyn ShellIntegration>,
    launch_on_first_install: bool,
}

impl ApplyEngine {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
            updater_name: default_updater_name(),
            delta: DeltaEngine::default(),
            probe: Box::new(NoAwarenessProbe),
            shell: Box::new(NoShellIntegration),
            launch_on_first_install: false,
        }
    }

    pub fn with_updater_name(mut self, name: &str) -> Self {
        self.updater_name = name.to_owned();
        self
    }

    pub fn with_delta_engine(mut self, delta: DeltaEngine) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn LifecycleProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_shell(mut self, shell: Box<dyn ShellIntegration>) -> Self {
        self.shell = shell;
        self
    }

    /// Launch the installed executables once after a first install when none
    /// of them opt into lifecycle hooks.
    pub fn with_launch_on_first_install(mut self, launch: bool) -> Self {
        self.launch_on_first_install = launch;
        self
    }

    /// Apply a downloaded plan: resolve deltas to a full package, install it
    /// into `app-<version>/`, and run the post-install phases. Returns the
    /// version now current.
    pub async fn apply(
        &self,
        info: &UpdateInfo,
        progress: &mut ProgressReporter<'_>,
    ) -> UpdateResult<PackageVersion> {
        let mut state = ApplyState::LockAcquired;
        match self.apply_inner(info, &mut state, progress).await {
            Ok(version) => {
                transition(&mut state, ApplyState::Done);
                Ok(version)
            }
            Err(err) => {
                error!("apply: failed during {state:?}: {err}");
                transition(&mut state, ApplyState::Failed);
                Err(err)
            }
        }
    }

    async fn apply_inner(
        &self,
        info: &UpdateInfo,
        state: &mut ApplyState,
        progress: &mut ProgressReporter<'_>,
    ) -> UpdateResult<PackageVersion> {
        let previous = info.currently_installed().map(|e| e.version().clone());

        if info.is_noop() {
            let current = previous.ok_or(UpdateError::InvalidPlan {
                reason: "empty plan with nothing installed".into(),
            })?;
            info!("apply: version {current} is already current");
            progress.report(100);
            return Ok(current);
        }

        let full_pkg = self.resolve_full_package(info)?;
        transition(state, ApplyState::PackagesResolved);
        progress.report_scaled(1, 5, 60, 100);

        let entry = ReleaseEntry::from_file(&full_pkg)?;
        let version = entry.version().clone();
        let new_dir = self.install_package(&full_pkg, &version)?;
        self.write_local_releases(&entry)?;
        transition(state, ApplyState::Installed);
        progress.report_scaled(2, 5, 60, 100);

        self.update_updater_executable(&new_dir)?;
        transition(state, ApplyState::SelfUpdated);
        progress.report_scaled(3, 5, 60, 100);

        self.run_lifecycle_hooks(info, &new_dir, &version).await;
        transition(state, ApplyState::HooksInvoked);

        let old_dir = previous.as_ref().map(|v| env::app_dir(&self.root, v));
        if let Err(err) = self
            .shell
            .repair_shortcuts(old_dir.as_deref(), &new_dir)
        {
            warn!("apply: shortcut repair failed: {err}");
        }
        transition(state, ApplyState::ShortcutsFixed);
        progress.report_scaled(4, 5, 60, 100);

        self.clean_dead_versions(previous.as_ref(), &version).await?;
        transition(state, ApplyState::CleanedUp);
        progress.report(100);

        Ok(version)
    }

    /// Collapse the plan into a single full package on disk: fold an all-delta
    /// chain onto the installed version's full package, or use the downloaded
    /// full package directly.
    fn resolve_full_package(&self, info: &UpdateInfo) -> UpdateResult<PathBuf> {
        let packages = info.package_directory();
        if info.is_delta_plan() {
            let current = info
                .currently_installed()
                .ok_or_else(|| UpdateError::InvalidPlan {
                    reason: "delta plan with nothing installed".into(),
                })?;
            let base = packages.join(package::package_filename(
                current.package_name(),
                current.version(),
                false,
            ));
            if !base.exists() {
                return Err(UpdateError::InstallFailed {
                    message: format!(
                        "base package for delta chain is missing: {}",
                        base.display()
                    ),
                });
            }
            let deltas: Vec<PathBuf> = info
                .releases_to_apply()
                .iter()
                .map(|e| packages.join(e.filename()))
                .collect();
            return self.delta.fold_chain(&base, &deltas, packages);
        }

        let full = info
            .releases_to_apply()
            .iter()
            .find(|e| !e.is_delta())
            .ok_or(UpdateError::NoFullReleaseFound)?;
        Ok(packages.join(full.filename()))
    }

    /// Extract the payload of `full_pkg` into `app-<version>/`. The extraction
    /// lands in a staging directory first so the versioned directory only ever
    /// exists fully populated.
    fn install_package(
        &self,
        full_pkg: &Path,
        version: &PackageVersion,
    ) -> UpdateResult<PathBuf> {
        let final_dir = env::app_dir(&self.root, version);
        info!(
            "apply: installing {} into {}",
            full_pkg.display(),
            final_dir.display()
        );

        let scratch = tempfile::tempdir()?;
        package::extract(full_pkg, scratch.path())?;

        let staging = tempfile::tempdir_in(&self.root)?;
        for entry in walkdir::WalkDir::new(scratch.path()).sort_by_file_name() {
            let entry = entry.map_err(|e| UpdateError::InstallFailed {
                message: format!("walk error in extracted package: {e}"),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(scratch.path())
                .expect("walkdir yields paths under its root");
            let Some(target_rel) = package::install_relative_path(rel) else {
                continue;
            };
            let target = staging.path().join(target_rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        let staging = staging.keep();
        fs::rename(&staging, &final_dir).inspect_err(|_| {
            let _ = fs::remove_dir_all(&staging);
        })?;
        Ok(final_dir)
    }

    /// Persist the local manifest with only the installed entry,
    /// temp-file-then-rename so a crash never leaves a truncated manifest.
    fn write_local_releases(&self, entry: &ReleaseEntry) -> UpdateResult<()> {
        let packages = env::packages_dir(&self.root);
        fs::create_dir_all(&packages)?;
        let mut staged = tempfile::NamedTempFile::new_in(&packages)?;
        manifest::write(std::slice::from_ref(entry), &mut staged)?;
        staged.flush()?;
        staged
            .persist(env::local_releases_path(&self.root))
            .map_err(|e| UpdateError::InstallFailed {
                message: format!("manifest replace failed: {e}"),
            })?;
        Ok(())
    }

    /// Copy a newer updater shipped inside the new version over the one at
    /// the installation root. When the running process is that executable,
    /// swap it in place instead of copying over an open file.
    fn update_updater_executable(&self, new_dir: &Path) -> UpdateResult<()> {
        let shipped = new_dir.join(&self.updater_name);
        if !shipped.exists() {
            debug!("apply: new version ships no updater executable");
            return Ok(());
        }
        let target = self.root.join(&self.updater_name);

        let running = std::env::current_exe().ok();
        if running.is_some_and(|exe| exe == target) {
            info!("apply: replacing the running updater in place");
            return self_replace::self_replace(&shipped).map_err(|e| {
                UpdateError::InstallFailed {
                    message: format!("updater self-replace failed: {e}"),
                }
            });
        }

        RetryPolicy::file_ops()
            .run_blocking("apply: updater copy", || {
                fs::copy(&shipped, &target).map(|_| ())
            })
            .map_err(UpdateError::from)
    }

    async fn run_lifecycle_hooks(
        &self,
        info: &UpdateInfo,
        new_dir: &Path,
        version: &PackageVersion,
    ) {
        let updater = self.root.join(&self.updater_name);
        let executables: Vec<PathBuf> = find_executables(new_dir)
            .into_iter()
            .filter(|exe| exe.file_name() != updater.file_name())
            .collect();
        let aware: Vec<PathBuf> = executables
            .iter()
            .filter(|exe| {
                self.probe
                    .probe(exe)
                    .inspect(|contract| {
                        debug!(
                            "apply: {} declares lifecycle contract {contract}",
                            exe.display()
                        );
                    })
                    .is_some()
            })
            .cloned()
            .collect();

        let event = if info.is_bootstrap() {
            HookEvent::Install
        } else {
            HookEvent::Updated
        };

        if !aware.is_empty() {
            hooks::invoke_hooks(&aware, event, version).await;
        } else if info.is_bootstrap() && self.launch_on_first_install {
            hooks::launch_once(&executables);
        }
    }

    /// Delete every installed version directory other than the one just
    /// installed and the one it replaced. Aware executables in a retired
    /// directory are told they are obsolete first. Each deletion retries on
    /// its own; a directory that still refuses gets a `.dead` marker and the
    /// cleanup succeeds anyway.
    pub async fn clean_dead_versions(
        &self,
        keep_previous: Option<&PackageVersion>,
        keep_target: &PackageVersion,
    ) -> UpdateResult<()> {
        for (version, dir) in env::installed_version_dirs(&self.root) {
            if &version == keep_target || Some(&version) == keep_previous {
                continue;
            }
            let aware: Vec<PathBuf> = find_executables(&dir)
                .into_iter()
                .filter(|exe| self.probe.probe(exe).is_some())
                .collect();
            if !aware.is_empty() {
                hooks::invoke_hooks(&aware, HookEvent::Obsolete, keep_target).await;
            }
            debug!("apply: removing stale version dir {}", dir.display());
            let removed = RetryPolicy::file_ops()
                .run_blocking("apply: stale dir delete", || fs::remove_dir_all(&dir));
            if let Err(err) = removed {
                warn!(
                    "apply: could not delete {} ({err}); marking it dead",
                    dir.display()
                );
                if let Err(mark_err) = env::mark_dead(&dir) {
                    warn!("apply: dead marker failed too: {mark_err}");
                }
            }
        }
        Ok(())
    }

    /// Remove the whole installation: notify aware executables, force-kill
    /// stragglers still running out of the root after a grace period, then
    /// delete the root.
    pub async fn full_uninstall(&self) -> UpdateResult<()> {
        info!("apply: uninstalling {}", self.root.display());

        for (version, dir) in env::installed_version_dirs(&self.root) {
            let aware: Vec<PathBuf> = find_executables(&dir)
                .into_iter()
                .filter(|exe| self.probe.probe(exe).is_some())
                .collect();
            if !aware.is_empty() {
                hooks::invoke_hooks(&aware, HookEvent::Uninstall, &version).await;
            }
        }

        tokio::time::sleep(UNINSTALL_GRACE).await;
        self.kill_processes_under_root();

        let removed = ROOT_DELETE_RETRY
            .run("apply: root delete", || async {
                tokio::fs::remove_dir_all(&self.root)
                    .await
                    .map_err(UpdateError::from)
            })
            .await;
        if let Err(err) = removed {
            warn!(
                "apply: root {} would not delete ({err}); marking it dead",
                self.root.display()
            );
            env::mark_dead(&self.root).map_err(|e| UpdateError::UninstallIncomplete {
                message: format!("root undeletable and dead marker failed: {e}"),
            })?;
        }
        Ok(())
    }

    fn kill_processes_under_root(&self) {
        let system = System::new_all();
        for process in system.processes().values() {
            let Some(exe) = process.exe() else {
                continue;
            };
            if exe.starts_with(&self.root) && process.pid().as_u32() != std::process::id() {
                warn!(
                    "apply: killing process {} still running from {}",
                    process.pid(),
                    exe.display()
                );
                process.kill();
            }
        }
    }
}

fn transition(state: &mut ApplyState, next: ApplyState) {
    debug!("apply: {state:?} -> {next:?}");
    *state = next;
}

fn default_updater_name() -> String {
    if cfg!(windows) {
        "Update.exe".to_owned()
    } else {
        "updater".to_owned()
    }
}
