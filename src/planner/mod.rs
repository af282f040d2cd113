use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{self, ReleaseEntry};

/// The update plan for one check: which releases to fetch and apply to move
/// the installation from its current version to the newest published one.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateInfo {
    currently_installed: Option<ReleaseEntry>,
    releases_to_apply: Vec<ReleaseEntry>,
    package_directory: PathBuf,
}

impl UpdateInfo {
    /// Validates the plan invariants: entries ascending by version and
    /// homogeneous in kind (all deltas, or at most one full release).
    pub fn new(
        currently_installed: Option<ReleaseEntry>,
        releases_to_apply: Vec<ReleaseEntry>,
        package_directory: PathBuf,
    ) -> UpdateResult<Self> {
        let deltas = releases_to_apply.iter().filter(|e| e.is_delta()).count();
        let fulls = releases_to_apply.len() - deltas;
        if deltas > 0 && fulls > 0 {
            return Err(UpdateError::InvalidPlan {
                reason: "plan mixes delta and full releases".into(),
            });
        }
        if fulls > 1 {
            return Err(UpdateError::InvalidPlan {
                reason: "plan contains more than one full release".into(),
            });
        }
        if !releases_to_apply.is_sorted_by(|a, b| a.version() <= b.version()) {
            return Err(UpdateError::InvalidPlan {
                reason: "plan is not ascending by version".into(),
            });
        }
        Ok(Self {
            currently_installed,
            releases_to_apply,
            package_directory,
        })
    }

    pub fn currently_installed(&self) -> Option<&ReleaseEntry> {
        self.currently_installed.as_ref()
    }

    pub fn releases_to_apply(&self) -> &[ReleaseEntry] {
        &self.releases_to_apply
    }

    pub fn package_directory(&self) -> &Path {
        &self.package_directory
    }

    /// The version this plan lands on: the max entry of the plan, or the
    /// current version when the plan is empty.
    pub fn future_release_entry(&self) -> Option<&ReleaseEntry> {
        self.releases_to_apply
            .iter()
            .max_by(|a, b| a.version().cmp(b.version()))
            .or(self.currently_installed.as_ref())
    }

    /// An empty plan means the installation is already current.
    pub fn is_noop(&self) -> bool {
        self.releases_to_apply.is_empty()
    }

    pub fn is_delta_plan(&self) -> bool {
        self.releases_to_apply.iter().all(|e| e.is_delta()) && !self.releases_to_apply.is_empty()
    }

    /// First install: nothing is installed yet.
    pub fn is_bootstrap(&self) -> bool {
        self.currently_installed.is_none()
    }
}

/// Compare local and remote manifests and choose what to apply: nothing, a
/// chain of deltas, or a single full package, by total download cost.
pub fn determine_update_info(
    local: &[ReleaseEntry],
    remote: &[ReleaseEntry],
    package_directory: &Path,
    ignore_delta_updates: bool,
) -> UpdateResult<UpdateInfo> {
    // A missing remote feed reads as "no changes offered".
    let remote: Vec<ReleaseEntry> = if remote.is_empty() {
        warn!("planner: remote feed is empty; treating local releases as the feed");
        local.to_vec()
    } else {
        remote.to_vec()
    };

    let remote: Vec<ReleaseEntry> = if ignore_delta_updates {
        remote.into_iter().filter(|e| !e.is_delta()).collect()
    } else {
        remote
    };

    let latest_full = manifest::find_current_version(&remote)
        .cloned()
        .ok_or(UpdateError::NoFullReleaseFound)?;

    let current = manifest::find_current_version(local).cloned();

    let Some(current) = current else {
        // Bootstrap: nothing installed, take the newest full package.
        info!(
            "planner: first install, selecting {}",
            latest_full.filename()
        );
        return UpdateInfo::new(None, vec![latest_full], package_directory.to_owned());
    };

    if current.version() > latest_full.version() {
        // Remote regressed below the local version. Never walk deltas
        // backwards; offer the remote full package and let the caller decide.
        warn!(
            "planner: local version {} is ahead of remote {}; planning a downgrade to the remote full package",
            current.version(),
            latest_full.version()
        );
        return UpdateInfo::new(
            Some(current),
            vec![latest_full],
            package_directory.to_owned(),
        );
    }

    if latest_full.version() <= current.version() {
        info!("planner: version {} is current", current.version());
        return UpdateInfo::new(Some(current), Vec::new(), package_directory.to_owned());
    }

    let mut delta_set: Vec<ReleaseEntry> = remote
        .iter()
        .filter(|e| e.is_delta() && e.version() > current.version())
        .cloned()
        .collect();
    delta_set.sort_by(|a, b| a.version().cmp(b.version()));

    let delta_cost: u64 = delta_set.iter().map(|e| e.filesize()).sum();
    let plan = if delta_cost > 0 && delta_cost < latest_full.filesize() {
        info!(
            "planner: delta chain of {} entries ({} bytes) beats full package ({} bytes)",
            delta_set.len(),
            delta_cost,
            latest_full.filesize()
        );
        delta_set
    } else {
        info!(
            "planner: selecting full package {} ({} bytes)",
            latest_full.filename(),
            latest_full.filesize()
        );
        vec![latest_full]
    };

    UpdateInfo::new(Some(current), plan, package_directory.to_owned())
}
