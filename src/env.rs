use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::manifest::PackageVersion;

/// Name of the manifest file inside the packages directory.
pub const RELEASES_FILE: &str = "RELEASES";

/// Hidden marker flagging a directory that failed deletion and must be
/// treated as absent until a later cleanup pass removes it.
pub const DEAD_MARKER: &str = ".dead";

const APP_DIR_PREFIX: &str = "app-";

/// Returns the default installation root for an application id
/// (`%LOCALAPPDATA%\<id>`, `~/Library/Application Support/<id>`,
/// `~/.local/share/<id>`).
pub fn default_root(app_id: &str) -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join(app_id)
}

pub fn packages_dir(root: &Path) -> PathBuf {
    root.join("packages")
}

pub fn local_releases_path(root: &Path) -> PathBuf {
    packages_dir(root).join(RELEASES_FILE)
}

/// Versioned install directory for one application version.
pub fn app_dir(root: &Path, version: &PackageVersion) -> PathBuf {
    root.join(format!("{APP_DIR_PREFIX}{version}"))
}

pub fn is_dead(dir: &Path) -> bool {
    dir.join(DEAD_MARKER).exists()
}

/// Drop a `.dead` marker into a directory that refused to delete.
pub fn mark_dead(dir: &Path) -> std::io::Result<()> {
    fs::write(dir.join(DEAD_MARKER), b"")
}

/// All `app-<version>` directories under the root, including dead ones.
/// Entries whose suffix does not parse as a version are ignored.
pub fn installed_version_dirs(root: &Path) -> Vec<(PackageVersion, PathBuf)> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return found;
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(APP_DIR_PREFIX)
            && let Some(version) = PackageVersion::parse(suffix)
        {
            found.push((version, entry.path()));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

/// Highest installed version whose directory is not marked dead.
pub fn latest_installed_version(root: &Path) -> Option<PackageVersion> {
    installed_version_dirs(root)
        .into_iter()
        .rev()
        .find(|(_, dir)| !is_dead(dir))
        .map(|(version, _)| version)
}

/// Create the on-disk folder layout expected by the engine.
pub fn ensure_layout(root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root)?;
    fs::create_dir_all(packages_dir(root))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lists_versioned_dirs_in_order() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("app-1.2.0")).unwrap();
        fs::create_dir(root.path().join("app-1.0.0")).unwrap();
        fs::create_dir(root.path().join("packages")).unwrap();
        fs::create_dir(root.path().join("app-not-a-version")).unwrap();

        let dirs = installed_version_dirs(root.path());
        let versions: Vec<String> = dirs.iter().map(|(v, _)| v.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.2.0"]);
    }

    #[test]
    fn latest_installed_skips_dead_dirs() {
        let root = tempdir().unwrap();
        let newest = root.path().join("app-2.0.0");
        fs::create_dir(root.path().join("app-1.0.0")).unwrap();
        fs::create_dir(&newest).unwrap();
        mark_dead(&newest).unwrap();

        let latest = latest_installed_version(root.path()).unwrap();
        assert_eq!(latest.to_string(), "1.0.0");
    }
}
