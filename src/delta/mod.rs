use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{self, PackageVersion};
use crate::package;
use crate::util::sha1_hex;

mod strategy;

pub use strategy::{DiffStrategy, SnapshotDiff};

const PATCH_EXTENSIONS: [&str; 2] = ["diff", "bsdiff"];
const SHASUM_EXTENSION: &str = "shasum";

/// Creates and applies delta packages and folds delta chains back into full
/// packages, verifying every patched file against its checksum sidecar.
pub struct DeltaEngine {
    strategy: Box<dyn DiffStrategy>,
}

impl Default for DeltaEngine {
    fn default() -> Self {
        Self::new(Box::new(SnapshotDiff))
    }
}

impl DeltaEngine {
    pub fn new(strategy: Box<dyn DiffStrategy>) -> Self {
        Self { strategy }
    }

    /// Build a delta package encoding the differences from `base_pkg` to
    /// `new_pkg`, written into `out_dir`.
    pub fn create_delta(
        &self,
        base_pkg: &Path,
        new_pkg: &Path,
        out_dir: &Path,
    ) -> UpdateResult<PathBuf> {
        let (name, version) = package_identity(new_pkg)?;
        info!(
            "delta: creating {name}-{version} delta from {}",
            base_pkg.display()
        );

        let scratch = tempfile::tempdir()?;
        let base_dir = scratch.path().join("base");
        let new_dir = scratch.path().join("new");
        package::extract(base_pkg, &base_dir)?;
        package::extract(new_pkg, &new_dir)?;

        for rel in relative_files(&new_dir)? {
            if !package::is_payload_path(&rel) {
                continue; // metadata travels verbatim
            }
            let new_path = new_dir.join(&rel);
            let base_path = base_dir.join(&rel);
            if !base_path.exists() {
                debug!("delta: {} is new, keeping raw copy", rel.display());
                continue;
            }

            let new_bytes = fs::read(&new_path)?;
            let base_bytes = fs::read(&base_path)?;
            if new_bytes == base_bytes {
                // Unchanged sentinel: empty diff plus empty shasum.
                fs::write(append_extension(&new_path, self.strategy.extension()), b"")?;
                fs::write(append_extension(&new_path, SHASUM_EXTENSION), b"")?;
                fs::remove_file(&new_path)?;
                continue;
            }

            debug!("delta: diffing {}", rel.display());
            let patch = self.strategy.create(&base_bytes, &new_bytes)?;
            fs::write(append_extension(&new_path, self.strategy.extension()), patch)?;
            let mut sidecar =
                fs::File::create(append_extension(&new_path, SHASUM_EXTENSION))?;
            write!(
                sidecar,
                "{} {} {}",
                sha1_hex(&new_bytes).to_uppercase(),
                rel.file_name().unwrap_or_default().to_string_lossy(),
                new_bytes.len()
            )?;
            fs::remove_file(&new_path)?;
        }

        package::amend_content_types_for_delta(&new_dir)?;

        fs::create_dir_all(out_dir)?;
        let out = out_dir.join(package::package_filename(&name, &version, true));
        package::create(&new_dir, &out)?;
        Ok(out)
    }

    /// Reconstruct a full package by applying `delta_pkg` on top of
    /// `base_pkg`. A failed patch never leaves a half-written working file.
    pub fn apply_delta(
        &self,
        delta_pkg: &Path,
        base_pkg: &Path,
        out_dir: &Path,
    ) -> UpdateResult<PathBuf> {
        let (name, version) = package_identity(delta_pkg)?;
        info!(
            "delta: applying {} onto {}",
            delta_pkg.display(),
            base_pkg.display()
        );

        let scratch = tempfile::tempdir()?;
        let delta_dir = scratch.path().join("delta");
        let work_dir = scratch.path().join("work");
        package::extract(delta_pkg, &delta_dir)?;
        package::extract(base_pkg, &work_dir)?;

        // Payload paths the delta accounts for; anything else in the base
        // payload was removed in the new version.
        let mut retained: HashSet<PathBuf> = HashSet::new();

        for rel in relative_files(&delta_dir)? {
            let src = delta_dir.join(&rel);
            let ext = rel
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();

            if !package::is_payload_path(&rel) {
                copy_into(&src, &work_dir.join(&rel))?;
                continue;
            }

            if PATCH_EXTENSIONS.contains(&ext.as_str()) {
                let target_rel = rel.with_extension("");
                retained.insert(target_rel.clone());
                self.patch_working_file(&delta_dir, &work_dir, &rel, &target_rel, &ext)?;
            } else if ext == SHASUM_EXTENSION {
                // Consumed alongside its patch blob.
            } else {
                retained.insert(rel.clone());
                copy_into(&src, &work_dir.join(&rel))?;
            }
        }

        // Removed-file case: payload present in base but absent from the
        // delta's path set.
        for rel in relative_files(&work_dir)? {
            if package::is_payload_path(&rel) && !retained.contains(&rel) {
                debug!("delta: {} removed in new version", rel.display());
                fs::remove_file(work_dir.join(&rel))?;
            }
        }

        fs::create_dir_all(out_dir)?;
        let out = out_dir.join(package::package_filename(&name, &version, false));
        package::create(&work_dir, &out)?;
        Ok(out)
    }

    /// Fold an ascending chain of deltas onto a base full package. Strictly
    /// sequential: every step consumes the previous step's output.
    pub fn fold_chain(
        &self,
        base_full: &Path,
        deltas: &[PathBuf],
        out_dir: &Path,
    ) -> UpdateResult<PathBuf> {
        if deltas.is_empty() {
            return Ok(base_full.to_owned());
        }

        let mut last_version: Option<PackageVersion> = None;
        for delta in deltas {
            let filename = file_name(delta)?;
            if !filename.ends_with("-delta.nupkg") {
                return Err(UpdateError::InvalidPlan {
                    reason: format!("{filename} is not a delta package"),
                });
            }
            let version =
                manifest::version_from_filename(&filename).ok_or(UpdateError::InvalidPlan {
                    reason: format!("{filename} carries no version"),
                })?;
            if let Some(prev) = &last_version
                && &version <= prev
            {
                return Err(UpdateError::InvalidPlan {
                    reason: format!("delta chain is not ascending at {filename}"),
                });
            }
            last_version = Some(version);
        }

        let mut current = base_full.to_owned();
        for delta in deltas {
            current = self.apply_delta(delta, &current, out_dir)?;
        }
        Ok(current)
    }

    fn patch_working_file(
        &self,
        delta_dir: &Path,
        work_dir: &Path,
        patch_rel: &Path,
        target_rel: &Path,
        ext: &str,
    ) -> UpdateResult<()> {
        let target = work_dir.join(target_rel);
        let patch = fs::read(delta_dir.join(patch_rel))?;

        if patch.is_empty() {
            // Unchanged sentinel: the base copy is already correct.
            if !target.exists() {
                return Err(UpdateError::PatchFailed {
                    path: target_rel.to_owned(),
                    message: "unchanged sentinel but base file is missing".into(),
                });
            }
            return Ok(());
        }

        if ext != self.strategy.extension() {
            return Err(UpdateError::PatchFailed {
                path: target_rel.to_owned(),
                message: format!("no diff strategy registered for .{ext} patches"),
            });
        }

        let base_bytes = fs::read(&target).map_err(|e| UpdateError::PatchFailed {
            path: target_rel.to_owned(),
            message: format!("base file unreadable: {e}"),
        })?;
        let new_bytes = self.strategy.apply(&base_bytes, &patch)?;

        let sidecar_path = append_extension(&delta_dir.join(target_rel), SHASUM_EXTENSION);
        let sidecar = fs::read_to_string(&sidecar_path).map_err(|e| UpdateError::PatchFailed {
            path: target_rel.to_owned(),
            message: format!("checksum sidecar unreadable: {e}"),
        })?;
        let (expected_sha1, expected_size) =
            parse_shasum(&sidecar).ok_or_else(|| UpdateError::PatchFailed {
                path: target_rel.to_owned(),
                message: "checksum sidecar malformed".into(),
            })?;

        if new_bytes.len() as u64 != expected_size
            || !sha1_hex(&new_bytes).eq_ignore_ascii_case(&expected_sha1)
        {
            // Discard the attempt; the prior working copy stays in place.
            return Err(UpdateError::ChecksumFailed {
                path: target_rel.to_owned(),
            });
        }

        let parent = target.parent().ok_or_else(|| UpdateError::PatchFailed {
            path: target_rel.to_owned(),
            message: "patch target has no parent directory".into(),
        })?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        staged.write_all(&new_bytes)?;
        staged
            .persist(&target)
            .map_err(|e| UpdateError::PatchFailed {
                path: target_rel.to_owned(),
                message: format!("replace failed: {e}"),
            })?;
        Ok(())
    }
}

fn package_identity(pkg: &Path) -> UpdateResult<(String, PackageVersion)> {
    let filename = file_name(pkg)?;
    let version = manifest::version_from_filename(&filename).ok_or(UpdateError::Package {
        message: format!("package filename carries no version: {filename}"),
    })?;
    Ok((manifest::package_name_from_filename(&filename), version))
}

fn file_name(path: &Path) -> UpdateResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| UpdateError::Package {
            message: format!("not a package path: {}", path.display()),
        })
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn copy_into(src: &Path, dest: &Path) -> UpdateResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(())
}

fn relative_files(root: &Path) -> UpdateResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdateError::Package {
            message: format!("walk error under {}: {e}", root.display()),
        })?;
        if entry.file_type().is_file() {
            files.push(
                entry
                    .path()
                    .strip_prefix(root)
                    .expect("walkdir yields paths under its root")
                    .to_owned(),
            );
        }
    }
    Ok(files)
}

fn parse_shasum(text: &str) -> Option<(String, u64)> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [sha1, _filename, size] = fields.as_slice() else {
        return None;
    };
    if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(((*sha1).to_owned(), size.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Build a package archive from `(relative path, contents)` pairs.
    fn make_package(dir: &Path, filename: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let tree = tempdir().unwrap();
        for (rel, contents) in files {
            let path = tree.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        let out = dir.join(filename);
        package::create(tree.path(), &out).unwrap();
        out
    }

    fn extract_to_map(pkg: &Path) -> Vec<(String, Vec<u8>)> {
        let dir = tempdir().unwrap();
        package::extract(pkg, dir.path()).unwrap();
        let mut entries: Vec<(String, Vec<u8>)> = relative_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|rel| {
                let data = fs::read(dir.path().join(&rel)).unwrap();
                (rel.to_string_lossy().replace('\\', "/"), data)
            })
            .collect();
        entries.sort();
        entries
    }

    const NUSPEC: &[u8] = b"<package><metadata><id>MyApp</id></metadata></package>";

    fn base_and_new(dir: &Path) -> (PathBuf, PathBuf) {
        let base = make_package(
            dir,
            "MyApp-1.0.0-full.nupkg",
            &[
                ("lib/app/stable.bin", b"unchanged payload"),
                ("lib/app/main.bin", b"old main contents"),
                ("lib/app/gone.bin", b"removed in 1.1"),
                ("MyApp.nuspec", NUSPEC),
            ],
        );
        let new = make_package(
            dir,
            "MyApp-1.1.0-full.nupkg",
            &[
                ("lib/app/stable.bin", b"unchanged payload"),
                ("lib/app/main.bin", b"new main contents, longer"),
                ("lib/app/added.bin", b"brand new file"),
                ("MyApp.nuspec", NUSPEC),
            ],
        );
        (base, new)
    }

    #[test]
    fn delta_round_trip_reproduces_new_package() {
        let dir = tempdir().unwrap();
        let (base, new) = base_and_new(dir.path());
        let engine = DeltaEngine::default();

        let delta = engine.create_delta(&base, &new, dir.path()).unwrap();
        assert_eq!(
            delta.file_name().unwrap().to_string_lossy(),
            "MyApp-1.1.0-delta.nupkg"
        );

        let out = dir.path().join("rebuilt");
        let full = engine.apply_delta(&delta, &base, &out).unwrap();
        assert_eq!(
            full.file_name().unwrap().to_string_lossy(),
            "MyApp-1.1.0-full.nupkg"
        );
        assert_eq!(extract_to_map(&full), extract_to_map(&new));
    }

    #[test]
    fn unchanged_files_become_empty_sentinels() {
        let dir = tempdir().unwrap();
        let (base, new) = base_and_new(dir.path());
        let delta = DeltaEngine::default()
            .create_delta(&base, &new, dir.path())
            .unwrap();

        let entries = extract_to_map(&delta);
        let get = |name: &str| {
            entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, data)| data.clone())
        };
        assert_eq!(get("lib/app/stable.bin.diff"), Some(Vec::new()));
        assert_eq!(get("lib/app/stable.bin.shasum"), Some(Vec::new()));
        assert_eq!(get("lib/app/stable.bin"), None);
        // Changed file travels as patch + sidecar, new file travels raw.
        assert!(get("lib/app/main.bin.diff").is_some_and(|d| !d.is_empty()));
        assert!(get("lib/app/main.bin.shasum").is_some_and(|d| !d.is_empty()));
        assert_eq!(get("lib/app/added.bin"), Some(b"brand new file".to_vec()));
        // Removed file has no entry at all.
        assert_eq!(get("lib/app/gone.bin"), None);
        assert_eq!(get("lib/app/gone.bin.diff"), None);
    }

    #[test]
    fn corrupted_sidecar_fails_checksum_and_produces_no_package() {
        let dir = tempdir().unwrap();
        let (base, new) = base_and_new(dir.path());
        let engine = DeltaEngine::default();
        let delta = engine.create_delta(&base, &new, dir.path()).unwrap();

        // Rewrite the sidecar with a wrong hash of the right length.
        let unpacked = tempdir().unwrap();
        package::extract(&delta, unpacked.path()).unwrap();
        fs::write(
            unpacked.path().join("lib/app/main.bin.shasum"),
            format!("{} main.bin 24", "AA".repeat(20)),
        )
        .unwrap();
        let tampered_dir = tempdir().unwrap();
        let tampered = tampered_dir.path().join("MyApp-1.1.0-delta.nupkg");
        package::create(unpacked.path(), &tampered).unwrap();

        let out = dir.path().join("rebuilt");
        let result = engine.apply_delta(&tampered, &base, &out);
        assert!(matches!(result, Err(UpdateError::ChecksumFailed { .. })));
        assert!(!out.join("MyApp-1.1.0-full.nupkg").exists());
    }

    #[test]
    fn folds_chain_sequentially() {
        let dir = tempdir().unwrap();
        let engine = DeltaEngine::default();
        let v1 = make_package(
            dir.path(),
            "MyApp-1.0.0-full.nupkg",
            &[("lib/app/data.bin", b"one"), ("MyApp.nuspec", NUSPEC)],
        );
        let v2 = make_package(
            dir.path(),
            "MyApp-1.1.0-full.nupkg",
            &[("lib/app/data.bin", b"one two"), ("MyApp.nuspec", NUSPEC)],
        );
        let v3 = make_package(
            dir.path(),
            "MyApp-1.2.0-full.nupkg",
            &[("lib/app/data.bin", b"one two three"), ("MyApp.nuspec", NUSPEC)],
        );

        let d12 = engine.create_delta(&v1, &v2, dir.path()).unwrap();
        let d23 = engine.create_delta(&v2, &v3, dir.path()).unwrap();

        let out = dir.path().join("fold");
        let folded = engine
            .fold_chain(&v1, &[d12.clone(), d23.clone()], &out)
            .unwrap();
        assert_eq!(extract_to_map(&folded), extract_to_map(&v3));

        // Reordering the chain must fail validation, not quietly misapply.
        let reordered = engine.fold_chain(&v1, &[d23.clone(), d12.clone()], &out);
        assert!(matches!(reordered, Err(UpdateError::InvalidPlan { .. })));

        // A full package inside the chain is an invariant violation.
        let mixed = engine.fold_chain(&v1, &[d12, v2], &out);
        assert!(matches!(mixed, Err(UpdateError::InvalidPlan { .. })));
    }

    #[test]
    fn empty_chain_returns_base_unchanged() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("MyApp-1.0.0-full.nupkg");
        fs::write(&base, b"not even read").unwrap();
        let result = DeltaEngine::default()
            .fold_chain(&base, &[], dir.path())
            .unwrap();
        assert_eq!(result, base);
    }
}
