use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::PackageVersion;

/// Root of the installable payload inside a package. Everything else in the
/// archive is package metadata and is never diffed.
pub const PAYLOAD_ROOT: &str = "lib";

const CONTENT_TYPES_FILE: &str = "[Content_Types].xml";

pub fn package_filename(name: &str, version: &PackageVersion, delta: bool) -> String {
    let kind = if delta { "delta" } else { "full" };
    format!("{name}-{version}-{kind}.nupkg")
}

/// Whether an archive-relative path is part of the installable payload.
pub fn is_payload_path(rel: &Path) -> bool {
    rel.components()
        .next()
        .map(|c| c.as_os_str() == PAYLOAD_ROOT)
        .unwrap_or(false)
}

/// Map a payload path to its install-directory-relative location by stripping
/// `lib/<framework>/`. Non-payload paths map to `None`.
pub fn install_relative_path(rel: &Path) -> Option<PathBuf> {
    if !is_payload_path(rel) {
        return None;
    }
    let remainder: PathBuf = rel.components().skip(2).collect();
    (!remainder.as_os_str().is_empty()).then_some(remainder)
}

/// Extract a zip package into `dest`.
pub fn extract(archive_path: &Path, dest: &Path) -> UpdateResult<()> {
    let file = fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| UpdateError::Package {
        message: format!("zip parse error in {}: {e}", archive_path.display()),
    })?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| UpdateError::Package {
            message: format!("zip entry error: {e}"),
        })?;
        let out_path = dest.join(entry.mangled_name());
        if entry.name().ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Archive a directory tree into a zip package at `archive_path`.
pub fn create(src_dir: &Path, archive_path: &Path) -> UpdateResult<()> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(archive_path)?;
    let mut writer = ZipWriter::new(file);
    let base_options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdateError::Package {
            message: format!("walk error under {}: {e}", src_dir.display()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .expect("walkdir yields paths under its root");
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        // Executables must stay executable after the install round trip.
        #[cfg(unix)]
        let options = {
            use std::os::unix::fs::PermissionsExt;
            base_options.unix_permissions(entry.metadata().map(|m| m.permissions().mode()).unwrap_or(0o644))
        };
        #[cfg(not(unix))]
        let options = base_options;
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| UpdateError::Package {
                message: format!("zip write error for {name}: {e}"),
            })?;
        let mut src = fs::File::open(entry.path())?;
        io::copy(&mut src, &mut writer)?;
    }

    writer.finish().map_err(|e| UpdateError::Package {
        message: format!("zip finish error: {e}"),
    })?;
    Ok(())
}

/// Declare the delta sidecar extensions in an extracted package's
/// `[Content_Types].xml` so the delta archive stays a well-formed package.
/// Packages without a content-types manifest are left alone.
pub fn amend_content_types_for_delta(extract_dir: &Path) -> UpdateResult<()> {
    let path = extract_dir.join(CONTENT_TYPES_FILE);
    if !path.exists() {
        return Ok(());
    }
    let mut text = fs::read_to_string(&path)?;
    for ext in ["diff", "bsdiff", "shasum"] {
        let node = format!(
            "<Default Extension=\"{ext}\" ContentType=\"application/octet-stream\" />"
        );
        if text.contains(&node) {
            continue;
        }
        let Some(idx) = text.rfind("</Types>") else {
            return Err(UpdateError::Package {
                message: format!("malformed {CONTENT_TYPES_FILE} in {}", extract_dir.display()),
            });
        };
        text.insert_str(idx, &node);
    }
    fs::write(&path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classifies_payload_paths() {
        assert!(is_payload_path(Path::new("lib/app/MyApp.exe")));
        assert!(!is_payload_path(Path::new("MyApp.nuspec")));
        assert!(!is_payload_path(Path::new("[Content_Types].xml")));
    }

    #[test]
    fn install_path_strips_payload_framework_prefix() {
        assert_eq!(
            install_relative_path(Path::new("lib/app/plugins/tool.exe")),
            Some(PathBuf::from("plugins/tool.exe"))
        );
        assert_eq!(install_relative_path(Path::new("MyApp.nuspec")), None);
        assert_eq!(install_relative_path(Path::new("lib/app")), None);
    }

    #[test]
    fn names_package_files() {
        let version = PackageVersion::new(1, 2, 3);
        assert_eq!(
            package_filename("MyApp", &version, false),
            "MyApp-1.2.3-full.nupkg"
        );
        assert_eq!(
            package_filename("MyApp", &version, true),
            "MyApp-1.2.3-delta.nupkg"
        );
    }

    #[test]
    fn round_trips_a_directory_tree() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib/app/sub")).unwrap();
        fs::write(src.path().join("lib/app/a.bin"), b"alpha").unwrap();
        fs::write(src.path().join("lib/app/sub/b.bin"), b"beta").unwrap();
        fs::write(src.path().join("meta.nuspec"), b"<spec/>").unwrap();

        let out = tempdir().unwrap();
        let archive = out.path().join("pkg.nupkg");
        create(src.path(), &archive).unwrap();

        let dest = tempdir().unwrap();
        extract(&archive, dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("lib/app/a.bin")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(dest.path().join("lib/app/sub/b.bin")).unwrap(),
            b"beta"
        );
        assert_eq!(fs::read(dest.path().join("meta.nuspec")).unwrap(), b"<spec/>");
    }

    #[test]
    fn amends_content_types_once() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONTENT_TYPES_FILE),
            "<Types><Default Extension=\"dll\" ContentType=\"application/octet\" /></Types>",
        )
        .unwrap();

        amend_content_types_for_delta(dir.path()).unwrap();
        amend_content_types_for_delta(dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join(CONTENT_TYPES_FILE)).unwrap();
        assert_eq!(text.matches("Extension=\"diff\"").count(), 1);
        assert_eq!(text.matches("Extension=\"bsdiff\"").count(), 1);
        assert_eq!(text.matches("Extension=\"shasum\"").count(), 1);
        assert!(text.ends_with("</Types>"));
    }

    #[test]
    fn missing_content_types_is_tolerated() {
        let dir = tempdir().unwrap();
        amend_content_types_for_delta(dir.path()).unwrap();
    }
}
