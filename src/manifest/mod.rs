use std::io::Write;
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::error::{UpdateError, UpdateResult};
use crate::util::sha1_hex_of_file;

mod version;

pub use version::PackageVersion;

const FULL_SUFFIX: &str = "-full.nupkg";
const DELTA_SUFFIX: &str = "-delta.nupkg";

/// One line of the `RELEASES` manifest: a published package artifact.
///
/// Immutable once constructed; `is_delta`, `version` and `package_name` are
/// derived from the filename at construction time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseEntry {
    sha1: String,
    base_url: Option<String>,
    filename: String,
    query: Option<String>,
    filesize: u64,
    is_delta: bool,
    version: PackageVersion,
    package_name: String,
}

impl ReleaseEntry {
    /// Construct an entry, validating the manifest invariants: a 40-hex sha1
    /// and a filename free of path separators.
    pub fn new(
        sha1: String,
        base_url: Option<String>,
        filename: String,
        query: Option<String>,
        filesize: u64,
    ) -> UpdateResult<Self> {
        if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UpdateError::Package {
                message: format!("malformed sha1 in release entry: {sha1:?}"),
            });
        }
        if filename.contains('/') || filename.contains('\\') {
            return Err(UpdateError::Package {
                message: format!("release filename contains path separators: {filename:?}"),
            });
        }
        let is_delta = filename.ends_with(DELTA_SUFFIX);
        let version = version_from_filename(&filename).ok_or_else(|| UpdateError::Package {
            message: format!("release filename carries no version: {filename:?}"),
        })?;
        let package_name = package_name_from_filename(&filename);

        Ok(Self {
            sha1,
            base_url,
            filename,
            query,
            filesize,
            is_delta,
            version,
            package_name,
        })
    }

    /// Build an entry for a package file on disk by hashing it, the way
    /// entries are minted when a package is published.
    pub fn from_file(path: &Path) -> UpdateResult<Self> {
        let filename = path
            .file_name()
            .ok_or_else(|| UpdateError::Package {
                message: format!("not a package file: {}", path.display()),
            })?
            .to_string_lossy()
            .into_owned();
        let filesize = std::fs::metadata(path)?.len();
        let sha1 = sha1_hex_of_file(path)?;
        Self::new(sha1.to_uppercase(), None, filename, None, filesize)
    }

    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    pub fn version(&self) -> &PackageVersion {
        &self.version
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// The wire form of this entry: `<sha1> <baseUrl?><filename><query?> <filesize>`.
    pub fn entry_as_string(&self) -> String {
        format!(
            "{} {}{}{} {}",
            self.sha1,
            self.base_url.as_deref().unwrap_or(""),
            self.filename,
            self.query.as_deref().unwrap_or(""),
            self.filesize
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [sha1, name, size] = fields.as_slice() else {
            return None;
        };
        let filesize = size.parse::<u64>().ok()?;

        let (base_url, rest) = if name.starts_with("http://") || name.starts_with("https://") {
            let split_at = name.rfind('/')? + 1;
            (Some(name[..split_at].to_owned()), &name[split_at..])
        } else {
            (None, *name)
        };
        let (filename, query) = match rest.split_once('?') {
            Some((file, query)) => (file.to_owned(), Some(format!("?{query}"))),
            None => (rest.to_owned(), None),
        };

        Self::new((*sha1).to_owned(), base_url, filename, query, filesize).ok()
    }
}

/// Parse manifest text into release entries.
///
/// A byte-order mark and trailing `#` comments are stripped, blank lines are
/// skipped, and a file starting with an XML prolog is treated as empty
/// (legacy-format guard). Any malformed line degrades the whole parse to an
/// empty list: a corrupt manifest reads as "no remote info", never an error.
pub fn parse(text: &str) -> Vec<ReleaseEntry> {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim_start().starts_with("<?xml") {
        warn!("manifest: XML content where RELEASES expected; treating as empty");
        return Vec::new();
    }

    let mut entries = Vec::new();
    for line in text.lines() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match ReleaseEntry::parse_line(line) {
            Some(entry) => entries.push(entry),
            None => {
                warn!("manifest: malformed line {line:?}; discarding manifest");
                return Vec::new();
            }
        }
    }
    entries
}

/// Write entries in the canonical order: version ascending, delta before full.
pub fn write(entries: &[ReleaseEntry], sink: &mut impl Write) -> std::io::Result<()> {
    let mut sorted: Vec<&ReleaseEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| b.is_delta.cmp(&a.is_delta))
    });
    let text = sorted
        .iter()
        .map(|entry| entry.entry_as_string())
        .collect::<Vec<_>>()
        .join("\n");
    sink.write_all(text.as_bytes())
}

/// The maximum-version full entry, or `None` for an empty or all-delta list.
pub fn find_current_version(entries: &[ReleaseEntry]) -> Option<&ReleaseEntry> {
    entries
        .iter()
        .filter(|entry| !entry.is_delta)
        .max_by(|a, b| a.version.cmp(&b.version))
}

pub(crate) fn version_from_filename(filename: &str) -> Option<PackageVersion> {
    let stem = filename
        .strip_suffix(FULL_SUFFIX)
        .or_else(|| filename.strip_suffix(DELTA_SUFFIX))
        .or_else(|| filename.strip_suffix(".nupkg"))
        .unwrap_or(filename);

    // The version starts at the first dash-separated segment that leads with
    // a digit; everything before it is the package name.
    let mut search = 0;
    while let Some(offset) = stem[search..].find('-') {
        let idx = search + offset + 1;
        if stem[idx..].starts_with(|c: char| c.is_ascii_digit()) {
            return PackageVersion::parse(&stem[idx..]);
        }
        search = idx;
    }
    None
}

pub(crate) fn package_name_from_filename(filename: &str) -> String {
    filename
        .split(['-', '.'])
        .next()
        .unwrap_or(filename)
        .to_owned()
}
