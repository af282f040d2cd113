use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::env::RELEASES_FILE;
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{self, PackageVersion, ReleaseEntry};
use crate::planner::UpdateInfo;
use crate::util::{RetryPolicy, sha1_hex_of_file};

pub const DEFAULT_PARALLELISM: usize = 4;

/// Where a release channel lives: an HTTP endpoint or a plain folder.
#[derive(Clone, Debug)]
pub enum UpdateSource {
    Http(String),
    LocalDir(PathBuf),
}

impl UpdateSource {
    pub fn from_location(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Http(location.trim_end_matches('/').to_owned())
        } else {
            Self::LocalDir(PathBuf::from(location))
        }
    }
}

/// Fetches manifests and planned package artifacts with bounded parallelism
/// and content-addressed verification.
pub struct Downloader {
    client: Client,
    parallelism: usize,
    retry: RetryPolicy,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .unwrap_or_else(|err| {
                warn!("download: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::network(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Fetch the channel manifest. A missing or corrupt remote manifest
    /// degrades to an empty list; for a local folder channel without a
    /// `RELEASES` file the manifest is synthesized from the packages present.
    pub async fn fetch_release_entries(
        &self,
        source: &UpdateSource,
        package_id: Option<&str>,
        local_version: Option<&PackageVersion>,
    ) -> UpdateResult<Vec<ReleaseEntry>> {
        match source {
            UpdateSource::Http(base) => {
                let url = releases_url(base, package_id, local_version);
                debug!("download: fetching manifest from {url}");
                let text = self.fetch_text_with_case_fallback(&url).await?;
                Ok(manifest::parse(&text))
            }
            UpdateSource::LocalDir(dir) => {
                let path = dir.join(RELEASES_FILE);
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => Ok(manifest::parse(&text)),
                    Err(_) => synthesize_release_entries(dir),
                }
            }
        }
    }

    /// Single-file fetch used for the manifest itself: one retry with a
    /// lowercased URL absorbs feeds published behind case-mangling hosts,
    /// then the failure propagates.
    pub async fn fetch_text_with_case_fallback(&self, url: &str) -> UpdateResult<String> {
        match self.fetch_text(url).await {
            Ok(text) => Ok(text),
            Err(err) => {
                let lowered = url.to_lowercase();
                warn!("download: {url} failed ({err}); retrying as {lowered}");
                self.fetch_text(&lowered).await
            }
        }
    }

    /// Download every artifact in the plan into the plan's package directory,
    /// verifying size and SHA1 per entry. `on_bytes(done, total)` is called
    /// as entries complete. On the first failure, siblings already in flight
    /// are driven to completion but nothing queued behind them is started;
    /// the failure is then surfaced.
    pub async fn fetch_packages(
        &self,
        plan: &UpdateInfo,
        source: &UpdateSource,
        mut on_bytes: impl FnMut(u64, u64),
    ) -> UpdateResult<Vec<PathBuf>> {
        let entries = plan.releases_to_apply();
        let dest_dir = plan.package_directory().to_owned();
        tokio::fs::create_dir_all(&dest_dir).await?;

        let total: u64 = entries.iter().map(ReleaseEntry::filesize).sum();
        let mut done: u64 = 0;
        on_bytes(0, total);

        let mut results: Vec<Option<PathBuf>> = vec![None; entries.len()];
        let mut first_failure: Option<UpdateError> = None;

        // Futures are inert until polled; only those moved into the in-flight
        // set run.
        let mut queue = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let dest_dir = dest_dir.clone();
                async move {
                    let outcome = self.fetch_one(entry, source, &dest_dir).await;
                    (index, entry, outcome)
                }
            })
            .collect::<Vec<_>>()
            .into_iter();
        let mut in_flight: FuturesUnordered<_> =
            queue.by_ref().take(self.parallelism).collect();

        while let Some((index, entry, outcome)) = in_flight.next().await {
            match outcome {
                Ok(path) => {
                    done += entry.filesize();
                    on_bytes(done, total);
                    results[index] = Some(path);
                }
                Err(err) => {
                    warn!("download: {} failed: {err}", entry.filename());
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
            if first_failure.is_none()
                && let Some(next) = queue.next()
            {
                in_flight.push(next);
            }
        }

        if let Some(err) = first_failure {
            return Err(err);
        }
        Ok(results.into_iter().flatten().collect())
    }

    async fn fetch_one(
        &self,
        entry: &ReleaseEntry,
        source: &UpdateSource,
        dest_dir: &Path,
    ) -> UpdateResult<PathBuf> {
        let dest = dest_dir.join(entry.filename());

        if verify_entry(&dest, entry).is_ok() {
            info!("download: cache hit for {}", entry.filename());
            return Ok(dest);
        }
        // Stale or partial leftover from an interrupted run.
        if dest.exists() {
            debug!("download: removing stale partial {}", dest.display());
            tokio::fs::remove_file(&dest).await?;
        }

        match source {
            UpdateSource::Http(base) => {
                let url = entry_url(base, entry);
                self.retry
                    .run(entry.filename(), || self.download_to_path(&url, &dest))
                    .await?;
            }
            UpdateSource::LocalDir(dir) => {
                tokio::fs::copy(dir.join(entry.filename()), &dest).await?;
            }
        }

        if let Err(err) = verify_entry(&dest, entry) {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(err);
        }
        info!("download: completed {}", entry.filename());
        Ok(dest)
    }

    async fn fetch_text(&self, url: &str) -> UpdateResult<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::ServerStatus {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }
        Ok(response.text().await?)
    }

    async fn download_to_path(&self, url: &str, dest: &Path) -> UpdateResult<()> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::ServerStatus {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Exact-size and case-insensitive SHA1 check against the manifest entry.
fn verify_entry(path: &Path, entry: &ReleaseEntry) -> UpdateResult<()> {
    let metadata = std::fs::metadata(path).map_err(|_| UpdateError::ChecksumFailed {
        path: path.to_owned(),
    })?;
    if metadata.len() != entry.filesize() {
        return Err(UpdateError::ChecksumFailed {
            path: path.to_owned(),
        });
    }
    let actual = sha1_hex_of_file(path)?;
    if !actual.eq_ignore_ascii_case(entry.sha1()) {
        return Err(UpdateError::ChecksumFailed {
            path: path.to_owned(),
        });
    }
    Ok(())
}

fn releases_url(
    base: &str,
    package_id: Option<&str>,
    local_version: Option<&PackageVersion>,
) -> String {
    let mut url = format!("{}/{}", base.trim_end_matches('/'), RELEASES_FILE);
    let mut params = Vec::new();
    if let Some(id) = package_id {
        params.push(format!("id={id}"));
    }
    if let Some(version) = local_version {
        params.push(format!("localVersion={version}"));
    }
    if !params.is_empty() {
        params.push(format!("arch={}", arch_key()));
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

fn entry_url(base: &str, entry: &ReleaseEntry) -> String {
    let mut url = match entry.base_url() {
        Some(absolute) => format!("{absolute}{}", entry.filename()),
        None => format!("{}/{}", base.trim_end_matches('/'), entry.filename()),
    };
    if let Some(query) = entry.query() {
        url.push_str(query);
    }
    url
}

/// Synthesize manifest entries from the packages sitting in a channel folder
/// that has no `RELEASES` file yet.
fn synthesize_release_entries(dir: &Path) -> UpdateResult<Vec<ReleaseEntry>> {
    info!(
        "download: no {RELEASES_FILE} in {}; synthesizing from packages",
        dir.display()
    );
    let mut entries = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name();
        if name.to_string_lossy().ends_with(".nupkg")
            && let Ok(entry) = ReleaseEntry::from_file(&item.path())
        {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| a.version().cmp(b.version()));
    Ok(entries)
}

fn arch_key() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "x86"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sha1_hex;
    use std::fs;
    use tempfile::tempdir;

    fn entry_for(dir: &Path, filename: &str, contents: &[u8]) -> ReleaseEntry {
        fs::write(dir.join(filename), contents).unwrap();
        ReleaseEntry::from_file(&dir.join(filename)).unwrap()
    }

    fn plan_for(entries: Vec<ReleaseEntry>, packages: &Path) -> UpdateInfo {
        UpdateInfo::new(None, entries, packages.to_owned()).unwrap()
    }

    #[test]
    fn builds_release_urls() {
        let version = PackageVersion::new(1, 2, 0);
        let url = releases_url("https://example.com/feed/", Some("MyApp"), Some(&version));
        assert!(url.starts_with("https://example.com/feed/RELEASES?id=MyApp&localVersion=1.2.0&arch="));
        assert_eq!(
            releases_url("https://example.com/feed", None, None),
            "https://example.com/feed/RELEASES"
        );
    }

    #[test]
    fn builds_entry_urls_with_base_and_query() {
        let sha = "94689FEDE6E6E0CE143EEB236F4A984A83F12E94";
        let relative =
            ReleaseEntry::new(sha.into(), None, "MyApp-1.0.0-full.nupkg".into(), None, 1).unwrap();
        assert_eq!(
            entry_url("https://example.com/feed/", &relative),
            "https://example.com/feed/MyApp-1.0.0-full.nupkg"
        );

        let absolute = ReleaseEntry::new(
            sha.into(),
            Some("https://cdn.example.com/drop/".into()),
            "MyApp-1.0.0-full.nupkg".into(),
            Some("?token=abc".into()),
            1,
        )
        .unwrap();
        assert_eq!(
            entry_url("https://example.com/feed/", &absolute),
            "https://cdn.example.com/drop/MyApp-1.0.0-full.nupkg?token=abc"
        );
    }

    #[tokio::test]
    async fn local_channel_without_releases_synthesizes_manifest() {
        let channel = tempdir().unwrap();
        entry_for(channel.path(), "MyApp-1.0.0-full.nupkg", b"v1 bytes");
        entry_for(channel.path(), "MyApp-1.1.0-full.nupkg", b"v1.1 bytes");
        fs::write(channel.path().join("notes.txt"), b"ignored").unwrap();

        let downloader = Downloader::new();
        let source = UpdateSource::LocalDir(channel.path().to_owned());
        let entries = downloader
            .fetch_release_entries(&source, None, None)
            .await
            .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename()).collect();
        assert_eq!(
            names,
            vec!["MyApp-1.0.0-full.nupkg", "MyApp-1.1.0-full.nupkg"]
        );
        assert_eq!(entries[0].sha1().to_lowercase(), sha1_hex(b"v1 bytes"));
    }

    #[tokio::test]
    async fn fetches_and_verifies_planned_packages() {
        let channel = tempdir().unwrap();
        let packages = tempdir().unwrap();
        let _full = entry_for(channel.path(), "MyApp-1.0.0-full.nupkg", b"payload one");
        let delta = entry_for(channel.path(), "MyApp-1.1.0-delta.nupkg", b"payload two");

        let plan = plan_for(vec![delta], packages.path());
        let downloader = Downloader::new().with_parallelism(2);
        let source = UpdateSource::LocalDir(channel.path().to_owned());

        let mut ticks = Vec::new();
        let paths = downloader
            .fetch_packages(&plan, &source, |done, total| ticks.push((done, total)))
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(
            fs::read(&paths[0]).unwrap(),
            b"payload two",
            "verified file lands in the package directory"
        );
        assert_eq!(ticks.last().unwrap().0, ticks.last().unwrap().1);
    }

    #[tokio::test]
    async fn corrupted_channel_file_fails_checksum_and_is_deleted() {
        let channel = tempdir().unwrap();
        let packages = tempdir().unwrap();
        let entry = entry_for(channel.path(), "MyApp-1.0.0-full.nupkg", b"good bytes");
        // Corrupt the channel copy after hashing.
        fs::write(channel.path().join("MyApp-1.0.0-full.nupkg"), b"bad bytes!").unwrap();

        let downloader = Downloader::new();
        let source = UpdateSource::LocalDir(channel.path().to_owned());
        let plan = plan_for(vec![entry], packages.path());

        let result = downloader.fetch_packages(&plan, &source, |_, _| {}).await;
        assert!(matches!(result, Err(UpdateError::ChecksumFailed { .. })));
        assert!(!packages.path().join("MyApp-1.0.0-full.nupkg").exists());
    }

    #[tokio::test]
    async fn failure_stops_starting_queued_downloads() {
        let channel = tempdir().unwrap();
        let packages = tempdir().unwrap();
        let first = entry_for(channel.path(), "MyApp-1.1.0-delta.nupkg", b"first");
        let second = entry_for(channel.path(), "MyApp-1.2.0-delta.nupkg", b"second");
        let third = entry_for(channel.path(), "MyApp-1.3.0-delta.nupkg", b"third");
        // Corrupt the first entry's channel copy after hashing.
        fs::write(channel.path().join("MyApp-1.1.0-delta.nupkg"), b"tampered").unwrap();

        let plan = plan_for(vec![first, second, third], packages.path());
        let downloader = Downloader::new().with_parallelism(1);
        let source = UpdateSource::LocalDir(channel.path().to_owned());

        let result = downloader.fetch_packages(&plan, &source, |_, _| {}).await;
        assert!(matches!(result, Err(UpdateError::ChecksumFailed { .. })));
        assert!(!packages.path().join("MyApp-1.2.0-delta.nupkg").exists());
        assert!(!packages.path().join("MyApp-1.3.0-delta.nupkg").exists());
    }

    #[tokio::test]
    async fn stale_partial_download_is_replaced() {
        let channel = tempdir().unwrap();
        let packages = tempdir().unwrap();
        let entry = entry_for(channel.path(), "MyApp-1.0.0-full.nupkg", b"full contents");
        fs::write(packages.path().join("MyApp-1.0.0-full.nupkg"), b"trunc").unwrap();

        let downloader = Downloader::new();
        let source = UpdateSource::LocalDir(channel.path().to_owned());
        let plan = plan_for(vec![entry], packages.path());

        let paths = downloader
            .fetch_packages(&plan, &source, |_, _| {})
            .await
            .unwrap();
        assert_eq!(fs::read(&paths[0]).unwrap(), b"full contents");
    }
}
