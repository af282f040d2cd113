use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

use crate::apply::ApplyEngine;
use crate::download::{Downloader, UpdateSource};
use crate::env;
use crate::error::UpdateResult;
use crate::lock::InstanceLock;
use crate::manifest::{self, PackageVersion, ReleaseEntry};
use crate::planner::{self, UpdateInfo};
use crate::util::ProgressReporter;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress split across the phases of a full update run.
const CHECK_DONE: u8 = 10;
const DOWNLOAD_DONE: u8 = 60;

/// Facade over the whole update pipeline: manifest check, package download,
/// delta resolution, and install, all under one [`InstanceLock`].
///
/// Progress is reported as a monotonic 0 to 100 percentage: the check phase
/// covers 0-10, downloads 10-60, and resolution plus install 60-100.
pub struct UpdateEngine {
    root: PathBuf,
    source: UpdateSource,
    package_id: Option<String>,
    downloader: Downloader,
    apply: ApplyEngine,
    lock_timeout: Duration,
}

impl UpdateEngine {
    pub fn new(root: &Path, source: UpdateSource) -> Self {
        Self {
            root: root.to_owned(),
            source,
            package_id: None,
            downloader: Downloader::new(),
            apply: ApplyEngine::new(root),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Package id passed along to HTTP feeds for server-side filtering.
    pub fn with_package_id(mut self, id: &str) -> Self {
        self.package_id = Some(id.to_owned());
        self
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_apply_engine(mut self, apply: ApplyEngine) -> Self {
        self.apply = apply;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Compare the local manifest against the feed and plan what to apply.
    pub async fn check_for_update(&self, ignore_delta_updates: bool) -> UpdateResult<UpdateInfo> {
        let local = self.read_local_releases();
        let local_version = manifest::find_current_version(&local)
            .map(|e| e.version().clone());
        let remote = self
            .downloader
            .fetch_release_entries(&self.source, self.package_id.as_deref(), local_version.as_ref())
            .await?;
        planner::determine_update_info(
            &local,
            &remote,
            &env::packages_dir(&self.root),
            ignore_delta_updates,
        )
    }

    /// Download every package the plan names into the packages directory.
    pub async fn download_releases(
        &self,
        info: &UpdateInfo,
        on_progress: Option<&mut (dyn FnMut(u8) + Send)>,
    ) -> UpdateResult<Vec<PathBuf>> {
        let mut progress = ProgressReporter::new(on_progress);
        self.downloader
            .fetch_packages(info, &self.source, |done, total| {
                progress.report_scaled(done, total, 0, 100);
            })
            .await
    }

    /// Apply an already-downloaded plan under the instance lock.
    pub async fn apply_releases(
        &self,
        info: &UpdateInfo,
        on_progress: Option<&mut (dyn FnMut(u8) + Send)>,
    ) -> UpdateResult<PackageVersion> {
        let lock = InstanceLock::acquire(&self.root, self.lock_timeout).await?;
        let mut progress = ProgressReporter::new(on_progress);
        let result = self.apply.apply(info, &mut progress).await;
        release_quietly(lock);
        result
    }

    /// Run the whole cycle: check, download, resolve, install. When a delta
    /// chain fails for delta-specific reasons (bad checksum, unusable patch,
    /// broken chain) the cycle is retried once with deltas ignored; any other
    /// failure propagates as is.
    pub async fn full_update(
        &self,
        on_progress: Option<&mut (dyn FnMut(u8) + Send)>,
    ) -> UpdateResult<PackageVersion> {
        env::ensure_layout(&self.root)?;
        let lock = InstanceLock::acquire(&self.root, self.lock_timeout).await?;
        let mut progress = ProgressReporter::new(on_progress);

        let result = match self.run_cycle(false, &mut progress).await {
            Err(err) if err.is_delta_specific() => {
                warn!("engine: delta update failed ({err}); retrying with full packages only");
                self.run_cycle(true, &mut progress).await
            }
            other => other,
        };

        release_quietly(lock);
        result
    }

    async fn run_cycle(
        &self,
        ignore_delta_updates: bool,
        progress: &mut ProgressReporter<'_>,
    ) -> UpdateResult<PackageVersion> {
        let info = self.check_for_update(ignore_delta_updates).await?;
        progress.report(CHECK_DONE);

        if !info.is_noop() {
            self.downloader
                .fetch_packages(&info, &self.source, |done, total| {
                    progress.report_scaled(done, total, CHECK_DONE, DOWNLOAD_DONE);
                })
                .await?;
        }
        progress.report(DOWNLOAD_DONE);

        self.apply.apply(&info, progress).await
    }

    /// Remove the installation entirely.
    pub async fn full_uninstall(&self) -> UpdateResult<()> {
        let lock = InstanceLock::acquire(&self.root, self.lock_timeout).await?;
        let result = self.apply.full_uninstall().await;
        release_quietly(lock);
        result
    }

    fn read_local_releases(&self) -> Vec<ReleaseEntry> {
        let path = env::local_releases_path(&self.root);
        match fs::read_to_string(&path) {
            Ok(text) => manifest::parse(&text),
            Err(_) => {
                info!("engine: no local manifest at {}", path.display());
                Vec::new()
            }
        }
    }
}

fn release_quietly(lock: InstanceLock) {
    if let Err(err) = lock.release() {
        warn!("engine: releasing the instance lock failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaEngine;
    use crate::error::UpdateError;
    use crate::package;
    use std::io::Write as _;
    use tempfile::tempdir;

    const NUSPEC: &[u8] = b"<package><metadata><id>MyApp</id></metadata></package>";

    /// Bytes that deflate cannot shrink, so package sizes track content sizes.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491_u64;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn make_full_package(dir: &Path, version: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let tree = tempdir().unwrap();
        for (rel, contents) in files {
            let path = tree.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        fs::write(tree.path().join("MyApp.nuspec"), NUSPEC).unwrap();
        let out = dir.join(format!("MyApp-{version}-full.nupkg"));
        package::create(tree.path(), &out).unwrap();
        out
    }

    fn write_feed_manifest(feed: &Path, packages: &[&PathBuf]) {
        let entries: Vec<ReleaseEntry> = packages
            .iter()
            .map(|p| ReleaseEntry::from_file(p).unwrap())
            .collect();
        let mut file = fs::File::create(feed.join(env::RELEASES_FILE)).unwrap();
        manifest::write(&entries, &mut file).unwrap();
        file.flush().unwrap();
    }

    fn engine_for(root: &Path, feed: &Path) -> UpdateEngine {
        UpdateEngine::new(root, UpdateSource::LocalDir(feed.to_owned()))
            .with_lock_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn full_update_bootstraps_from_a_folder_feed() {
        let feed = tempdir().unwrap();
        let root = tempdir().unwrap();
        let pkg = make_full_package(feed.path(), "1.0.0", &[("lib/app/data.bin", b"payload")]);
        write_feed_manifest(feed.path(), &[&pkg]);

        let mut ticks: Vec<u8> = Vec::new();
        let mut callback = |p: u8| ticks.push(p);
        let version = engine_for(root.path(), feed.path())
            .full_update(Some(&mut callback))
            .await
            .unwrap();

        assert_eq!(version.to_string(), "1.0.0");
        assert_eq!(
            fs::read(root.path().join("app-1.0.0/data.bin")).unwrap(),
            b"payload"
        );
        assert!(ticks.is_sorted());
        assert_eq!(ticks.last(), Some(&100));

        // The local manifest now pins the installed version.
        let check = engine_for(root.path(), feed.path())
            .check_for_update(false)
            .await
            .unwrap();
        assert!(check.is_noop());
    }

    #[tokio::test]
    async fn second_full_update_is_a_noop_returning_current_version() {
        let feed = tempdir().unwrap();
        let root = tempdir().unwrap();
        let pkg = make_full_package(feed.path(), "2.1.0", &[("lib/app/a.bin", b"a")]);
        write_feed_manifest(feed.path(), &[&pkg]);

        let engine = engine_for(root.path(), feed.path());
        engine.full_update(None).await.unwrap();
        let version = engine.full_update(None).await.unwrap();
        assert_eq!(version.to_string(), "2.1.0");
    }

    #[tokio::test]
    async fn corrupt_delta_falls_back_to_the_full_package() {
        let feed = tempdir().unwrap();
        let root = tempdir().unwrap();
        env::ensure_layout(root.path()).unwrap();

        // Shared bulk keeps the delta far cheaper than the full package.
        let bulk = noise(32 * 1024);
        let v1 = make_full_package(
            feed.path(),
            "1.0.0",
            &[("lib/app/bulk.bin", bulk.as_slice()), ("lib/app/data.bin", b"one")],
        );
        let v2 = make_full_package(
            feed.path(),
            "1.1.0",
            &[("lib/app/bulk.bin", bulk.as_slice()), ("lib/app/data.bin", b"one two")],
        );
        let delta = DeltaEngine::default()
            .create_delta(&v1, &v2, feed.path())
            .unwrap();

        // Corrupt the delta's checksum sidecar so applying it must fail.
        let unpacked = tempdir().unwrap();
        package::extract(&delta, unpacked.path()).unwrap();
        fs::write(
            unpacked.path().join("lib/app/data.bin.shasum"),
            format!("{} data.bin 7", "AA".repeat(20)),
        )
        .unwrap();
        package::create(unpacked.path(), &delta).unwrap();
        write_feed_manifest(feed.path(), &[&v1, &delta, &v2]);

        // Simulate an existing 1.0.0 install: app dir, base package, manifest.
        fs::create_dir(root.path().join("app-1.0.0")).unwrap();
        let packages = env::packages_dir(root.path());
        fs::copy(&v1, packages.join("MyApp-1.0.0-full.nupkg")).unwrap();
        write_feed_manifest(&packages, &[&v1]);

        let engine = engine_for(root.path(), feed.path());
        let check = engine.check_for_update(false).await.unwrap();
        assert!(check.is_delta_plan(), "fixture must plan a delta chain");

        let version = engine.full_update(None).await.unwrap();
        assert_eq!(version.to_string(), "1.1.0");
        assert_eq!(
            fs::read(root.path().join("app-1.1.0/data.bin")).unwrap(),
            b"one two"
        );
    }

    #[tokio::test]
    async fn concurrent_full_update_times_out_on_the_lock() {
        let feed = tempdir().unwrap();
        let root = tempdir().unwrap();
        env::ensure_layout(root.path()).unwrap();
        let pkg = make_full_package(feed.path(), "1.0.0", &[("lib/app/a.bin", b"a")]);
        write_feed_manifest(feed.path(), &[&pkg]);

        let held = InstanceLock::acquire(root.path(), Duration::from_millis(100))
            .await
            .unwrap();
        let result = engine_for(root.path(), feed.path()).full_update(None).await;
        assert!(matches!(result, Err(UpdateError::LockTimeout)));
        held.release().unwrap();
    }

    #[tokio::test]
    async fn folder_feed_without_manifest_is_synthesized() {
        let feed = tempdir().unwrap();
        let root = tempdir().unwrap();
        make_full_package(feed.path(), "3.0.0", &[("lib/app/a.bin", b"a")]);

        let info = engine_for(root.path(), feed.path())
            .check_for_update(false)
            .await
            .unwrap();
        assert!(info.is_bootstrap());
        assert_eq!(
            info.future_release_entry().unwrap().filename(),
            "MyApp-3.0.0-full.nupkg"
        );
    }
}
