use std::io::Read;
use std::path::Path;
use std::time::Duration;

use log::warn;
use sha1::{Digest, Sha1};

use crate::error::UpdateResult;

/// SHA1 of a byte slice as lowercase hex.
pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// SHA1 of a file as lowercase hex, streamed in fixed-size chunks.
pub fn sha1_hex_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Declarative retry policy applied uniformly at call sites.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Policy for transient network failures.
    pub const fn network() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Policy for file operations racing with virus scanners and stale handles.
    pub const fn file_ops() -> Self {
        Self::new(3, Duration::from_millis(250))
    }

    /// Run `op` until it succeeds or the attempts are exhausted, sleeping the
    /// backoff between tries. The final error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> UpdateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = UpdateResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts => {
                    warn!("{label}: attempt {attempt}/{} failed ({err}); retrying", self.attempts);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Blocking flavor for the apply/cleanup paths that work on plain files.
    pub fn run_blocking<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts => {
                    warn!("{label}: attempt {attempt}/{} failed ({err}); retrying", self.attempts);
                    std::thread::sleep(self.backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Progress sink for one update operation: integer percent, 0–100,
/// monotonically non-decreasing. Regressions from overlapping phases are
/// clamped away rather than reported.
pub struct ProgressReporter<'a> {
    callback: Option<&'a mut (dyn FnMut(u8) + Send)>,
    last: u8,
    emitted: bool,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(callback: Option<&'a mut (dyn FnMut(u8) + Send)>) -> Self {
        Self {
            callback,
            last: 0,
            emitted: false,
        }
    }

    pub fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent < self.last || (percent == self.last && self.emitted) {
            return;
        }
        self.last = percent;
        self.emitted = true;
        if let Some(cb) = self.callback.as_deref_mut() {
            cb(percent);
        }
    }

    /// Map a `done / total` ratio into the `[lo, hi]` slice of the operation.
    pub fn report_scaled(&mut self, done: u64, total: u64, lo: u8, hi: u8) {
        if total == 0 {
            return;
        }
        let span = u64::from(hi.saturating_sub(lo));
        let scaled = lo as u64 + (done.min(total) * span) / total;
        self.report(scaled as u8);
    }
}
