use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the update engine.
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

/// Errors surfaced by update operations.
///
/// Manifest corruption is deliberately absent: a corrupt `RELEASES` file
/// degrades to an empty entry list instead of raising, so a bad feed reads as
/// "no remote info".
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no full release found in the remote feed")]
    NoFullReleaseFound,

    #[error("checksum verification failed for {path}")]
    ChecksumFailed { path: PathBuf },

    #[error("invalid update plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("timed out acquiring update lock: another instance may be running updates")]
    LockTimeout,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("update server returned status {status} for {url}")]
    ServerStatus { status: u16, url: String },

    #[error("package error: {message}")]
    Package { message: String },

    #[error("patch application failed for {path}: {message}")]
    PatchFailed { path: PathBuf, message: String },

    #[error("install failed: {message}")]
    InstallFailed { message: String },

    #[error("uninstall incomplete: {message}")]
    UninstallIncomplete { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether the error came from the delta pipeline itself, as opposed to an
    /// unrelated failure (disk full, permissions). Only these justify retrying
    /// an update with deltas disabled.
    pub fn is_delta_specific(&self) -> bool {
        matches!(
            self,
            Self::ChecksumFailed { .. } | Self::PatchFailed { .. } | Self::InvalidPlan { .. }
        )
    }

    /// Whether a fresh attempt at the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::ServerStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
