//! Self-update engine for desktop applications.
//!
//! Installations live under one root with versioned `app-<version>`
//! directories, a `packages/` cache, and a `RELEASES` manifest pinning the
//! installed version. Updates are planned against a remote feed (HTTP or a
//! plain folder), downloaded with checksum verification, optionally shipped
//! as chained delta packages, and promoted atomically.

pub mod apply;
pub mod delta;
pub mod download;
pub mod engine;
pub mod env;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod package;
pub mod planner;
pub mod util;

pub use apply::{ApplyEngine, LifecycleProbe, ShellIntegration};
pub use delta::{DeltaEngine, DiffStrategy};
pub use download::{Downloader, UpdateSource};
pub use engine::UpdateEngine;
pub use error::{UpdateError, UpdateResult};
pub use lock::InstanceLock;
pub use manifest::{PackageVersion, ReleaseEntry};
pub use planner::UpdateInfo;
