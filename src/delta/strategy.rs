use crate::error::{UpdateError, UpdateResult};

/// Pluggable byte-level diff contract. The production strategy wraps the
/// platform diff tool; the engine only relies on `apply(base, create(base,
/// new)) == new` and a stable sidecar extension.
pub trait DiffStrategy: Send + Sync {
    /// Sidecar extension for patches this strategy produces (`diff` or
    /// `bsdiff`).
    fn extension(&self) -> &'static str;

    /// Compute a patch blob transforming `base` into `new`.
    fn create(&self, base: &[u8], new: &[u8]) -> UpdateResult<Vec<u8>>;

    /// Apply a patch blob to `base`, producing the new file bytes.
    fn apply(&self, base: &[u8], patch: &[u8]) -> UpdateResult<Vec<u8>>;
}

const SNAPSHOT_MAGIC: &[u8] = b"SSNAP1\0";

/// Fallback strategy used when no platform diff tool is available: the patch
/// carries the complete new file behind a small header. Trades delta size for
/// having no external dependency.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotDiff;

impl DiffStrategy for SnapshotDiff {
    fn extension(&self) -> &'static str {
        "diff"
    }

    fn create(&self, _base: &[u8], new: &[u8]) -> UpdateResult<Vec<u8>> {
        let mut patch = Vec::with_capacity(SNAPSHOT_MAGIC.len() + new.len());
        patch.extend_from_slice(SNAPSHOT_MAGIC);
        patch.extend_from_slice(new);
        Ok(patch)
    }

    fn apply(&self, _base: &[u8], patch: &[u8]) -> UpdateResult<Vec<u8>> {
        patch
            .strip_prefix(SNAPSHOT_MAGIC)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| UpdateError::Package {
                message: "snapshot patch header missing".into(),
            })
    }
}
