use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};

use crate::{
    checksum::{self, Checksum},
    error::UpdaterError,
    file,
};

/// Compute the digest of `path` off the async runtime.
pub async fn compute_checksum(checksum: Arc<dyn Checksum>, path: &Path) -> Result<String, UpdaterError> {
    let path = path.to_owned();

    tokio::task::spawn_blocking(move || checksum.compute(&path))
        .await
        .map_err(|e| UpdaterError::SystemResource(format!("Checksum task failed: {e}")))?
        .map_err(UpdaterError::from)
}

/// Promote a verified download. If the digest of `staging` does not match
/// `expected`, the staging file is deleted and the canonical image is left
/// alone. Otherwise the staging file atomically replaces `canonical`. If that
/// rename fails, the staging file is kept for inspection.
pub async fn verify_and_install(
    checksum: Arc<dyn Checksum>,
    staging: &Path,
    expected: &str,
    canonical: &Path,
) -> Result<PathBuf, UpdaterError> {
    let actual = compute_checksum(checksum, staging).await?;

    if !checksum::digests_match(&actual, expected) {
        file::delete_if_exists(staging)?;
        return Err(UpdaterError::ChecksumMismatch {
            expected: expected.to_owned(),
            actual,
        });
    }

    debug!("Checksum of {:?} matches: {}", staging, actual);

    file::rename_atomic(staging, canonical)
        .map_err(|e| UpdaterError::Install {
            staging: staging.to_owned(),
            canonical: canonical.to_owned(),
            source: e,
        })?;

    info!("Installed {:?}", canonical);

    Ok(canonical.to_owned())
}
