//! # Object Store - Remote Persistence for Snapshot Images
//!
//! Snapshot images are persisted by mirroring their cache directory to a
//! remote object store, keyed by the same relative path they occupy under
//! the local cache root:
//!
//! ```text
//! local:  /var/cache/lxc/download/ubuntu/precise/amd64/<snapshot-id>/
//! remote: s3://<bucket>/ubuntu/precise/amd64/<snapshot-id>/
//! ```
//!
//! Sync is directory-granular and idempotent. Only files that differ are
//! transferred, so re-running a pull after a partial fetch completes it.
//!
//! ## Configuration
//!
//! The store is optional. With no bucket configured the controller refuses
//! to fetch or persist images (`Error::ObjectStoreNotConfigured`) but every
//! other operation keeps working.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Bidirectional directory sync against a remote store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location of a relative path, for logs.
    fn describe(&self, remote_rel: &str) -> String;

    /// Mirrors `remote_rel` into the local directory `local`.
    async fn pull(&self, remote_rel: &str, local: &Path) -> Result<()>;

    /// Mirrors the local directory `local` to `remote_rel`.
    async fn push(&self, local: &Path, remote_rel: &str) -> Result<()>;
}

/// Object store backed by `aws s3 sync`.
#[derive(Debug, Clone)]
pub struct S3SyncStore {
    bucket: String,
}

impl S3SyncStore {
    /// Creates a store for `bucket` (without the `s3://` scheme).
    pub fn new(bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let bucket = bucket
            .trim_start_matches("s3://")
            .trim_end_matches('/')
            .to_string();
        Self { bucket }
    }

    /// Returns the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn url(&self, remote_rel: &str) -> String {
        format!("s3://{}/{}", self.bucket, remote_rel.trim_start_matches('/'))
    }

    async fn sync(&self, from: &str, to: &str) -> Result<()> {
        debug!("aws s3 sync {} {}", from, to);
        let output = Command::new("aws")
            .args(["s3", "sync", "--quiet", from, to])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SyncFailed {
                from: from.to_string(),
                to: to.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::SyncFailed {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3SyncStore {
    fn describe(&self, remote_rel: &str) -> String {
        self.url(remote_rel)
    }

    async fn pull(&self, remote_rel: &str, local: &Path) -> Result<()> {
        tokio::fs::create_dir_all(local).await?;
        let from = self.url(remote_rel);
        self.sync(&from, &local.to_string_lossy()).await?;
        info!("Fetched {} into {}", from, local.display());
        Ok(())
    }

    async fn push(&self, local: &Path, remote_rel: &str) -> Result<()> {
        let to = self.url(remote_rel);
        self.sync(&local.to_string_lossy(), &to).await?;
        info!("Uploaded {} to {}", local.display(), to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_normalization() {
        let store = S3SyncStore::new("s3://ci-snapshots/");
        assert_eq!(store.bucket(), "ci-snapshots");
        assert_eq!(
            store.describe("/ubuntu/precise/amd64/abc"),
            "s3://ci-snapshots/ubuntu/precise/amd64/abc"
        );
    }
}
