use async_trait::async_trait;
use fleet_common::Result;

/// Object storage the cluster can read build contexts from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `name` and returns a URL Kaniko accepts as `--context`,
    /// e.g. `s3://bucket/name`.
    async fn push(&self, name: &str, data: Vec<u8>) -> Result<String>;
}
