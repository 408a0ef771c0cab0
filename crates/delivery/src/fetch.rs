//! Bot-facing file download seam.
//!
//! When a delivery input names a bot-API file identifier instead of a local
//! path, the bytes are fetched through this trait into a temporary file.
//! The temp file is deleted on drop, so every exit path cleans up.

use {async_trait::async_trait, tempfile::NamedTempFile};

/// Downloads a bot-API file into a process-temporary file. Implemented by
/// the bot host; failures surface as delivery failures, never panics.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn download(&self, file_reference: &str) -> anyhow::Result<NamedTempFile>;
}

/// Fetcher for hosts whose assets are always local files.
pub struct NoRemoteFiles;

#[async_trait]
impl FileFetcher for NoRemoteFiles {
    async fn download(&self, file_reference: &str) -> anyhow::Result<NamedTempFile> {
        anyhow::bail!("remote file downloads are not configured (requested {file_reference})")
    }
}
