use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the bytes of an asset come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSource {
    /// A file already on local disk.
    LocalFile(PathBuf),
    /// A bot-API file identifier; the bytes must be downloaded into a
    /// temporary file before they can be uploaded to the protocol.
    BotFile(String),
}

/// A deliverable media asset. The id keys the cached remote handle, so two
/// requests for the same asset reuse one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: String,
    pub source: MediaSource,
}

impl MediaAsset {
    #[must_use]
    pub fn local(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: MediaSource::LocalFile(path.into()),
        }
    }

    #[must_use]
    pub fn bot_file(id: impl Into<String>, file_reference: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: MediaSource::BotFile(file_reference.into()),
        }
    }
}
