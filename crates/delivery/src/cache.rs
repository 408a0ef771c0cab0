//! Per-asset records of previously uploaded media.
//!
//! A cached handle lets an asset be re-sent without re-uploading its bytes.
//! The reference blob inside it expires unpredictably server-side; it is
//! overwritten on every successful send and never appended.

use {
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
};

use embergram_session::api::{MediaRef, SentMedia};

/// Remote identity of an already-uploaded asset. Only useful for a refresh
/// when a prior message id exists; without one the engine falls back to
/// upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMediaHandle {
    pub media: MediaRef,
    pub last_sent_message_id: Option<i32>,
}

impl CachedMediaHandle {
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.last_sent_message_id.is_some()
    }
}

/// Handle store keyed by asset id. Written only by the delivery engine
/// after a successful send; concurrent deliveries of different assets never
/// contend on the same entry.
#[derive(Default)]
pub struct MediaHandleCache {
    handles: DashMap<String, CachedMediaHandle>,
}

impl MediaHandleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, asset_id: &str) -> Option<CachedMediaHandle> {
        self.handles.get(asset_id).map(|entry| entry.clone())
    }

    pub fn insert(&self, asset_id: impl Into<String>, handle: CachedMediaHandle) {
        self.handles.insert(asset_id.into(), handle);
    }

    /// Overwrite the handle wholesale after a successful send: the response
    /// carries the rotated reference blob and the new message id.
    pub fn record_sent(&self, asset_id: &str, sent: &SentMedia) {
        self.handles.insert(
            asset_id.to_owned(),
            CachedMediaHandle {
                media: sent.media.clone(),
                last_sent_message_id: Some(sent.message_id),
            },
        );
    }

    /// Replace the reference blob refetched from a prior message, keeping
    /// that message id for any later refresh.
    pub fn refresh_reference(&self, asset_id: &str, media: MediaRef) {
        if let Some(mut entry) = self.handles.get_mut(asset_id) {
            entry.media = media;
        }
    }
}
