//! Shared protocol doubles for delivery tests.

use std::{
    collections::VecDeque,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {async_trait::async_trait, tempfile::NamedTempFile, tokio_util::sync::CancellationToken};

use {
    embergram_common::Recipient,
    embergram_contacts::{ContactRecordStore, ContactVerificationRecord, MemoryContactStore},
    embergram_session::api::{
        ApiAccess, ApiError, ContactFlags, LoginStep, MediaRef, SentMedia, TelegramApi,
    },
    embergram_session::auth::Authenticator,
};

use crate::fetch::FileFetcher;

pub(crate) fn media_ref(blob: &[u8]) -> MediaRef {
    MediaRef {
        photo_id: 5_551_212,
        access_hash: -77,
        file_reference: blob.to_vec(),
    }
}

pub(crate) fn sent(message_id: i32, blob: &[u8]) -> SentMedia {
    SentMedia {
        message_id,
        media: media_ref(blob),
    }
}

/// A recipient record seeded as a fresh mutual contact, so media tests skip
/// the contact-check network round.
pub(crate) async fn seed_mutual(store: &MemoryContactStore, recipient_id: i64) {
    let mut record = ContactVerificationRecord::new(recipient_id);
    record.is_mutual_contact = true;
    record.last_checked_at = chrono::Utc::now() - chrono::Duration::hours(1);
    store.create(record).await.unwrap();
}

/// Scripted protocol double: contact flags and media operations pop queued
/// results; every call is counted.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    pub flags: Mutex<VecDeque<ContactFlags>>,
    pub send_results: Mutex<VecDeque<Result<SentMedia, ApiError>>>,
    pub upload_results: Mutex<VecDeque<Result<SentMedia, ApiError>>>,
    pub refetch_results: Mutex<VecDeque<Result<Option<MediaRef>, ApiError>>>,
    pub upload_paths: Mutex<Vec<PathBuf>>,
    pub flags_calls: AtomicUsize,
    pub add_calls: AtomicUsize,
    pub sends: AtomicUsize,
    pub uploads: AtomicUsize,
    pub refetches: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(self, flags: &[ContactFlags]) -> Self {
        *self.flags.lock().unwrap() = flags.iter().copied().collect();
        self
    }

    pub fn with_sends(self, results: Vec<Result<SentMedia, ApiError>>) -> Self {
        *self.send_results.lock().unwrap() = results.into();
        self
    }

    pub fn with_uploads(self, results: Vec<Result<SentMedia, ApiError>>) -> Self {
        *self.upload_results.lock().unwrap() = results.into();
        self
    }

    pub fn with_refetches(self, results: Vec<Result<Option<MediaRef>, ApiError>>) -> Self {
        *self.refetch_results.lock().unwrap() = results.into();
        self
    }

    fn exhausted(context: &'static str) -> ApiError {
        ApiError::Transport {
            context,
            message: "script exhausted".to_owned(),
        }
    }
}

#[async_trait]
impl TelegramApi for ScriptedApi {
    async fn is_authorized(&self) -> Result<bool, ApiError> {
        Ok(true)
    }
    async fn request_login_code(&self, _phone: &str) -> Result<(), ApiError> {
        Ok(())
    }
    async fn submit_code(&self, _code: &str) -> Result<LoginStep, ApiError> {
        Ok(LoginStep::Done)
    }
    async fn submit_password(&self, _password: &str) -> Result<LoginStep, ApiError> {
        Ok(LoginStep::Done)
    }
    async fn persist_session(&self) -> Result<(), ApiError> {
        Ok(())
    }
    async fn disconnect(&self) {}

    async fn contact_flags(&self, _recipient: &Recipient) -> Result<ContactFlags, ApiError> {
        self.flags_calls.fetch_add(1, Ordering::SeqCst);
        self.flags
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(Self::exhausted("contact flags"))
    }

    async fn add_contact(
        &self,
        _recipient: &Recipient,
        _first_name: &str,
    ) -> Result<(), ApiError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_cached_media(
        &self,
        _recipient: &Recipient,
        _media: &MediaRef,
        _ttl_seconds: i32,
    ) -> Result<SentMedia, ApiError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Self::exhausted("send media")))
    }

    async fn upload_and_send(
        &self,
        _recipient: &Recipient,
        path: &Path,
        _ttl_seconds: i32,
    ) -> Result<SentMedia, ApiError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.upload_paths.lock().unwrap().push(path.to_path_buf());
        self.upload_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Self::exhausted("upload")))
    }

    async fn refetch_media(&self, _message_id: i32) -> Result<Option<MediaRef>, ApiError> {
        self.refetches.fetch_add(1, Ordering::SeqCst);
        self.refetch_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Self::exhausted("refetch")))
    }
}

pub(crate) struct FixedAccess(pub Arc<ScriptedApi>);

impl ApiAccess for FixedAccess {
    fn api(&self) -> embergram_session::Result<Arc<dyn TelegramApi>> {
        Ok(self.0.clone())
    }
}

/// Authenticator double: counts calls and optionally fails each one.
pub(crate) struct CountingAuth {
    pub calls: AtomicUsize,
    pub failure: Option<fn() -> embergram_session::Error>,
}

impl CountingAuth {
    pub fn passing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failure: None,
        }
    }

    pub fn failing(failure: fn() -> embergram_session::Error) -> Self {
        Self {
            failure: Some(failure),
            ..Self::passing()
        }
    }
}

#[async_trait]
impl Authenticator for CountingAuth {
    async fn ensure_authenticated(
        &self,
        _cancel: &CancellationToken,
    ) -> embergram_session::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

/// Fetcher double: writes fixed bytes into a temp file and remembers where.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    pub downloads: AtomicUsize,
    pub created_paths: Mutex<Vec<PathBuf>>,
    pub fail: bool,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl FileFetcher for ScriptedFetcher {
    async fn download(&self, file_reference: &str) -> anyhow::Result<NamedTempFile> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("bot api refused {file_reference}");
        }
        let mut temp = NamedTempFile::new()?;
        temp.write_all(b"jpeg bytes")?;
        self.created_paths
            .lock()
            .unwrap()
            .push(temp.path().to_path_buf());
        Ok(temp)
    }
}
