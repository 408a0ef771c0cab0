//! The delivery pipeline.
//!
//! A request authenticates, verifies the contact relationship, then sends
//! through the cache path when a remote handle exists, refreshing an
//! expired reference at most once from the previously sent message before
//! falling back to a fresh upload. Nothing thrown inside the pipeline
//! reaches the caller; every failure is converted into a
//! [`DeliveryOutcome`].

use std::sync::Arc;

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    embergram_common::Recipient,
    embergram_contacts::{ContactOutcome, ContactVerificationRecord, ContactVerifier},
    embergram_session::api::{ApiAccess, ApiError, SentMedia, TelegramApi, call_cancellable},
    embergram_session::auth::Authenticator,
};

use crate::{
    asset::{MediaAsset, MediaSource},
    cache::MediaHandleCache,
    error::{Error, Result},
    fetch::FileFetcher,
};

/// Terminal result of one delivery request.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The media went out with the requested self-destruct TTL.
    Sent { message_id: i32 },
    /// The contact relationship does not permit ephemeral sends. Carries
    /// the verification record and the remediation texts so the caller can
    /// present next steps instead of a generic error.
    Blocked {
        reason: String,
        record: ContactVerificationRecord,
        instruction: String,
        escalation: Option<String>,
    },
    /// Something else went wrong; `reason` is short and human-readable.
    Failed { reason: String },
}

impl DeliveryOutcome {
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    #[must_use]
    pub fn message_id(&self) -> Option<i32> {
        match self {
            Self::Sent { message_id } => Some(*message_id),
            Self::Blocked { .. } | Self::Failed { .. } => None,
        }
    }
}

pub struct DeliveryEngine {
    auth: Arc<dyn Authenticator>,
    api: Arc<dyn ApiAccess>,
    verifier: Arc<ContactVerifier>,
    cache: Arc<MediaHandleCache>,
    fetcher: Arc<dyn FileFetcher>,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(
        auth: Arc<dyn Authenticator>,
        api: Arc<dyn ApiAccess>,
        verifier: Arc<ContactVerifier>,
        cache: Arc<MediaHandleCache>,
        fetcher: Arc<dyn FileFetcher>,
    ) -> Self {
        Self {
            auth,
            api,
            verifier,
            cache,
            fetcher,
        }
    }

    /// Deliver `asset` to `recipient` as self-destructing media. Never
    /// panics and never propagates an internal error; the outcome says what
    /// happened.
    pub async fn deliver(
        &self,
        recipient: &Recipient,
        asset: &MediaAsset,
        ttl_seconds: i32,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        match self.run(recipient, asset, ttl_seconds, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(recipient = %recipient, asset = %asset.id, error = %err, "media delivery failed");
                DeliveryOutcome::Failed {
                    reason: err.to_string(),
                }
            },
        }
    }

    async fn run(
        &self,
        recipient: &Recipient,
        asset: &MediaAsset,
        ttl_seconds: i32,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        self.auth.ensure_authenticated(cancel).await?;

        let (record, contact) = self.verifier.check(recipient, cancel).await?;
        match contact {
            ContactOutcome::Mutual => {},
            ContactOutcome::AwaitingReciprocal { instruction } => {
                info!(recipient = %recipient, "delivery blocked, waiting for reciprocal contact");
                return Ok(DeliveryOutcome::Blocked {
                    reason: "the recipient has not added the sender back yet".to_owned(),
                    record,
                    instruction,
                    escalation: None,
                });
            },
            ContactOutcome::AddFailed {
                instruction,
                escalation,
            } => {
                warn!(recipient = %recipient, "delivery blocked, contact remediation failed");
                return Ok(DeliveryOutcome::Blocked {
                    reason: "the contact relationship could not be established".to_owned(),
                    record,
                    instruction,
                    escalation: Some(escalation),
                });
            },
        }

        let api = self.api.api()?;

        if let Some(handle) = self.cache.get(&asset.id) {
            match call_cancellable(
                cancel,
                api.send_cached_media(recipient, &handle.media, ttl_seconds),
            )
            .await
            {
                Ok(sent) => {
                    self.cache.record_sent(&asset.id, &sent);
                    debug!(asset = %asset.id, message_id = sent.message_id, "cache-path send succeeded");
                    return Ok(DeliveryOutcome::Sent {
                        message_id: sent.message_id,
                    });
                },
                Err(embergram_session::Error::Api(ApiError::ReferenceExpired)) => {
                    if let Some(message_id) = handle.last_sent_message_id {
                        if let Some(sent) = self
                            .refresh_and_retry(&api, recipient, &asset.id, message_id, ttl_seconds, cancel)
                            .await?
                        {
                            return Ok(DeliveryOutcome::Sent {
                                message_id: sent.message_id,
                            });
                        }
                    } else {
                        debug!(asset = %asset.id, "reference expired with no prior message, uploading fresh");
                    }
                    // Fall through to the upload path; no second refresh.
                },
                Err(other) => return Err(other.into()),
            }
        }

        let sent = self.upload(&api, recipient, asset, ttl_seconds, cancel).await?;
        self.cache.record_sent(&asset.id, &sent);
        info!(recipient = %recipient, asset = %asset.id, message_id = sent.message_id, "media uploaded and sent");
        Ok(DeliveryOutcome::Sent {
            message_id: sent.message_id,
        })
    }

    /// The single permitted reference refresh: refetch the prior message,
    /// rotate the cached blob, retry the send once. `None` means fall back
    /// to upload.
    async fn refresh_and_retry(
        &self,
        api: &Arc<dyn TelegramApi>,
        recipient: &Recipient,
        asset_id: &str,
        message_id: i32,
        ttl_seconds: i32,
        cancel: &CancellationToken,
    ) -> Result<Option<SentMedia>> {
        let refreshed = match call_cancellable(cancel, api.refetch_media(message_id)).await {
            Ok(Some(media)) => media,
            Ok(None) => {
                warn!(asset = asset_id, message_id, "prior message no longer carries usable media");
                return Ok(None);
            },
            Err(err @ embergram_session::Error::Cancelled) => return Err(err.into()),
            Err(err) => {
                warn!(asset = asset_id, message_id, error = %err, "reference refresh failed");
                return Ok(None);
            },
        };

        self.cache.refresh_reference(asset_id, refreshed.clone());
        debug!(asset = asset_id, message_id, "file reference refreshed, retrying send");

        match call_cancellable(
            cancel,
            api.send_cached_media(recipient, &refreshed, ttl_seconds),
        )
        .await
        {
            Ok(sent) => {
                self.cache.record_sent(asset_id, &sent);
                Ok(Some(sent))
            },
            Err(err @ embergram_session::Error::Cancelled) => Err(err.into()),
            Err(err) => {
                warn!(asset = asset_id, error = %err, "retried send failed, falling back to upload");
                Ok(None)
            },
        }
    }

    async fn upload(
        &self,
        api: &Arc<dyn TelegramApi>,
        recipient: &Recipient,
        asset: &MediaAsset,
        ttl_seconds: i32,
        cancel: &CancellationToken,
    ) -> Result<SentMedia> {
        match &asset.source {
            MediaSource::LocalFile(path) => {
                call_cancellable(cancel, api.upload_and_send(recipient, path, ttl_seconds))
                    .await
                    .map_err(Error::from)
            },
            MediaSource::BotFile(file_reference) => {
                let temp = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(embergram_session::Error::Cancelled.into()),
                    fetched = self.fetcher.download(file_reference) => {
                        fetched.map_err(Error::Fetch)?
                    },
                };
                // `temp` is deleted on drop, success and failure alike.
                call_cancellable(
                    cancel,
                    api.upload_and_send(recipient, temp.path(), ttl_seconds),
                )
                .await
                .map_err(Error::from)
            },
        }
    }
}
