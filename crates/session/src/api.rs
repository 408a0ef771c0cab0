//! The seam between session management and the wire protocol.
//!
//! Components other than the connector speak to Telegram exclusively through
//! [`TelegramApi`], so contact verification and media delivery can be
//! exercised against in-memory doubles. Raw transport errors never cross
//! this boundary; they are classified into [`ApiError`] first.

use std::{future::Future, path::Path, time::Duration};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio_util::sync::CancellationToken,
};

use embergram_common::Recipient;

use crate::error::{Error, Result};

/// What the login sequence needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Done,
    CodeRequired,
    PasswordRequired,
}

/// Contact relationship flags as the server reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactFlags {
    /// The sender has the recipient in their contacts.
    pub contact: bool,
    /// The recipient also has the sender in theirs.
    pub mutual_contact: bool,
}

/// Identity of a previously uploaded media object: remote id, access token,
/// and the opaque reference blob the server may invalidate at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub photo_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
}

/// Outcome of a successful media send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMedia {
    pub message_id: i32,
    pub media: MediaRef,
}

/// Protocol-level failures, classified into this crate's vocabulary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The opaque file reference went stale; refresh and retry once.
    #[error("file reference expired")]
    ReferenceExpired,

    #[error("rate limited, retry in {seconds}s")]
    FloodWait { seconds: u32 },

    #[error("session is not authorized")]
    Unauthorized,

    #[error("verification code rejected")]
    InvalidCode,

    #[error("two-factor password rejected")]
    WrongPassword,

    #[error("rpc error: {name}")]
    Rpc { name: String },

    #[error("{context}: {message}")]
    Transport { context: &'static str, message: String },
}

/// Everything the rest of the system needs from a live protocol connection.
/// The client is safe for concurrent calls once constructed; construction
/// and authentication are serialized by the session manager.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn is_authorized(&self) -> std::result::Result<bool, ApiError>;

    async fn request_login_code(&self, phone: &str) -> std::result::Result<(), ApiError>;

    async fn submit_code(&self, code: &str) -> std::result::Result<LoginStep, ApiError>;

    async fn submit_password(&self, password: &str) -> std::result::Result<LoginStep, ApiError>;

    /// Persist the session artifact so authentication survives restarts.
    async fn persist_session(&self) -> std::result::Result<(), ApiError>;

    /// Release the connection. The session manager calls this once, after
    /// the disposal grace delay; the handle must not be used afterwards.
    async fn disconnect(&self);

    async fn contact_flags(
        &self,
        recipient: &Recipient,
    ) -> std::result::Result<ContactFlags, ApiError>;

    async fn add_contact(
        &self,
        recipient: &Recipient,
        first_name: &str,
    ) -> std::result::Result<(), ApiError>;

    /// Send previously uploaded media by reference, with a self-destruct TTL.
    async fn send_cached_media(
        &self,
        recipient: &Recipient,
        media: &MediaRef,
        ttl_seconds: i32,
    ) -> std::result::Result<SentMedia, ApiError>;

    /// Upload local bytes and send them as self-destructing media.
    async fn upload_and_send(
        &self,
        recipient: &Recipient,
        path: &Path,
        ttl_seconds: i32,
    ) -> std::result::Result<SentMedia, ApiError>;

    /// Re-read a previously sent message and extract a current media
    /// reference from it, if it still carries usable media.
    async fn refetch_media(
        &self,
        message_id: i32,
    ) -> std::result::Result<Option<MediaRef>, ApiError>;
}

/// Narrow read access to the live handle. Only the session manager mutates
/// it; everyone else goes through this.
pub trait ApiAccess: Send + Sync {
    fn api(&self) -> Result<std::sync::Arc<dyn TelegramApi>>;
}

/// Run a protocol call under a hard deadline, tied to the caller's
/// cancellation token. Cancellation and deadline expiry stay distinguishable.
pub async fn call_with_deadline<T, F>(
    operation: &'static str,
    deadline: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    tokio::select! {
        // A cancelled caller observes `Cancelled` even when the call is
        // already ready.
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(deadline, call) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::Timeout { operation, elapsed: deadline }),
        },
    }
}

/// Run a protocol call that has no fixed deadline but must still unblock
/// promptly when the caller cancels.
pub async fn call_cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = call => outcome.map_err(Error::from),
    }
}

/// Classify an invocation failure by its rendered message. The underlying
/// client does not expose a stable error enum for server-side codes, so
/// detection goes by the well-known code names embedded in the text.
pub(crate) fn classify_invocation(context: &'static str, error: impl std::fmt::Display) -> ApiError {
    let rendered = error.to_string();
    let lowered = rendered.to_ascii_lowercase();

    if lowered.contains("file_reference") {
        return ApiError::ReferenceExpired;
    }
    if let Some(seconds) = parse_flood_wait_seconds(&lowered) {
        return ApiError::FloodWait { seconds };
    }
    if lowered.contains("auth_key") || lowered.contains("unauthorized") {
        return ApiError::Unauthorized;
    }
    if let Some(name) = rpc_error_name(&rendered) {
        return ApiError::Rpc { name };
    }

    ApiError::Transport {
        context,
        message: rendered,
    }
}

/// Extract the wait interval from a `FLOOD_WAIT_N` style message.
pub(crate) fn parse_flood_wait_seconds(message: &str) -> Option<u32> {
    if !message.to_ascii_lowercase().contains("flood") {
        return None;
    }

    message
        .split(|ch: char| !ch.is_ascii_digit())
        .find_map(|part| (!part.is_empty()).then(|| part.parse::<u32>().ok()).flatten())
}

/// Pull an ALL_CAPS rpc code name out of a rendered error, if one is there.
fn rpc_error_name(message: &str) -> Option<String> {
    message
        .split(|ch: char| !(ch.is_ascii_uppercase() || ch == '_' || ch.is_ascii_digit()))
        .find(|part| part.len() >= 8 && part.contains('_') && part.chars().any(|c| c.is_ascii_uppercase()))
        .map(str::to_owned)
}
