//! Ownership of the single live protocol handle.
//!
//! Construction is lazy, idempotent, and serialized: the first caller builds
//! the client while concurrent callers wait on the same lock. A corrupt
//! persisted session artifact is deleted and reconstructed, bounded to three
//! attempts. Credential rotation goes through a distinct lock so it cannot
//! deadlock against a first-time initialization that is blocked on network
//! I/O.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    once_cell::sync::Lazy,
    rand::Rng,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    api::{ApiAccess, TelegramApi},
    auth::AuthState,
    error::{Error, Result},
    mailbox::CredentialMailbox,
    settings::{ClientSettings, SettingsQuery},
};

/// Construction attempts before a corrupt artifact is declared fatal.
const CONSTRUCT_ATTEMPTS: u32 = 3;

/// Grace delay before a replaced handle is released, letting in-flight
/// operations finish and file handles close.
const DISPOSAL_GRACE: Duration = Duration::from_millis(500);

/// Session-artifact paths currently claimed by a live manager in this
/// process. A second manager configured with the same path gets a suffixed
/// artifact instead of fighting over the file.
static ACTIVE_SESSION_PATHS: Lazy<std::sync::Mutex<HashSet<PathBuf>>> =
    Lazy::new(|| std::sync::Mutex::new(HashSet::new()));

/// Builds a live protocol handle from a resolved credential set.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn TelegramApi>>;
}

struct Shared {
    api: Option<Arc<dyn TelegramApi>>,
    auth: AuthState,
    last_failure: Option<tokio::time::Instant>,
    /// Bumped on every credential rotation.
    settings_generation: u64,
    /// Generation the live handle was built from. A mismatch marks the
    /// handle stale; the next initialization disposes and rebuilds it.
    handle_generation: u64,
    override_settings: Option<ClientSettings>,
    claimed_path: Option<PathBuf>,
}

pub struct SessionManager {
    query: Arc<dyn SettingsQuery>,
    connector: Arc<dyn Connector>,
    mailbox: Arc<CredentialMailbox>,
    state: std::sync::RwLock<Shared>,
    /// Init/auth critical section. Shared with the authentication flow:
    /// first caller wins, others wait.
    flow: tokio::sync::Mutex<()>,
    reinit: tokio::sync::Mutex<()>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        query: Arc<dyn SettingsQuery>,
        connector: Arc<dyn Connector>,
        mailbox: Arc<CredentialMailbox>,
    ) -> Self {
        Self {
            query,
            connector,
            mailbox,
            state: std::sync::RwLock::new(Shared {
                api: None,
                auth: AuthState::Unauthenticated,
                last_failure: None,
                settings_generation: 0,
                handle_generation: 0,
                override_settings: None,
                claimed_path: None,
            }),
            flow: tokio::sync::Mutex::new(()),
            reinit: tokio::sync::Mutex::new(()),
        }
    }

    /// Lazily construct the protocol handle. Safe for concurrent callers;
    /// losers of the construction race wait and then observe the winner's
    /// handle.
    pub async fn ensure_initialized(&self, cancel: &CancellationToken) -> Result<()> {
        if self.handle_is_current() {
            return Ok(());
        }

        let _guard = self.lock_flow(cancel).await?;
        if self.handle_is_current() {
            return Ok(());
        }

        let (generation, stale, stale_path) = {
            let mut shared = self.state_mut();
            (
                shared.settings_generation,
                shared.api.take(),
                shared.claimed_path.take(),
            )
        };
        if let Some(stale) = stale {
            // Built from rotated-out credentials; retire it before rebuilding.
            self.dispose(stale, stale_path.as_deref()).await;
        } else if let Some(path) = stale_path.as_deref() {
            release_session_path(path);
        }

        let mut settings = self.current_settings();
        let path = claim_session_path(&settings.session_path);
        settings.session_path = path.clone();

        match self.construct(&settings).await {
            Ok(api) => {
                let mut shared = self.state_mut();
                shared.api = Some(api);
                shared.handle_generation = generation;
                shared.claimed_path = Some(path);
                info!(session_path = %settings.session_path.display(), "protocol session initialized");
                Ok(())
            },
            Err(error) => {
                release_session_path(&path);
                Err(error)
            },
        }
    }

    async fn construct(&self, settings: &ClientSettings) -> Result<Arc<dyn TelegramApi>> {
        let path = settings.session_path.clone();
        let mut last_detail = String::new();

        for attempt in 1..=CONSTRUCT_ATTEMPTS {
            sweep_empty_artifact(&path)?;

            match self.connector.connect(settings).await {
                Ok(api) => return Ok(api),
                Err(Error::CorruptArtifact { detail }) => {
                    warn!(
                        attempt,
                        max_attempts = CONSTRUCT_ATTEMPTS,
                        session_path = %path.display(),
                        detail,
                        "session artifact corrupt, deleting and retrying"
                    );
                    if let Err(error) = std::fs::remove_file(&path) {
                        if error.kind() != std::io::ErrorKind::NotFound {
                            return Err(error.into());
                        }
                    }
                    last_detail = detail;
                },
                Err(other) => return Err(other),
            }
        }

        Err(Error::ConstructExhausted {
            attempts: CONSTRUCT_ATTEMPTS,
            detail: last_detail,
        })
    }

    /// Rotate credentials: retire the current handle after a grace delay,
    /// reset authentication, and construct a fresh handle from the new
    /// credential set.
    pub async fn reinitialize(&self, new_settings: ClientSettings) -> Result<()> {
        let _guard = self.reinit.lock().await;
        info!("reinitializing protocol session with new credentials");

        let (stale, old_path) = {
            let mut shared = self.state_mut();
            shared.settings_generation += 1;
            shared.override_settings = Some(new_settings);
            shared.auth = AuthState::Unauthenticated;
            shared.last_failure = None;
            (shared.api.take(), shared.claimed_path.take())
        };
        self.mailbox.clear_all();

        if let Some(stale) = stale {
            self.dispose(stale, old_path.as_deref()).await;
        } else if let Some(path) = old_path.as_deref() {
            release_session_path(path);
        }

        self.ensure_initialized(&CancellationToken::new()).await
    }

    async fn dispose(&self, api: Arc<dyn TelegramApi>, claimed: Option<&Path>) {
        tokio::time::sleep(DISPOSAL_GRACE).await;
        api.disconnect().await;
        if let Some(path) = claimed {
            release_session_path(path);
        }
    }

    fn handle_is_current(&self) -> bool {
        let shared = self.state_ref();
        shared.api.is_some() && shared.handle_generation == shared.settings_generation
    }

    /// The active credential set: rotated-in overrides win, otherwise the
    /// configuration query is consulted fresh on every construction.
    pub(crate) fn current_settings(&self) -> ClientSettings {
        if let Some(settings) = &self.state_ref().override_settings {
            return settings.clone();
        }
        ClientSettings::resolve(&*self.query)
    }

    /// Acquire the shared init/auth lock, unblocking early if the caller
    /// cancels while waiting.
    pub(crate) async fn lock_flow(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = self.flow.lock() => Ok(guard),
        }
    }

    pub(crate) fn try_lock_flow(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.flow.try_lock().ok()
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.state_ref().auth
    }

    pub(crate) fn set_auth_state(&self, auth: AuthState) {
        self.state_mut().auth = auth;
    }

    pub(crate) fn record_failure(&self) {
        let mut shared = self.state_mut();
        shared.auth = AuthState::CooldownAfterFailure;
        shared.last_failure = Some(tokio::time::Instant::now());
    }

    pub(crate) fn clear_failure(&self) {
        self.state_mut().last_failure = None;
    }

    /// Time left in the cooldown window, if it is still running.
    pub(crate) fn cooldown_remaining(&self, window: Duration) -> Option<Duration> {
        let last = self.state_ref().last_failure?;
        let elapsed = last.elapsed();
        (elapsed < window).then(|| window - elapsed)
    }

    fn state_ref(&self) -> std::sync::RwLockReadGuard<'_, Shared> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, Shared> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ApiAccess for SessionManager {
    fn api(&self) -> Result<Arc<dyn TelegramApi>> {
        self.state_ref()
            .api
            .clone()
            .ok_or_else(|| Error::message("protocol session is not initialized"))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(path) = self.state_mut().claimed_path.take() {
            release_session_path(&path);
        }
    }
}

/// Delete a zero-length artifact before handing the path to the connector;
/// an empty file fails the structural check anyway and would burn an
/// attempt.
fn sweep_empty_artifact(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.len() == 0 => {
            warn!(session_path = %path.display(), "removing empty session artifact");
            std::fs::remove_file(path)?;
            Ok(())
        },
        Ok(_) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Claim `path` for this manager, suffixing it with a random token when
/// another live manager already owns it.
fn claim_session_path(path: &Path) -> PathBuf {
    let mut claimed = ACTIVE_SESSION_PATHS
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    if claimed.insert(path.to_path_buf()) {
        return path.to_path_buf();
    }

    loop {
        let candidate = suffixed_path(path, &random_token());
        if claimed.insert(candidate.clone()) {
            warn!(
                session_path = %path.display(),
                suffixed = %candidate.display(),
                "session artifact already active, using suffixed path"
            );
            return candidate;
        }
    }
}

fn release_session_path(path: &Path) {
    ACTIVE_SESSION_PATHS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(path);
}

fn suffixed_path(path: &Path, token: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_owned());
    name.push('.');
    name.push_str(token);
    path.with_file_name(name)
}

fn random_token() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..6)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
