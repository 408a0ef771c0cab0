//! Credential mailbox for interactive authentication.
//!
//! An out-of-band input channel (an admin typing a verification code into a
//! chat) hands values to a blocked authentication step without coupling the
//! two call stacks. Entries are keyed, single-use (read removes them), and
//! independent across keys.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {tokio::sync::Notify, tokio_util::sync::CancellationToken, tracing::warn};

/// How long an interactive prompt waits for an operator-supplied value.
pub const WAIT_HORIZON: Duration = Duration::from_secs(5 * 60);

/// Re-check interval while waiting, as a backstop to the wakeup signal.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Keys an authentication round can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    VerificationCode,
    Password,
}

impl CredentialKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationCode => "verification_code",
            Self::Password => "password",
        }
    }
}

/// Events the authentication path announces, best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEvent {
    VerificationCodeNeeded,
    PasswordNeeded,
    Authenticated,
}

impl AuthEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationCodeNeeded => "verification_code_needed",
            Self::PasswordNeeded => "password_needed",
            Self::Authenticated => "authenticated",
        }
    }
}

type NotifyCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Process-wide mailbox for operator-supplied credential values, plus the
/// best-effort notification hub that prompts the operator for them.
#[derive(Default)]
pub struct CredentialMailbox {
    values: std::sync::Mutex<HashMap<CredentialKey, String>>,
    posted: Notify,
    notifiers: std::sync::Mutex<HashMap<AuthEvent, NotifyCallback>>,
}

impl CredentialMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a value. A second `put` for the same key before anyone reads
    /// it replaces the earlier value; each key holds at most one entry.
    pub fn put(&self, key: CredentialKey, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value.into());
        self.posted.notify_waiters();
    }

    /// Remove and return the value for `key`, if present.
    pub fn take(&self, key: CredentialKey) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
    }

    /// Wait until a value for `key` arrives, the horizon elapses, or the
    /// caller cancels. Returns `None` on horizon expiry or cancellation;
    /// the caller distinguishes the two through its own token.
    pub async fn wait_for(
        &self,
        key: CredentialKey,
        horizon: Duration,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let deadline = tokio::time::Instant::now() + horizon;
        loop {
            // Register for wakeup before re-checking, so a `put` between the
            // check and the await is never missed.
            let posted = self.posted.notified();
            if let Some(value) = self.take(key) {
                return Some(value);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let tick = RECHECK_INTERVAL.min(deadline - now);

            tokio::select! {
                _ = posted => {},
                _ = tokio::time::sleep(tick) => {},
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Register the callback invoked when `event` fires. Replaces any
    /// earlier callback for the same event.
    pub fn set_notifier(
        &self,
        event: AuthEvent,
        callback: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event, Arc::new(callback));
    }

    /// Fire `event` on a detached task. Callback failures are logged and
    /// swallowed; a stuck notification must never stall the authentication
    /// path that triggered it.
    pub fn notify(&self, event: AuthEvent) {
        let callback = self
            .notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .cloned();
        let Some(callback) = callback else {
            return;
        };
        tokio::spawn(async move {
            if let Err(error) = callback() {
                warn!(event = event.as_str(), %error, "auth notification callback failed");
            }
        });
    }

    /// Drop all pending values. Registered notifiers are kept.
    pub fn clear_all(&self) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
