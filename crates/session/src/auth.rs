//! Interactive authentication state machine.
//!
//! Only one logical authentication attempt is in flight system-wide: the
//! automatic path (`ensure_authenticated`) and the operator-driven path
//! (`login`) both serialize on the session manager's init/auth lock. When an
//! automatic attempt is already blocked waiting for operator input, `login`
//! hands its value over through the credential mailbox instead of waiting
//! for the lock.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    api::{ApiAccess, ApiError, LoginStep, TelegramApi, call_with_deadline},
    error::{Error, Result},
    mailbox::{AuthEvent, CredentialKey, CredentialMailbox, WAIT_HORIZON},
    manager::SessionManager,
    settings::keys,
};

/// Minimum wait after a failed attempt before a new one is allowed, to
/// avoid triggering remote rate-limiting.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Deadline for each network login primitive.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication progress. Transitions are monotonic toward
/// `Authenticated` except for the cooldown loop-back to `Unauthenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingVerificationCode,
    AwaitingTwoFactorPassword,
    Authenticated,
    CooldownAfterFailure,
}

/// Symbolic token for the next input the login sequence requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredInput {
    VerificationCode,
    Password,
}

impl RequiredInput {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerificationCode => "verification_code",
            Self::Password => "password",
        }
    }
}

/// Result of one interactive login step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The session is authenticated; no further input is needed.
    Authenticated,
    /// A verification code must be supplied next.
    CodeRequired,
    /// The two-factor password must be supplied next.
    PasswordRequired,
    /// An automatic attempt is mid-flight and consumed the value through
    /// the mailbox; its own notifications report what happens next.
    Forwarded,
}

impl LoginOutcome {
    #[must_use]
    pub fn required_input(self) -> Option<RequiredInput> {
        match self {
            Self::CodeRequired => Some(RequiredInput::VerificationCode),
            Self::PasswordRequired => Some(RequiredInput::Password),
            Self::Authenticated | Self::Forwarded => None,
        }
    }
}

/// The narrow "make sure we are logged in" capability downstream engines
/// depend on.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn ensure_authenticated(&self, cancel: &CancellationToken) -> Result<()>;
}

pub struct AuthFlow {
    manager: Arc<SessionManager>,
    mailbox: Arc<CredentialMailbox>,
}

impl AuthFlow {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, mailbox: Arc<CredentialMailbox>) -> Self {
        Self { manager, mailbox }
    }

    /// Initialize the session if needed, then drive the login sequence to
    /// `Authenticated`, waiting on the mailbox for interactive values.
    /// Fails fast during the cooldown window without touching the network.
    pub async fn ensure_authenticated(&self, cancel: &CancellationToken) -> Result<()> {
        self.manager.ensure_initialized(cancel).await?;
        if self.manager.auth_state() == AuthState::Authenticated {
            return Ok(());
        }

        let _guard = self.manager.lock_flow(cancel).await?;
        // Re-check under the lock: a concurrent caller may have finished.
        match self.manager.auth_state() {
            AuthState::Authenticated => return Ok(()),
            AuthState::CooldownAfterFailure => {
                if let Some(remaining) = self.manager.cooldown_remaining(COOLDOWN) {
                    return Err(Error::Cooldown { remaining });
                }
                self.manager.set_auth_state(AuthState::Unauthenticated);
            },
            _ => {},
        }

        let api = self.manager.api()?;
        match self.run_login(&api, cancel).await {
            Ok(()) => {
                self.finish(&api).await;
                Ok(())
            },
            Err(error) => {
                if error.arms_cooldown() {
                    self.manager.record_failure();
                    warn!(%error, "authentication attempt failed, cooldown armed");
                } else {
                    self.manager.set_auth_state(AuthState::Unauthenticated);
                }
                Err(error)
            },
        }
    }

    async fn run_login(
        &self,
        api: &Arc<dyn TelegramApi>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let authorized = call_with_deadline(
            "authorization check",
            LOGIN_TIMEOUT,
            cancel,
            api.is_authorized(),
        )
        .await?;
        if authorized {
            return Ok(());
        }

        let settings = self.manager.current_settings();
        if settings.is_placeholder_phone() {
            return Err(Error::NotConfigured { key: keys::PHONE });
        }

        call_with_deadline(
            "request login code",
            LOGIN_TIMEOUT,
            cancel,
            api.request_login_code(&settings.phone),
        )
        .await?;
        self.manager
            .set_auth_state(AuthState::AwaitingVerificationCode);
        self.mailbox.notify(AuthEvent::VerificationCodeNeeded);
        info!("verification code requested, waiting for operator input");

        let code = self
            .await_credential(CredentialKey::VerificationCode, cancel)
            .await?;
        let mut step =
            call_with_deadline("sign in", LOGIN_TIMEOUT, cancel, api.submit_code(&code)).await?;

        if step == LoginStep::PasswordRequired {
            self.manager
                .set_auth_state(AuthState::AwaitingTwoFactorPassword);
            self.mailbox.notify(AuthEvent::PasswordNeeded);
            info!("two-factor password required, waiting for operator input");

            let password = self.await_credential(CredentialKey::Password, cancel).await?;
            step = call_with_deadline(
                "check password",
                LOGIN_TIMEOUT,
                cancel,
                api.submit_password(&password),
            )
            .await?;
        }

        match step {
            LoginStep::Done => Ok(()),
            LoginStep::CodeRequired | LoginStep::PasswordRequired => {
                Err(Error::message("login sequence ended before authorization"))
            },
        }
    }

    async fn await_credential(
        &self,
        key: CredentialKey,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.mailbox
            .wait_for(key, WAIT_HORIZON, cancel)
            .await
            .ok_or_else(|| {
                if cancel.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::Timeout {
                        operation: match key {
                            CredentialKey::VerificationCode => "verification code wait",
                            CredentialKey::Password => "password wait",
                        },
                        elapsed: WAIT_HORIZON,
                    }
                }
            })
    }

    async fn finish(&self, api: &Arc<dyn TelegramApi>) {
        self.manager.set_auth_state(AuthState::Authenticated);
        self.manager.clear_failure();
        if let Err(error) = api.persist_session().await {
            warn!(%error, "failed to persist session after authentication");
        }
        self.mailbox.notify(AuthEvent::Authenticated);
        info!("authentication established");
    }

    /// One operator-driven login step. With no attempt in flight this
    /// drives the underlying primitive directly; while an automatic attempt
    /// is blocked on operator input, the value is handed over through the
    /// mailbox instead, without waiting on the auth lock.
    pub async fn login(&self, value: &str) -> Result<LoginOutcome> {
        if self.manager.api().is_err() {
            self.manager
                .ensure_initialized(&CancellationToken::new())
                .await?;
        }

        let Some(_guard) = self.manager.try_lock_flow() else {
            return match self.manager.auth_state() {
                AuthState::AwaitingVerificationCode => {
                    self.mailbox.put(CredentialKey::VerificationCode, value);
                    Ok(LoginOutcome::Forwarded)
                },
                AuthState::AwaitingTwoFactorPassword => {
                    self.mailbox.put(CredentialKey::Password, value);
                    Ok(LoginOutcome::Forwarded)
                },
                _ => Err(Error::message(
                    "another authentication step is in flight, retry shortly",
                )),
            };
        };

        let cancel = CancellationToken::new();
        let api = self.manager.api()?;

        match self.manager.auth_state() {
            AuthState::Authenticated => Ok(LoginOutcome::Authenticated),
            AuthState::Unauthenticated | AuthState::CooldownAfterFailure => {
                if let Some(remaining) = self.manager.cooldown_remaining(COOLDOWN) {
                    return Err(Error::Cooldown { remaining });
                }
                let settings = self.manager.current_settings();
                let supplied = value.trim();
                let phone = if supplied.is_empty() {
                    if settings.is_placeholder_phone() {
                        return Err(Error::NotConfigured { key: keys::PHONE });
                    }
                    settings.phone.clone()
                } else {
                    supplied.to_owned()
                };

                match call_with_deadline(
                    "request login code",
                    LOGIN_TIMEOUT,
                    &cancel,
                    api.request_login_code(&phone),
                )
                .await
                {
                    Ok(()) => {
                        self.manager
                            .set_auth_state(AuthState::AwaitingVerificationCode);
                        self.mailbox.notify(AuthEvent::VerificationCodeNeeded);
                        Ok(LoginOutcome::CodeRequired)
                    },
                    Err(error) => {
                        if error.arms_cooldown() {
                            self.manager.record_failure();
                        }
                        Err(error)
                    },
                }
            },
            AuthState::AwaitingVerificationCode => {
                match call_with_deadline("sign in", LOGIN_TIMEOUT, &cancel, api.submit_code(value))
                    .await
                {
                    Ok(LoginStep::Done) => {
                        self.finish(&api).await;
                        Ok(LoginOutcome::Authenticated)
                    },
                    Ok(LoginStep::PasswordRequired) => {
                        self.manager
                            .set_auth_state(AuthState::AwaitingTwoFactorPassword);
                        self.mailbox.notify(AuthEvent::PasswordNeeded);
                        Ok(LoginOutcome::PasswordRequired)
                    },
                    Ok(LoginStep::CodeRequired) => Ok(LoginOutcome::CodeRequired),
                    Err(error @ Error::Api(ApiError::InvalidCode)) => {
                        // Recoverable: state stays put for another try.
                        Err(error)
                    },
                    Err(error) => {
                        if error.arms_cooldown() {
                            self.manager.record_failure();
                        }
                        Err(error)
                    },
                }
            },
            AuthState::AwaitingTwoFactorPassword => {
                match call_with_deadline(
                    "check password",
                    LOGIN_TIMEOUT,
                    &cancel,
                    api.submit_password(value),
                )
                .await
                {
                    Ok(LoginStep::Done) => {
                        self.finish(&api).await;
                        Ok(LoginOutcome::Authenticated)
                    },
                    Ok(LoginStep::PasswordRequired) => Ok(LoginOutcome::PasswordRequired),
                    Ok(LoginStep::CodeRequired) => Ok(LoginOutcome::CodeRequired),
                    Err(error @ Error::Api(ApiError::WrongPassword)) => Err(error),
                    Err(error) => {
                        if error.arms_cooldown() {
                            self.manager.record_failure();
                        }
                        Err(error)
                    },
                }
            },
        }
    }

    /// Force the machine back to `Unauthenticated`, e.g. after an external
    /// signal that the persisted authorization is stale.
    pub fn reset_authentication(&self) {
        self.manager.set_auth_state(AuthState::Unauthenticated);
        self.manager.clear_failure();
        self.mailbox.clear_all();
        info!("authentication state reset");
    }
}

#[async_trait]
impl Authenticator for AuthFlow {
    async fn ensure_authenticated(&self, cancel: &CancellationToken) -> Result<()> {
        AuthFlow::ensure_authenticated(self, cancel).await
    }
}
