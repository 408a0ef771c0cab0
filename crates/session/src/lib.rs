//! Long-lived MTProto user session for ephemeral media delivery.
//!
//! Owns the single live protocol handle (lazy construction, corrupted
//! session-artifact recovery, credential rotation), the interactive
//! authentication state machine (code and two-factor rounds with a cooldown
//! after failures), and the credential mailbox that hands operator-supplied
//! values to a blocked authentication step.

pub mod api;
pub mod auth;
pub mod client;
pub mod error;
pub mod mailbox;
pub mod manager;
pub mod settings;

pub use {
    api::{ApiAccess, ApiError, ContactFlags, LoginStep, MediaRef, SentMedia, TelegramApi},
    auth::{AuthFlow, AuthState, Authenticator, LoginOutcome, RequiredInput},
    client::GrammersConnector,
    error::{Error, Result},
    mailbox::{AuthEvent, CredentialKey, CredentialMailbox},
    manager::{Connector, SessionManager},
    settings::{ClientSettings, EnvSettings, MapSettings, SettingsQuery},
};
