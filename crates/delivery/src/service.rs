//! The facade a bot host consumes.
//!
//! Wires the session manager, authentication flow, contact verifier, and
//! delivery engine together behind the handful of operations the host
//! needs: deliver media, check a contact, record responsiveness, drive an
//! interactive login, rotate credentials.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use {
    embergram_common::Recipient,
    embergram_contacts::{
        ContactOutcome, ContactRecordStore, ContactVerificationRecord, ContactVerifier,
    },
    embergram_session::{
        auth::{AuthFlow, AuthState, LoginOutcome},
        mailbox::CredentialMailbox,
        manager::{Connector, SessionManager},
        settings::{ClientSettings, SettingsQuery},
    },
};

use crate::{
    asset::MediaAsset,
    cache::MediaHandleCache,
    engine::{DeliveryEngine, DeliveryOutcome},
    error::Result,
    fetch::FileFetcher,
};

pub struct Courier {
    manager: Arc<SessionManager>,
    mailbox: Arc<CredentialMailbox>,
    flow: Arc<AuthFlow>,
    verifier: Arc<ContactVerifier>,
    engine: DeliveryEngine,
}

impl Courier {
    #[must_use]
    pub fn new(
        query: Arc<dyn SettingsQuery>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ContactRecordStore>,
        fetcher: Arc<dyn FileFetcher>,
    ) -> Self {
        let mailbox = Arc::new(CredentialMailbox::new());
        let manager = Arc::new(SessionManager::new(query, connector, mailbox.clone()));
        let flow = Arc::new(AuthFlow::new(manager.clone(), mailbox.clone()));
        let verifier = Arc::new(ContactVerifier::new(manager.clone(), store));
        let cache = Arc::new(MediaHandleCache::new());
        let engine = DeliveryEngine::new(
            flow.clone(),
            manager.clone(),
            verifier.clone(),
            cache,
            fetcher,
        );
        Self {
            manager,
            mailbox,
            flow,
            verifier,
            engine,
        }
    }

    /// Deliver `asset` to `recipient` as self-destructing media.
    pub async fn deliver(
        &self,
        recipient: &Recipient,
        asset: &MediaAsset,
        ttl_seconds: i32,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        self.engine.deliver(recipient, asset, ttl_seconds, cancel).await
    }

    /// Check (and refresh if stale) the contact relationship for
    /// `recipient`, authenticating first if needed.
    pub async fn check_contact(
        &self,
        recipient: &Recipient,
        cancel: &CancellationToken,
    ) -> Result<(ContactVerificationRecord, ContactOutcome)> {
        self.flow.ensure_authenticated(cancel).await?;
        Ok(self.verifier.check(recipient, cancel).await?)
    }

    /// Record that the recipient messaged the sender; idempotent.
    pub async fn mark_recipient_sent_message(
        &self,
        recipient_id: i64,
    ) -> Result<ContactVerificationRecord> {
        Ok(self.verifier.mark_recipient_sent_message(recipient_id).await?)
    }

    /// One interactive login step, driven by an out-of-band operator input.
    pub async fn login(&self, value: &str) -> Result<LoginOutcome> {
        Ok(self.flow.login(value).await?)
    }

    /// Rotate credentials: retire the live session and construct a fresh
    /// one from `new_settings`.
    pub async fn reinitialize(&self, new_settings: ClientSettings) -> Result<()> {
        Ok(self.manager.reinitialize(new_settings).await?)
    }

    /// Force the authentication machine back to its starting state.
    pub fn reset_authentication(&self) {
        self.flow.reset_authentication();
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.manager.auth_state()
    }

    /// The credential mailbox, for hosts that register prompt notifiers or
    /// feed operator-supplied values directly.
    #[must_use]
    pub fn mailbox(&self) -> Arc<CredentialMailbox> {
        self.mailbox.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use {
        async_trait::async_trait,
        embergram_contacts::MemoryContactStore,
        embergram_session::{
            api::TelegramApi,
            settings::{MapSettings, keys},
        },
    };

    use super::*;
    use crate::testutil::{ScriptedApi, ScriptedFetcher, seed_mutual, sent};

    struct FixedConnector(Arc<ScriptedApi>);

    #[async_trait]
    impl Connector for FixedConnector {
        async fn connect(
            &self,
            _settings: &ClientSettings,
        ) -> embergram_session::Result<Arc<dyn TelegramApi>> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        api: Arc<ScriptedApi>,
        store: Arc<MemoryContactStore>,
        courier: Courier,
        _dir: tempfile::TempDir,
    }

    fn fixture(api: ScriptedApi) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let query = MapSettings::new()
            .with(keys::PHONE, "+15551234567")
            .with(
                keys::SESSION_PATH,
                dir.path().join("courier.session").to_string_lossy(),
            );
        let api = Arc::new(api);
        let store = Arc::new(MemoryContactStore::new());
        let courier = Courier::new(
            Arc::new(query),
            Arc::new(FixedConnector(api.clone())),
            store.clone(),
            Arc::new(ScriptedFetcher::new()),
        );
        Fixture {
            api,
            store,
            courier,
            _dir: dir,
        }
    }

    fn recipient() -> Recipient {
        Recipient::new(377_114_917, 42)
    }

    #[tokio::test]
    async fn delivers_end_to_end_through_the_facade() {
        let f = fixture(ScriptedApi::new().with_uploads(vec![Ok(sent(900, b"fresh"))]));
        seed_mutual(&f.store, recipient().user_id).await;

        let outcome = f
            .courier
            .deliver(
                &recipient(),
                &MediaAsset::local("photo-1", "/tmp/p.jpg"),
                60,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.message_id(), Some(900));
        assert_eq!(f.courier.auth_state(), AuthState::Authenticated);
        assert_eq!(f.api.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_contact_authenticates_then_verifies() {
        let mutual = embergram_session::api::ContactFlags {
            contact: true,
            mutual_contact: true,
        };
        let f = fixture(ScriptedApi::new().with_flags(&[mutual]));

        let (record, outcome) = f
            .courier
            .check_contact(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_clear());
        assert!(record.is_mutual_contact);
        assert_eq!(f.courier.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn login_and_responsiveness_hooks_pass_through() {
        let f = fixture(ScriptedApi::new());

        let outcome = f.courier.login("").await.unwrap();
        assert_eq!(outcome, LoginOutcome::CodeRequired);

        let record = f
            .courier
            .mark_recipient_sent_message(recipient().user_id)
            .await
            .unwrap();
        assert!(record.has_recipient_sent_message);
    }

    #[tokio::test]
    async fn reset_authentication_is_exposed() {
        let f = fixture(ScriptedApi::new());
        seed_mutual(&f.store, recipient().user_id).await;
        f.courier
            .check_contact(&recipient(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.courier.auth_state(), AuthState::Authenticated);

        f.courier.reset_authentication();
        assert_eq!(f.courier.auth_state(), AuthState::Unauthenticated);
    }
}
