//! Contact relationship checks with one-shot automatic remediation.
//!
//! A confirmed mutual relationship is cached for 24 hours. Anything else
//! forces a fresh check: resolve the recipient's flags, try exactly one
//! automatic "add to contacts", re-observe after a short settle delay, and
//! classify what remains for the recipient or an admin to do.

use std::{sync::Arc, time::Duration};

use {chrono::Utc, tokio_util::sync::CancellationToken, tracing::{debug, warn}};

use {
    embergram_common::Recipient,
    embergram_session::api::{ApiAccess, ContactFlags, call_with_deadline},
};

use crate::{error::Result, record::ContactVerificationRecord, store::ContactRecordStore};

/// Deadline for the interactive check path.
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the read-only existence probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between a successful automatic add and the single re-observation,
/// so server-side propagation has a moment to land.
const ADD_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Contact name used when the sender adds the recipient automatically.
const AUTO_ADD_FIRST_NAME: &str = "Customer";

/// Classified result of a contact check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactOutcome {
    /// Both directions confirmed; ephemeral sends may proceed.
    Mutual,
    /// The sender's side is in place; the recipient still has to add back.
    AwaitingReciprocal { instruction: String },
    /// Automatic remediation failed; the recipient gets instructions and an
    /// admin is flagged.
    AddFailed {
        instruction: String,
        escalation: String,
    },
}

impl ContactOutcome {
    #[must_use]
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Mutual)
    }
}

pub struct ContactVerifier {
    api: Arc<dyn ApiAccess>,
    store: Arc<dyn ContactRecordStore>,
}

impl ContactVerifier {
    #[must_use]
    pub fn new(api: Arc<dyn ApiAccess>, store: Arc<dyn ContactRecordStore>) -> Self {
        Self { api, store }
    }

    /// Check whether `recipient` can receive ephemeral media, remediating
    /// automatically where possible. Every fresh check stamps the record;
    /// only the cache-hit path returns it untouched.
    pub async fn check(
        &self,
        recipient: &Recipient,
        cancel: &CancellationToken,
    ) -> Result<(ContactVerificationRecord, ContactOutcome)> {
        let mut record = match self.store.get_by_recipient(recipient.user_id).await? {
            Some(record) => record,
            None => {
                self.store
                    .create(ContactVerificationRecord::new(recipient.user_id))
                    .await?
            },
        };

        if record.cached_mutual_is_fresh(Utc::now()) {
            debug!(recipient = %recipient, "mutual contact cache hit");
            return Ok((record, ContactOutcome::Mutual));
        }

        let outcome = self.fresh_check(recipient, &mut record, cancel).await;
        record.last_checked_at = Utc::now();
        if let Err(error) = &outcome {
            record.last_error = Some(error.to_string());
        }
        self.store.update(&record).await?;

        Ok((record, outcome?))
    }

    async fn fresh_check(
        &self,
        recipient: &Recipient,
        record: &mut ContactVerificationRecord,
        cancel: &CancellationToken,
    ) -> Result<ContactOutcome> {
        let api = self.api.api()?;
        let mut flags = call_with_deadline(
            "contact flags",
            CHECK_TIMEOUT,
            cancel,
            api.contact_flags(recipient),
        )
        .await?;

        let mut add_error = None;
        if !flags.contact {
            match call_with_deadline(
                "add contact",
                CHECK_TIMEOUT,
                cancel,
                api.add_contact(recipient, AUTO_ADD_FIRST_NAME),
            )
            .await
            {
                Ok(()) => {
                    record.is_auto_added_by_sender = true;
                    tokio::time::sleep(ADD_SETTLE_DELAY).await;
                    match call_with_deadline(
                        "contact flags",
                        CHECK_TIMEOUT,
                        cancel,
                        api.contact_flags(recipient),
                    )
                    .await
                    {
                        Ok(observed) => flags = observed,
                        Err(embergram_session::Error::Cancelled) => {
                            return Err(embergram_session::Error::Cancelled.into());
                        },
                        Err(error) => {
                            warn!(recipient = %recipient, %error, "post-add re-check failed");
                            // The add itself went through; assume one-way
                            // until the next check observes more.
                            flags.contact = true;
                        },
                    }
                },
                Err(embergram_session::Error::Cancelled) => {
                    return Err(embergram_session::Error::Cancelled.into());
                },
                Err(error) => {
                    warn!(recipient = %recipient, %error, "automatic contact add failed");
                    add_error = Some(error.to_string());
                },
            }
        }

        Ok(classify(recipient.user_id, flags, add_error, record))
    }

    /// Read-only existence check: resolve the current flags without any
    /// remediation and without touching the stored record.
    pub async fn probe(
        &self,
        recipient: &Recipient,
        cancel: &CancellationToken,
    ) -> Result<ContactFlags> {
        let api = self.api.api()?;
        Ok(call_with_deadline(
            "contact probe",
            PROBE_TIMEOUT,
            cancel,
            api.contact_flags(recipient),
        )
        .await?)
    }

    /// Record that the recipient has messaged the sender at least once.
    /// Idempotent; a weak responsiveness signal only.
    pub async fn mark_recipient_sent_message(
        &self,
        recipient_id: i64,
    ) -> Result<ContactVerificationRecord> {
        let mut record = match self.store.get_by_recipient(recipient_id).await? {
            Some(record) => {
                if record.has_recipient_sent_message {
                    return Ok(record);
                }
                record
            },
            None => {
                self.store
                    .create(ContactVerificationRecord::new(recipient_id))
                    .await?
            },
        };
        record.has_recipient_sent_message = true;
        self.store.update(&record).await?;
        Ok(record)
    }
}

/// Map observed flags (and the one remediation attempt) onto exactly one of
/// the three outcomes, mutating the record's flags to match.
fn classify(
    recipient_id: i64,
    flags: ContactFlags,
    add_error: Option<String>,
    record: &mut ContactVerificationRecord,
) -> ContactOutcome {
    if add_error.is_none() && flags.contact && flags.mutual_contact {
        record.is_mutual_contact = true;
        record.last_error = None;
        return ContactOutcome::Mutual;
    }

    record.is_mutual_contact = false;
    record.is_user_instructed_to_add_contact = true;

    if add_error.is_none() && flags.contact {
        record.last_error = None;
        return ContactOutcome::AwaitingReciprocal {
            instruction: reciprocal_instruction(),
        };
    }

    record.is_admin_notified = true;
    record.last_error = Some(add_error.unwrap_or_else(|| {
        "recipient is still not a contact after automatic add".to_owned()
    }));
    ContactOutcome::AddFailed {
        instruction: reciprocal_instruction(),
        escalation: admin_escalation(recipient_id),
    }
}

fn reciprocal_instruction() -> String {
    "Add the sender to your contacts and send them a short message, then retry.".to_owned()
}

fn admin_escalation(recipient_id: i64) -> String {
    format!(
        "Automatic contact add failed for user {recipient_id}; ephemeral sends stay blocked until the relationship is fixed manually."
    )
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use {async_trait::async_trait, chrono::Duration as ChronoDuration};

    use embergram_session::api::{ApiError, LoginStep, MediaRef, SentMedia, TelegramApi};

    use super::*;
    use crate::store::MemoryContactStore;

    struct ScriptedApi {
        flags: std::sync::Mutex<VecDeque<ContactFlags>>,
        add_failure: Option<ApiError>,
        flags_calls: AtomicUsize,
        add_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn with_flags(flags: &[ContactFlags]) -> Self {
            Self {
                flags: std::sync::Mutex::new(flags.iter().copied().collect()),
                add_failure: None,
                flags_calls: AtomicUsize::new(0),
                add_calls: AtomicUsize::new(0),
            }
        }

        fn failing_add(flags: &[ContactFlags], failure: ApiError) -> Self {
            Self {
                add_failure: Some(failure),
                ..Self::with_flags(flags)
            }
        }
    }

    #[async_trait]
    impl TelegramApi for ScriptedApi {
        async fn is_authorized(&self) -> std::result::Result<bool, ApiError> {
            Ok(true)
        }
        async fn request_login_code(&self, _phone: &str) -> std::result::Result<(), ApiError> {
            Ok(())
        }
        async fn submit_code(&self, _code: &str) -> std::result::Result<LoginStep, ApiError> {
            Ok(LoginStep::Done)
        }
        async fn submit_password(
            &self,
            _password: &str,
        ) -> std::result::Result<LoginStep, ApiError> {
            Ok(LoginStep::Done)
        }
        async fn persist_session(&self) -> std::result::Result<(), ApiError> {
            Ok(())
        }
        async fn disconnect(&self) {}

        async fn contact_flags(
            &self,
            _recipient: &Recipient,
        ) -> std::result::Result<ContactFlags, ApiError> {
            self.flags_calls.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.flags.lock().unwrap();
            match queue.pop_front() {
                Some(flags) => Ok(flags),
                None => Err(ApiError::Transport {
                    context: "contact flags",
                    message: "flag script exhausted".to_owned(),
                }),
            }
        }

        async fn add_contact(
            &self,
            _recipient: &Recipient,
            _first_name: &str,
        ) -> std::result::Result<(), ApiError> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            match &self.add_failure {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }

        async fn send_cached_media(
            &self,
            _recipient: &Recipient,
            _media: &MediaRef,
            _ttl_seconds: i32,
        ) -> std::result::Result<SentMedia, ApiError> {
            Err(ApiError::Unauthorized)
        }
        async fn upload_and_send(
            &self,
            _recipient: &Recipient,
            _path: &Path,
            _ttl_seconds: i32,
        ) -> std::result::Result<SentMedia, ApiError> {
            Err(ApiError::Unauthorized)
        }
        async fn refetch_media(
            &self,
            _message_id: i32,
        ) -> std::result::Result<Option<MediaRef>, ApiError> {
            Ok(None)
        }
    }

    struct FixedAccess(Arc<ScriptedApi>);

    impl ApiAccess for FixedAccess {
        fn api(&self) -> embergram_session::Result<Arc<dyn TelegramApi>> {
            Ok(self.0.clone())
        }
    }

    const MUTUAL: ContactFlags = ContactFlags {
        contact: true,
        mutual_contact: true,
    };
    const ONE_WAY: ContactFlags = ContactFlags {
        contact: true,
        mutual_contact: false,
    };
    const STRANGER: ContactFlags = ContactFlags {
        contact: false,
        mutual_contact: false,
    };

    fn recipient() -> Recipient {
        Recipient::new(377_114_917, 42)
    }

    fn verifier(api: ScriptedApi) -> (ContactVerifier, Arc<ScriptedApi>, Arc<MemoryContactStore>) {
        let api = Arc::new(api);
        let store = Arc::new(MemoryContactStore::new());
        let verifier = ContactVerifier::new(Arc::new(FixedAccess(api.clone())), store.clone());
        (verifier, api, store)
    }

    #[tokio::test]
    async fn fresh_mutual_cache_hit_skips_the_network() {
        let (verifier, api, store) = verifier(ScriptedApi::with_flags(&[]));
        let mut seeded = ContactVerificationRecord::new(recipient().user_id);
        seeded.is_mutual_contact = true;
        seeded.last_checked_at = Utc::now() - ChronoDuration::hours(1);
        store.create(seeded.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        let (first, outcome) = verifier.check(&recipient(), &cancel).await.unwrap();
        assert!(outcome.is_clear());
        let (second, _) = verifier.check(&recipient(), &cancel).await.unwrap();

        assert_eq!(first, seeded);
        assert_eq!(second, seeded);
        assert_eq!(api.flags_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_mutual_cache_forces_a_fresh_check() {
        let (verifier, api, store) = verifier(ScriptedApi::with_flags(&[MUTUAL]));
        let mut seeded = ContactVerificationRecord::new(recipient().user_id);
        seeded.is_mutual_contact = true;
        seeded.last_checked_at = Utc::now() - ChronoDuration::hours(25);
        store.create(seeded).await.unwrap();

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_clear());
        assert_eq!(api.flags_calls.load(Ordering::SeqCst), 1);
        assert!(record.cached_mutual_is_fresh(Utc::now()));
    }

    #[tokio::test]
    async fn existing_one_way_contact_awaits_reciprocal_without_an_add() {
        let (verifier, api, _) = verifier(ScriptedApi::with_flags(&[ONE_WAY]));

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ContactOutcome::AwaitingReciprocal { .. }));
        assert_eq!(api.add_calls.load(Ordering::SeqCst), 0);
        assert!(record.is_user_instructed_to_add_contact);
        assert!(!record.is_admin_notified);
        assert_eq!(record.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_add_establishing_mutual_returns_clear() {
        let (verifier, api, _) = verifier(ScriptedApi::with_flags(&[STRANGER, MUTUAL]));

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_clear());
        assert_eq!(api.add_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.flags_calls.load(Ordering::SeqCst), 2);
        assert!(record.is_auto_added_by_sender);
        assert!(record.is_mutual_contact);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_add_without_reciprocation_instructs_the_user() {
        let (verifier, _, _) = verifier(ScriptedApi::with_flags(&[STRANGER, ONE_WAY]));

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        let ContactOutcome::AwaitingReciprocal { instruction } = outcome else {
            panic!("expected AwaitingReciprocal, got {outcome:?}");
        };
        assert!(instruction.contains("contacts"));
        assert!(record.is_user_instructed_to_add_contact);
        assert!(!record.is_admin_notified);
    }

    #[tokio::test]
    async fn failed_auto_add_escalates_to_admin() {
        let (verifier, api, _) = verifier(ScriptedApi::failing_add(
            &[STRANGER],
            ApiError::Rpc {
                name: "CONTACT_ADD_FAILED".to_owned(),
            },
        ));

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        let ContactOutcome::AddFailed {
            instruction,
            escalation,
        } = outcome
        else {
            panic!("expected AddFailed, got {outcome:?}");
        };
        assert!(!instruction.is_empty());
        assert!(escalation.contains("377114917"));
        assert_eq!(api.add_calls.load(Ordering::SeqCst), 1);
        assert!(record.is_user_instructed_to_add_contact);
        assert!(record.is_admin_notified);
        assert!(record.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn add_that_does_not_take_effect_escalates() {
        let (verifier, _, _) = verifier(ScriptedApi::with_flags(&[STRANGER, STRANGER]));

        let (record, outcome) = verifier
            .check(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ContactOutcome::AddFailed { .. }));
        assert!(record.is_admin_notified);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn transport_failure_is_stamped_onto_the_record() {
        let (verifier, _, store) = verifier(ScriptedApi::with_flags(&[]));

        let result = verifier.check(&recipient(), &CancellationToken::new()).await;
        assert!(result.is_err());

        let record = store
            .get_by_recipient(recipient().user_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn probe_reads_flags_without_remediating() {
        let (verifier, api, store) = verifier(ScriptedApi::with_flags(&[STRANGER]));

        let flags = verifier
            .probe(&recipient(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!flags.contact);
        assert_eq!(api.add_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get_by_recipient(recipient().user_id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn mark_recipient_sent_message_is_idempotent() {
        let (verifier, _, store) = verifier(ScriptedApi::with_flags(&[]));

        let first = verifier.mark_recipient_sent_message(9).await.unwrap();
        assert!(first.has_recipient_sent_message);

        let second = verifier.mark_recipient_sent_message(9).await.unwrap();
        assert_eq!(first, second);
        assert!(
            store
                .get_by_recipient(9)
                .await
                .unwrap()
                .unwrap()
                .has_recipient_sent_message
        );
    }
}
