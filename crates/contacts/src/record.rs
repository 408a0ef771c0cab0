use {
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
};

/// How long a confirmed mutual-contact result may be trusted without a
/// fresh network check.
pub const MUTUAL_CACHE_HOURS: i64 = 24;

/// Per-recipient audit record of contact verification. Created on the
/// first check, mutated on every re-check, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactVerificationRecord {
    pub recipient_id: i64,
    /// The sender added the recipient automatically during remediation.
    pub is_auto_added_by_sender: bool,
    pub is_mutual_contact: bool,
    pub is_admin_notified: bool,
    pub is_user_instructed_to_add_contact: bool,
    /// Weak responsiveness signal; does not imply a contact relationship.
    pub has_recipient_sent_message: bool,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ContactVerificationRecord {
    #[must_use]
    pub fn new(recipient_id: i64) -> Self {
        Self {
            recipient_id,
            is_auto_added_by_sender: false,
            is_mutual_contact: false,
            is_admin_notified: false,
            is_user_instructed_to_add_contact: false,
            has_recipient_sent_message: false,
            last_checked_at: Utc::now(),
            last_error: None,
        }
    }

    /// A cached mutual result is only trusted inside the 24-hour window;
    /// anything else forces a fresh check.
    #[must_use]
    pub fn cached_mutual_is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.is_mutual_contact
            && now.signed_duration_since(self.last_checked_at) < Duration::hours(MUTUAL_CACHE_HOURS)
    }
}
