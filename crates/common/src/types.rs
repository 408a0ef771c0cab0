use serde::{Deserialize, Serialize};

/// The narrow identity the messaging protocol needs to address a user:
/// the numeric user id plus the per-session access token the server hands
/// out alongside it. Both are required to build an input peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: i64,
    pub access_hash: i64,
}

impl Recipient {
    #[must_use]
    pub fn new(user_id: i64, access_hash: i64) -> Self {
        Self {
            user_id,
            access_hash,
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user {}", self.user_id)
    }
}
