use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum Error {
    /// A required credential key has no real value yet. This is not a failed
    /// attempt and must not start the cooldown timer.
    #[error("authentication is not configured: {key} is unset")]
    NotConfigured { key: &'static str },

    /// A previous authentication attempt failed recently; retry later.
    #[error("authentication cooling down, retry in {}s", remaining.as_secs().max(1))]
    Cooldown { remaining: Duration },

    #[error("{operation} timed out after {}s", elapsed.as_secs())]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("operation cancelled by caller")]
    Cancelled,

    /// The on-disk session artifact failed its structural validity check.
    #[error("session artifact is corrupt: {detail}")]
    CorruptArtifact { detail: String },

    /// The delete-and-retry budget for corrupt artifacts is exhausted.
    #[error("session construction failed after {attempts} attempts: {detail}")]
    ConstructExhausted { attempts: u32, detail: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// True when the failure counts as a real authentication attempt and
    /// should arm the cooldown timer. A mistyped code or password is
    /// recoverable by retrying the same round and does not count.
    #[must_use]
    pub fn arms_cooldown(&self) -> bool {
        !matches!(
            self,
            Self::NotConfigured { .. }
                | Self::Cooldown { .. }
                | Self::Cancelled
                | Self::Api(ApiError::InvalidCode)
                | Self::Api(ApiError::WrongPassword)
        )
    }
}

impl embergram_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

embergram_common::impl_context!();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_message_names_remaining_seconds() {
        let err = Error::Cooldown {
            remaining: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "authentication cooling down, retry in 42s");
    }

    #[test]
    fn sub_second_cooldown_never_reports_zero() {
        let err = Error::Cooldown {
            remaining: Duration::from_millis(300),
        };
        assert!(err.to_string().contains("retry in 1s"));
    }

    #[test]
    fn not_configured_and_cancelled_do_not_arm_cooldown() {
        assert!(!Error::NotConfigured { key: "phone" }.arms_cooldown());
        assert!(!Error::Cancelled.arms_cooldown());
        assert!(
            Error::Timeout {
                operation: "sign in",
                elapsed: Duration::from_secs(30),
            }
            .arms_cooldown()
        );
    }
}
