//! Configuration query for session construction.
//!
//! Construction reads the active credential set through a [`SettingsQuery`]
//! presented with a key name. Unset keys resolve to safe non-functional
//! placeholders so construction never blocks — real values are required at
//! authentication time, not at construction time.

use std::{collections::HashMap, path::PathBuf};

use secrecy::{ExposeSecret, Secret};

/// Recognized configuration keys.
pub mod keys {
    pub const API_ID: &str = "telegram.api_id";
    pub const API_HASH: &str = "telegram.api_hash";
    pub const PHONE: &str = "telegram.phone";
    pub const SESSION_PATH: &str = "telegram.session_path";
}

const PLACEHOLDER_API_ID: i32 = 1;
const PLACEHOLDER_API_HASH: &str = "00000000000000000000000000000000";
const DEFAULT_SESSION_PATH: &str = "embergram.session";

/// Read access to the active configuration, key by key.
///
/// The host decides where values live (env, vault, database). Returning
/// `None` for a key is always safe; a placeholder is substituted.
pub trait SettingsQuery: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// The resolved credential set a protocol client is built from.
#[derive(Clone)]
pub struct ClientSettings {
    pub api_id: i32,
    pub api_hash: Secret<String>,
    pub phone: String,
    pub session_path: PathBuf,
}

impl ClientSettings {
    /// Resolve the current credential set, substituting placeholders for
    /// unset or unparsable keys.
    pub fn resolve(query: &dyn SettingsQuery) -> Self {
        let api_id = match query.get(keys::API_ID).map(|v| v.parse::<i32>()) {
            Some(Ok(id)) => id,
            Some(Err(_)) => {
                tracing::warn!(key = keys::API_ID, "api id is not numeric, using placeholder");
                PLACEHOLDER_API_ID
            },
            None => PLACEHOLDER_API_ID,
        };
        let api_hash = query
            .get(keys::API_HASH)
            .unwrap_or_else(|| PLACEHOLDER_API_HASH.to_owned());
        let phone = query.get(keys::PHONE).unwrap_or_default();
        let session_path = query
            .get(keys::SESSION_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_PATH));

        Self {
            api_id,
            api_hash: Secret::new(api_hash),
            phone,
            session_path,
        }
    }

    /// True when no real phone number has been configured. The auth path
    /// uses this to report "not configured" instead of attempting a login
    /// that cannot succeed.
    #[must_use]
    pub fn is_placeholder_phone(&self) -> bool {
        self.phone.trim().is_empty()
    }

    #[must_use]
    pub fn api_hash_value(&self) -> String {
        self.api_hash.expose_secret().clone()
    }
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("api_id", &self.api_id)
            .field("api_hash", &"[REDACTED]")
            .field("phone", &self.phone)
            .field("session_path", &self.session_path)
            .finish()
    }
}

/// Settings backed by process environment variables.
///
/// `telegram.api_id` maps to `TG_API_ID` and so on.
pub struct EnvSettings {
    prefix: &'static str,
}

impl EnvSettings {
    #[must_use]
    pub fn new() -> Self {
        Self { prefix: "TG" }
    }

    /// Load a `.env` file into the process environment first, then read
    /// from it. A missing file is normal.
    #[must_use]
    pub fn from_dotenv() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded environment file"),
            Err(error) if error.not_found() => {},
            Err(error) => tracing::warn!(%error, "failed to load environment file"),
        }
        Self::new()
    }

    #[must_use]
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self { prefix }
    }

    fn var_name(&self, key: &str) -> String {
        let leaf = key.rsplit('.').next().unwrap_or(key);
        format!("{}_{}", self.prefix, leaf.to_uppercase())
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsQuery for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// In-memory settings, used by tests and by admin credential rotation.
#[derive(Default)]
pub struct MapSettings {
    values: HashMap<String, String>,
}

impl MapSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_owned(), value.into());
        self
    }
}

impl SettingsQuery for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}
