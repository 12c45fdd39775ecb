use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One of the two authentication regimes selectable per request.
///
/// Modeled as a tagged variant rather than a trait object at the data-model
/// level: the tag alone selects behavior, the variant itself carries no
/// state (see [`Credentials`] for the state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    Gemini,
    VertexAi,
}

impl AuthStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStrategy::Gemini => "gemini",
            AuthStrategy::VertexAi => "vertex_ai",
        }
    }
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy-scoped credential material.
///
/// Gemini credentials are opaque API keys; VertexAI credentials are either a
/// ready access token or a service-account key used to mint one. `Debug` is
/// implemented by hand so secrets never land in a log line through `{:?}`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Gemini { api_key: String },
    VertexAi {
        project_id: String,
        #[serde(default = "default_location")]
        location: String,
        #[serde(flatten)]
        source: VertexCredentialSource,
    },
}

/// Either an access token is already in hand, or a service-account key is
/// present and must be exchanged for one.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VertexCredentialSource {
    AccessToken { access_token: String },
    ServiceAccount {
        /// A filesystem path or the raw inline JSON of a service-account key.
        service_account_key: String,
    },
}

pub fn default_location() -> String {
    "us-central1".to_string()
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Gemini { .. } => f
                .debug_struct("Credentials::Gemini")
                .field("api_key", &"<redacted>")
                .finish(),
            Credentials::VertexAi {
                project_id,
                location,
                ..
            } => f
                .debug_struct("Credentials::VertexAi")
                .field("project_id", project_id)
                .field("location", location)
                .field("source", &"<redacted>")
                .finish(),
        }
    }
}

impl Credentials {
    pub fn strategy(&self) -> AuthStrategy {
        match self {
            Credentials::Gemini { .. } => AuthStrategy::Gemini,
            Credentials::VertexAi { .. } => AuthStrategy::VertexAi,
        }
    }
}

/// `{type, credentials}` resolved once per process from config sources, and
/// augmentable or overridable per request.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub strategy: AuthStrategy,
    pub credentials: Credentials,
}

/// A cached credential plus its expiry, in epoch seconds.
///
/// Usable iff `now < expires_at_epoch_seconds`. TTL is strategy-dependent:
/// Gemini API keys never really expire (cached for 3600s as a nominal
/// refresh boundary); VertexAI access tokens are cached for 300s with a 60s
/// safety margin already folded into `expires_at_epoch_seconds` by the
/// exchanger.
#[derive(Debug, Clone)]
pub struct CredentialCacheEntry {
    pub credentials: Credentials,
    pub expires_at_epoch_seconds: u64,
}

impl CredentialCacheEntry {
    pub fn is_usable(&self) -> bool {
        now_epoch_seconds() < self.expires_at_epoch_seconds
    }
}

pub fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub const GEMINI_CACHE_TTL_SECONDS: u64 = 3600;
pub const VERTEX_ACCESS_TOKEN_ASSUMED_TTL_SECONDS: u64 = 300;
