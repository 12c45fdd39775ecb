//! Configuration resolution: environment variables, process-wide defaults,
//! and per-call overrides.
//!
//! Hand-rolled rather than built on `figment`: the env contract here has
//! irregular aliasing (`VERTEX_JSON_FILE` as an alias for
//! `VERTEX_SERVICE_ACCOUNT`, `GOOGLE_CLOUD_PROJECT` as a fallback for
//! `VERTEX_PROJECT_ID`) that a straightforward `Env::raw()` merge can't
//! express without a second pass anyway, so the second pass is all there is.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde_json::Value;

use crate::auth::{AuthConfig, AuthStrategy, Credentials, VertexCredentialSource};
use crate::error::Error;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite";
pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Process-wide configuration resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl AppConfig {
    /// Resolve configuration from environment variables.
    ///
    /// Selection order when both regimes have complete credentials:
    /// `GEMINI_DEFAULT_AUTH` (`"gemini"` or `"vertex_ai"`), if set, wins;
    /// otherwise Gemini wins, mirroring "explicit beats implicit." When only
    /// one regime is configured, that one is used regardless of
    /// `GEMINI_DEFAULT_AUTH`.
    pub fn from_env() -> Result<Self, Error> {
        let gemini_key = non_empty_env("GEMINI_API_KEY");
        let project_id = non_empty_env("VERTEX_PROJECT_ID").or_else(|| non_empty_env("GOOGLE_CLOUD_PROJECT"));
        let default_auth = non_empty_env("GEMINI_DEFAULT_AUTH")
            .map(|v| {
                serde_json::from_value::<AuthStrategy>(Value::String(v.clone())).map_err(|_| {
                    Error::config(format!(
                        "invalid GEMINI_DEFAULT_AUTH value {v:?}: expected \"gemini\" or \"vertex_ai\""
                    ))
                })
            })
            .transpose()?;

        let auth = match (gemini_key, project_id) {
            (Some(_api_key), Some(project_id)) if default_auth == Some(AuthStrategy::VertexAi) => {
                AuthConfig {
                    strategy: AuthStrategy::VertexAi,
                    credentials: vertex_credentials_from_env(project_id)?,
                }
            }
            (Some(api_key), _) => AuthConfig {
                strategy: AuthStrategy::Gemini,
                credentials: Credentials::Gemini { api_key },
            },
            (None, Some(project_id)) => AuthConfig {
                strategy: AuthStrategy::VertexAi,
                credentials: vertex_credentials_from_env(project_id)?,
            },
            (None, None) => {
                return Err(Error::config(
                    "no authentication configured: set GEMINI_API_KEY or VERTEX_PROJECT_ID",
                ));
            }
        };

        let model = non_empty_env("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let timeout = non_empty_env("GEMINI_TIMEOUT_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let max_retries = non_empty_env("GEMINI_MAX_RETRIES")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        Ok(Self {
            auth,
            model,
            timeout,
            max_retries,
        })
    }
}

fn vertex_credentials_from_env(project_id: String) -> Result<Credentials, Error> {
    let location = non_empty_env("VERTEX_LOCATION")
        .or_else(|| non_empty_env("GOOGLE_CLOUD_LOCATION"))
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string());

    let service_account_key = non_empty_env("VERTEX_SERVICE_ACCOUNT").or_else(|| non_empty_env("VERTEX_JSON_FILE"));
    let access_token = non_empty_env("VERTEX_ACCESS_TOKEN");

    let source = match (service_account_key, access_token) {
        (Some(key), _) => VertexCredentialSource::ServiceAccount {
            service_account_key: key,
        },
        (None, Some(token)) => VertexCredentialSource::AccessToken {
            access_token: token,
        },
        (None, None) => {
            return Err(Error::config(
                "VertexAI selected but neither VERTEX_SERVICE_ACCOUNT nor VERTEX_ACCESS_TOKEN is set",
            ));
        }
    };

    Ok(Credentials::VertexAi {
        project_id,
        location,
        source,
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// The recognized set of per-request generation options. Anything outside
/// this set is rejected up front rather than silently dropped or forwarded
/// to the wire as an unvetted field.
pub const RECOGNIZED_OPTIONS: &[&str] = &[
    "auth",
    "model",
    "temperature",
    "top_p",
    "top_k",
    "max_output_tokens",
    "stop_sequences",
    "candidate_count",
    "response_mime_type",
    "safety_settings",
    "system_instruction",
    "tools",
    "timeout",
    "max_retries",
];

/// Per-call overrides layered over [`AppConfig`] for a single
/// `generate`/`stream_generate`/`count_tokens` call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub auth: Option<crate::auth::AuthOverride>,
    pub model: Option<String>,
    pub generation: BTreeMap<String, Value>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl CallOptions {
    /// Parse a loosely-typed options map (as a caller might hand in from a
    /// dynamic language binding or a config file) into [`CallOptions`],
    /// rejecting any key outside [`RECOGNIZED_OPTIONS`].
    pub fn from_map(mut raw: BTreeMap<String, Value>) -> Result<Self, Error> {
        if let Some(unknown) = raw.keys().find(|k| !RECOGNIZED_OPTIONS.contains(&k.as_str())) {
            return Err(Error::config(format!("unrecognized call option: {unknown}")));
        }

        let model = raw.remove("model").and_then(|v| v.as_str().map(str::to_string));
        let timeout = raw
            .remove("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        let max_retries = raw
            .remove("max_retries")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let auth = raw
            .remove("auth")
            .map(|v| {
                serde_json::from_value::<AuthStrategy>(v)
                    .map_err(|e| Error::config(format!("invalid auth option: {e}")))
            })
            .transpose()?
            .map(|strategy| crate::auth::AuthOverride {
                strategy: Some(strategy),
                credentials: None,
            });

        Ok(Self {
            auth,
            model,
            generation: raw,
            timeout,
            max_retries,
        })
    }

    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default)
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}
