use async_trait::async_trait;

use crate::auth::jwt;
use crate::auth::types::{
    AuthStrategy, Credentials, VertexCredentialSource, VERTEX_ACCESS_TOKEN_ASSUMED_TTL_SECONDS,
    now_epoch_seconds,
};
use crate::error::Error;

/// Strategy-specific behavior behind the single message-passing interface
/// the `AuthCoordinator` actors expose. Each actor owns exactly one
/// `Box<dyn CredentialBackend>`, so the actor message enum stays
/// strategy-agnostic.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    fn strategy(&self) -> AuthStrategy;

    /// Exchange/validate `credentials`, returning the usable credentials
    /// plus their expiry in epoch seconds.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(Credentials, u64), Error>;

    /// Check minimal field presence without network I/O.
    fn validate(&self, credentials: &Credentials) -> Result<(), Error>;

    /// `(header name, header value)` pairs to attach to the upstream request.
    fn headers(&self, credentials: &Credentials) -> Vec<(&'static str, String)>;

    fn base_url(&self, credentials: &Credentials) -> String;

    fn build_path(&self, credentials: &Credentials, model: &str, endpoint: &str) -> String;

    /// Path for `list_models`/`get_model`, which has no `{model}:{endpoint}`
    /// shape of its own.
    fn models_path(&self, credentials: &Credentials, name: Option<&str>) -> String;
}

pub struct GeminiBackend {
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialBackend for GeminiBackend {
    fn strategy(&self) -> AuthStrategy {
        AuthStrategy::Gemini
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(Credentials, u64), Error> {
        let _ = &self.client;
        match credentials {
            Credentials::Gemini { .. } => Ok((
                credentials.clone(),
                now_epoch_seconds() + crate::auth::types::GEMINI_CACHE_TTL_SECONDS,
            )),
            Credentials::VertexAi { .. } => Err(Error::config(
                "GeminiBackend received VertexAI credentials",
            )),
        }
    }

    fn validate(&self, credentials: &Credentials) -> Result<(), Error> {
        match credentials {
            Credentials::Gemini { api_key } if !api_key.trim().is_empty() => Ok(()),
            Credentials::Gemini { .. } => {
                Err(Error::config("Gemini api_key must be non-empty"))
            }
            Credentials::VertexAi { .. } => {
                Err(Error::config("expected Gemini credentials"))
            }
        }
    }

    fn headers(&self, credentials: &Credentials) -> Vec<(&'static str, String)> {
        let Credentials::Gemini { api_key } = credentials else {
            return Vec::new();
        };
        vec![
            ("x-goog-api-key", api_key.clone()),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    fn base_url(&self, _credentials: &Credentials) -> String {
        "https://generativelanguage.googleapis.com/v1beta".to_string()
    }

    fn build_path(&self, _credentials: &Credentials, model: &str, endpoint: &str) -> String {
        format!("models/{model}:{endpoint}")
    }

    fn models_path(&self, _credentials: &Credentials, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("models/{name}"),
            None => "models".to_string(),
        }
    }
}

pub struct VertexAiBackend {
    client: reqwest::Client,
}

impl VertexAiBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialBackend for VertexAiBackend {
    fn strategy(&self) -> AuthStrategy {
        AuthStrategy::VertexAi
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(Credentials, u64), Error> {
        let Credentials::VertexAi {
            project_id,
            location,
            source,
        } = credentials
        else {
            return Err(Error::config("VertexAiBackend received Gemini credentials"));
        };

        match source {
            VertexCredentialSource::AccessToken { access_token } => Ok((
                credentials.clone(),
                now_epoch_seconds() + VERTEX_ACCESS_TOKEN_ASSUMED_TTL_SECONDS,
            ))
            .map(|(_, ttl)| {
                (
                    Credentials::VertexAi {
                        project_id: project_id.clone(),
                        location: location.clone(),
                        source: VertexCredentialSource::AccessToken {
                            access_token: access_token.clone(),
                        },
                    },
                    ttl,
                )
            }),
            VertexCredentialSource::ServiceAccount {
                service_account_key,
            } => {
                let key = jwt::load_service_account_key(service_account_key)?;
                let assertion = jwt::sign_assertion(&key)?;
                let token = jwt::exchange_assertion(&self.client, &key.token_uri, &assertion)
                    .await
                    .map_err(|e| Error::auth_with_cause("VertexAI token exchange failed", e))?;

                let expires_at = now_epoch_seconds() + token.expires_in.saturating_sub(60);
                let refreshed = Credentials::VertexAi {
                    project_id: project_id.clone(),
                    location: location.clone(),
                    source: VertexCredentialSource::AccessToken {
                        access_token: token.access_token,
                    },
                };
                Ok((refreshed, expires_at))
            }
        }
    }

    fn validate(&self, credentials: &Credentials) -> Result<(), Error> {
        let Credentials::VertexAi {
            project_id,
            location,
            source,
        } = credentials
        else {
            return Err(Error::config("expected VertexAI credentials"));
        };
        if project_id.trim().is_empty() {
            return Err(Error::config("VertexAI project_id must be non-empty"));
        }
        if location.trim().is_empty() {
            return Err(Error::config("VertexAI location must be non-empty"));
        }
        match source {
            VertexCredentialSource::AccessToken { access_token } if access_token.trim().is_empty() => {
                Err(Error::config("VertexAI access_token must be non-empty"))
            }
            VertexCredentialSource::ServiceAccount {
                service_account_key,
            } if service_account_key.trim().is_empty() => Err(Error::config(
                "VertexAI service_account_key must be non-empty",
            )),
            _ => Ok(()),
        }
    }

    fn headers(&self, credentials: &Credentials) -> Vec<(&'static str, String)> {
        let Credentials::VertexAi {
            source: VertexCredentialSource::AccessToken { access_token },
            ..
        } = credentials
        else {
            return Vec::new();
        };
        vec![
            ("Authorization", format!("Bearer {access_token}")),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    fn base_url(&self, credentials: &Credentials) -> String {
        let Credentials::VertexAi { location, .. } = credentials else {
            return String::new();
        };
        format!("https://{location}-aiplatform.googleapis.com/v1")
    }

    fn build_path(&self, credentials: &Credentials, model: &str, endpoint: &str) -> String {
        let Credentials::VertexAi {
            project_id,
            location,
            ..
        } = credentials
        else {
            return String::new();
        };
        format!(
            "projects/{project_id}/locations/{location}/publishers/google/models/{model}:{endpoint}"
        )
    }

    fn models_path(&self, credentials: &Credentials, name: Option<&str>) -> String {
        let Credentials::VertexAi {
            project_id,
            location,
            ..
        } = credentials
        else {
            return String::new();
        };
        match name {
            Some(name) => format!(
                "projects/{project_id}/locations/{location}/publishers/google/models/{name}"
            ),
            None => format!("projects/{project_id}/locations/{location}/publishers/google/models"),
        }
    }
}
