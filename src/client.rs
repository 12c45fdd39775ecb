//! Public library surface (§6): the single entry point callers construct
//! and hold for the process lifetime.
//!
//! `Client` wires together the Config Resolver, `AuthCoordinator`,
//! `HttpClient`, `StreamingEngine`, and `RequestCoordinator` and re-exposes
//! their operations as one flat API, the way the teacher's top-level service
//! struct fronts its own subsystems.

use std::sync::Arc;

use crate::auth::{AuthConfig, AuthCoordinator, AuthStrategy, Credentials};
use crate::chat::ChatSession;
use crate::config::{AppConfig, CallOptions};
use crate::coordinator::{ContentInput, ModelInfo, RequestCoordinator};
use crate::error::Error;
use crate::http::HttpClient;
use crate::streaming::{SessionId, SessionInfo, StreamingEngine, Subscription};

/// Process-wide handle onto the Gemini/VertexAI client core.
///
/// Construct once (via [`Client::from_env`] or [`Client::configure`]) and
/// share via `Arc` across tasks; every subsystem it wires together is
/// already internally `Arc`-shared and safe under concurrent use (§5).
pub struct Client {
    coordinator: Arc<RequestCoordinator>,
    streaming: Arc<StreamingEngine>,
}

const DEFAULT_UNARY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_STREAM_SESSIONS: usize = 1000;

impl Client {
    /// Resolve configuration from the environment (§4.6) and build a client.
    pub async fn from_env() -> Result<Self, Error> {
        let config = AppConfig::from_env()?;
        Self::configure(
            config.auth.strategy,
            config.auth.credentials,
            config.timeout,
            config.max_retries,
        )
        .await
    }

    /// Build a client for one explicit strategy/credentials pair, bypassing
    /// environment resolution.
    pub async fn configure(
        strategy: AuthStrategy,
        credentials: Credentials,
        default_timeout: std::time::Duration,
        default_max_retries: u32,
    ) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_UNARY_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        let auth = Arc::new(
            AuthCoordinator::new(AuthConfig { strategy, credentials }, http_client.clone()).await?,
        );
        auth.validate(strategy).await?;

        let http = HttpClient::from_client(http_client);
        let streaming = Arc::new(StreamingEngine::new(
            http.clone(),
            auth.clone(),
            DEFAULT_MAX_STREAM_SESSIONS,
        ));
        let coordinator = Arc::new(RequestCoordinator::new(
            http,
            auth,
            streaming.clone(),
            crate::config::DEFAULT_MODEL,
            default_timeout,
            default_max_retries,
        ));

        Ok(Self {
            coordinator,
            streaming,
        })
    }

    pub async fn generate(
        &self,
        content: impl Into<ContentInput>,
        opts: &CallOptions,
    ) -> Result<serde_json::Value, Error> {
        self.coordinator.generate(content, opts).await
    }

    pub async fn count_tokens(
        &self,
        content: impl Into<ContentInput>,
        opts: &CallOptions,
    ) -> Result<u64, Error> {
        self.coordinator.count_tokens(content, opts).await
    }

    pub async fn list_models(&self, opts: &CallOptions) -> Result<Vec<ModelInfo>, Error> {
        self.coordinator.list_models(opts).await
    }

    pub async fn get_model(&self, name: &str, opts: &CallOptions) -> Result<ModelInfo, Error> {
        self.coordinator.get_model(name, opts).await
    }

    pub async fn model_exists(&self, name: &str, opts: &CallOptions) -> Result<bool, Error> {
        self.coordinator.model_exists(name, opts).await
    }

    /// `stream_generate(content, opts) → {session_id, events_channel}`. The
    /// returned [`Subscription`] is the caller's own `events_channel`.
    pub async fn stream_generate(
        &self,
        content: impl Into<ContentInput>,
        opts: &CallOptions,
    ) -> Result<(SessionId, Subscription), Error> {
        self.coordinator.stream_generate(content, opts).await
    }

    pub fn subscribe(&self, session_id: SessionId) -> Result<Subscription, Error> {
        self.streaming.subscribe(session_id)
    }

    pub fn unsubscribe(&self, session_id: SessionId, subscriber_id: u64) -> Result<(), Error> {
        self.streaming.unsubscribe(session_id, subscriber_id)
    }

    pub fn stop(&self, session_id: SessionId) -> Result<(), Error> {
        self.streaming.stop(session_id)
    }

    pub fn info(&self, session_id: SessionId) -> Result<SessionInfo, Error> {
        self.streaming.info(session_id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.streaming.list()
    }

    /// `new_chat(opts) → ChatSession`. `opts.generation["system_instruction"]`
    /// seeds the session's system instruction, if present.
    pub fn new_chat(&self, opts: &CallOptions) -> ChatSession {
        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_MODEL.to_string());
        let system_instruction = opts
            .generation
            .get("system_instruction")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        ChatSession::new(
            self.coordinator.clone(),
            model,
            system_instruction,
            opts.auth.clone(),
        )
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("default_strategy", &self.coordinator.default_strategy())
            .finish()
    }
}
