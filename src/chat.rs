//! Thin stateful wrapper above the Request Coordinator: append-only,
//! role-alternating message history (§4.5).
//!
//! The system instruction is carried on [`ChatSession`] itself, never folded
//! into `history` — mirroring `GeminiGenerateContentRequest::system_instruction`
//! being a sibling of `contents`, not a member.

use std::collections::BTreeMap;
use std::sync::Arc;

use gemini_schema::{Content, Part};
use serde_json::Value;

use crate::auth::AuthOverride;
use crate::config::CallOptions;
use crate::coordinator::{ContentInput, RequestCoordinator};
use crate::error::Error;

/// One append-only, role-alternating conversation.
///
/// History always starts with a `user` turn and alternates `user`/`model`
/// from there (§3's `ChatSession` invariant). A failed `send` leaves history
/// untouched: only a successful round trip appends the user turn and the
/// model's reply.
pub struct ChatSession {
    coordinator: Arc<RequestCoordinator>,
    model: String,
    system_instruction: Option<String>,
    auth_override: Option<AuthOverride>,
    history: Vec<Content>,
}

impl ChatSession {
    pub(crate) fn new(
        coordinator: Arc<RequestCoordinator>,
        model: impl Into<String>,
        system_instruction: Option<String>,
        auth_override: Option<AuthOverride>,
    ) -> Self {
        Self {
            coordinator,
            model: model.into(),
            system_instruction,
            auth_override,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn expected_next_role(&self) -> &'static str {
        match self.history.last().and_then(|c| c.role.as_deref()) {
            Some("user") => "model",
            _ => "user",
        }
    }

    /// Send one user message, appending it (and the model's reply) to
    /// history only if the call succeeds.
    pub async fn send(&mut self, message: impl Into<String>) -> Result<Value, Error> {
        if self.expected_next_role() != "user" {
            return Err(Error::config(
                "chat history is out of alternation: expected a model turn next",
            ));
        }

        let user_turn = Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(message.into()),
                ..Default::default()
            }],
            extra: BTreeMap::new(),
        };

        let mut contents = self.history.clone();
        contents.push(user_turn.clone());

        let mut generation = BTreeMap::new();
        if let Some(instruction) = &self.system_instruction {
            generation.insert(
                "system_instruction".to_string(),
                Value::String(instruction.clone()),
            );
        }
        let opts = CallOptions {
            auth: self.auth_override.clone(),
            model: Some(self.model.clone()),
            generation,
            timeout: None,
            max_retries: None,
        };

        let response = self
            .coordinator
            .generate(ContentInput::Messages(contents), &opts)
            .await?;

        let reply_content = response
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .cloned()
            .and_then(|v| serde_json::from_value::<Content>(v).ok())
            .unwrap_or(Content {
                role: Some("model".to_string()),
                parts: Vec::new(),
                extra: BTreeMap::new(),
            });

        self.history.push(user_turn);
        self.history.push(reply_content);

        Ok(response)
    }
}
