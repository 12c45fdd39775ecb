//! Gemini/VertexAI client core: authentication, unary and streaming
//! request handling, and chat session state, behind one [`Client`].

pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod sse;
pub mod streaming;

pub use chat::ChatSession;
pub use client::Client;
pub use config::{AppConfig, CallOptions};
pub use coordinator::{ContentInput, ModelInfo};
pub use error::Error;
pub use streaming::{SessionId, SessionInfo, SessionState, SubscriberEvent, Subscription};
