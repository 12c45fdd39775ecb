//! Long-lived stream sessions: one upstream SSE connection fanned out to N
//! independent subscribers, with retry/backoff and lifecycle management.
//!
//! The session table (`DashMap`) is the only place session state lives; the
//! public API hands callers snapshots (`SessionInfo`) or a `Subscription`
//! handle, never a live reference into the table, per §5 "Shared resources".
//! Subscriber delivery uses a bounded, hand-rolled mailbox rather than
//! `tokio::sync::mpsc` because the documented overflow policy is
//! `drop_oldest` (§4.3), which an `mpsc` channel cannot express on the
//! producer side — only the consumer can pop from the front of an `mpsc`
//! queue, and by the time delivery blocks it is too late to evict.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::StreamExt;
use gemini_schema::GeminiGenerateContentRequest;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::auth::{AuthCoordinator, AuthOverride, AuthStrategy};
use crate::error::Error;
use crate::http::HttpClient;
use crate::sse::{SseEvent, SseParser, SsePayload};

/// Minimum per-subscriber mailbox capacity recommended by §4.3; used as the
/// default for every session.
pub const SUBSCRIBER_MAILBOX_CAPACITY: usize = 64;

/// Default ceiling on concurrently open stream sessions (§4.3).
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Grace period after a session's last subscriber leaves before the session
/// is stopped, absent a new subscriber (§4.3).
const SUBSCRIBER_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How long a terminal session lingers in the table so late subscribers can
/// still observe the terminal event (§3 "StreamSession" lifecycle).
const TERMINAL_CLEANUP_DELAY: Duration = Duration::from_secs(5);

/// Per-chunk idle timeout on an open upstream stream (§5): an upstream that
/// stops sending bytes without closing the connection surfaces as a
/// retryable `Timeout` rather than hanging the ingestion task forever.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Opaque, engine-unique identifier for one stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Completed,
    Errored,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Stopped
        )
    }
}

/// What a subscriber actually receives. `[DONE]` never appears here as
/// `Data` — it is consumed by the engine as a state-transition signal and
/// surfaces only as `Completed` (§9 Open Question 1).
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    Data(Value),
    /// A `data:` frame failed to decode as JSON; it was skipped, not
    /// delivered, and the stream continues.
    Warning { message: String },
    /// The per-subscriber mailbox was full; the oldest queued event was
    /// dropped to make room for this marker.
    Overflow,
    Completed,
    Errored { message: String },
    Stopped,
}

/// A bounded, single-producer/single-consumer-ish mailbox with an explicit
/// `drop_oldest` overflow policy: pushing past capacity evicts the oldest
/// queued event and inserts a synthetic `Overflow` marker in its place, so a
/// slow subscriber sees a gap marker instead of silently losing data with no
/// indication anything was dropped.
struct Mailbox {
    queue: Mutex<VecDeque<SubscriberEvent>>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: SubscriberEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

        if queue.len() >= self.capacity {
            if matches!(queue.front(), Some(SubscriberEvent::Overflow)) {
                queue.pop_front();
            }
            // A capacity-1 mailbox has no room for both the marker and the
            // new event; drop the marker rather than exceed capacity.
            let reserved = if self.capacity >= 2 { 2 } else { 1 };
            while queue.len() + reserved > self.capacity {
                if queue.pop_front().is_none() {
                    break;
                }
            }
            if self.capacity >= 2 {
                queue.push_front(SubscriberEvent::Overflow);
            }
        }

        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Waits for and returns the next event. Subscribers should stop calling
    /// this once they have received a terminal event (`Completed`,
    /// `Errored`, `Stopped`) — none will ever follow it.
    async fn recv(&self) -> SubscriberEvent {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            notified.await;
        }
    }
}

/// A caller's registered interest in one session's events. Dropping this
/// unregisters the subscriber — the equivalent of the subscriber process
/// dying (§3 "SubscriberRef" invariant).
pub struct Subscription {
    subscriber_id: SubscriberId,
    session_id: SessionId,
    mailbox: Arc<Mailbox>,
    session: Weak<SessionHandle>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn recv(&self) -> SubscriberEvent {
        self.mailbox.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_subscriber(self.subscriber_id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub model: String,
    pub auth_strategy: AuthStrategy,
    pub events_count: u64,
    pub started_at: u64,
    pub last_event_at: Option<u64>,
    pub subscriber_count: usize,
    pub error: Option<String>,
}

struct SessionHandle {
    id: SessionId,
    model: String,
    auth_strategy: AuthStrategy,
    state: RwLock<SessionState>,
    subscribers: DashMap<SubscriberId, Arc<Mailbox>>,
    next_subscriber_id: AtomicU64,
    events_count: AtomicU64,
    started_at: u64,
    last_event_at: AtomicU64,
    error: RwLock<Option<String>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    grace_generation: AtomicU64,
    sessions_table: Weak<DashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionHandle {
    fn new(
        id: SessionId,
        model: String,
        auth_strategy: AuthStrategy,
        sessions_table: Weak<DashMap<SessionId, Arc<SessionHandle>>>,
    ) -> Self {
        Self {
            id,
            model,
            auth_strategy,
            state: RwLock::new(SessionState::Starting),
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(0),
            events_count: AtomicU64::new(0),
            started_at: now_epoch_seconds(),
            last_event_at: AtomicU64::new(0),
            error: RwLock::new(None),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            grace_generation: AtomicU64::new(0),
            sessions_table,
        }
    }

    fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn add_subscriber(self: &Arc<Self>, capacity: usize) -> (SubscriberId, Arc<Mailbox>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(capacity));
        self.subscribers.insert(id, mailbox.clone());
        // Invalidate any grace timer scheduled while the subscriber set was empty.
        self.grace_generation.fetch_add(1, Ordering::SeqCst);
        (id, mailbox)
    }

    fn remove_subscriber(self: &Arc<Self>, id: SubscriberId) {
        self.subscribers.remove(&id);
        if self.subscribers.is_empty() && !self.is_terminal() {
            self.schedule_grace_stop();
        }
    }

    fn schedule_grace_stop(self: &Arc<Self>) {
        let generation = self.grace_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SUBSCRIBER_GRACE_PERIOD).await;
            let still_current = handle.grace_generation.load(Ordering::SeqCst) == generation;
            if still_current && handle.subscribers.is_empty() && !handle.is_terminal() {
                tracing::info!(session = %handle.id, "last subscriber gone past grace period, stopping session");
                handle.transition_terminal(SessionState::Stopped, None);
            }
        });
    }

    fn deliver(&self, event: SubscriberEvent) {
        for entry in self.subscribers.iter() {
            entry.value().push(event.clone());
        }
    }

    fn record_data_event(&self) {
        self.events_count.fetch_add(1, Ordering::Relaxed);
        self.last_event_at
            .store(now_epoch_seconds(), Ordering::Relaxed);
    }

    fn terminal_event(&self) -> SubscriberEvent {
        match self.state() {
            SessionState::Completed => SubscriberEvent::Completed,
            SessionState::Stopped => SubscriberEvent::Stopped,
            SessionState::Errored => SubscriberEvent::Errored {
                message: self
                    .error
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| "stream errored".to_string()),
            },
            _ => SubscriberEvent::Stopped,
        }
    }

    /// Move to a terminal state exactly once, deliver the matching terminal
    /// event, cancel any in-flight read, and schedule table cleanup.
    fn transition_terminal(self: &Arc<Self>, state: SessionState, error: Option<String>) {
        if self.is_terminal() {
            return;
        }
        if let Some(message) = &error {
            *self.error.write().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
        }
        self.set_state(state);
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        self.deliver(self.terminal_event());
        self.schedule_cleanup();
    }

    fn schedule_cleanup(self: &Arc<Self>) {
        let id = self.id;
        let table = self.sessions_table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_CLEANUP_DELAY).await;
            if let Some(table) = table.upgrade() {
                table.remove(&id);
            }
        });
    }

    fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state(),
            model: self.model.clone(),
            auth_strategy: self.auth_strategy,
            events_count: self.events_count.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_event_at: match self.last_event_at.load(Ordering::Relaxed) {
                0 => None,
                secs => Some(secs),
            },
            subscriber_count: self.subscribers.len(),
            error: self.error.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Outcome of reading one HTTP response body to completion or failure.
enum DrainOutcome {
    Completed,
    Cancelled,
    TransportError(Error),
}

/// What to do after a failed stream-open or a failed in-flight read.
enum RetryDecision {
    Retry(Duration),
    RefreshAndRetry,
    GiveUp,
}

fn decide_retry(error: &Error, attempt: u32, max_retries: u32, refreshed_after_401: bool) -> RetryDecision {
    match error {
        Error::Auth { .. } if !refreshed_after_401 => RetryDecision::RefreshAndRetry,
        Error::Auth { .. } => RetryDecision::GiveUp,
        Error::RateLimit { retry_after, .. } => {
            if attempt >= max_retries {
                RetryDecision::GiveUp
            } else {
                let backoff = backoff_delay(attempt);
                RetryDecision::Retry(retry_after.map_or(backoff, |d| d.max(backoff)))
            }
        }
        Error::Server { .. } | Error::Network(_) | Error::Timeout(_) => {
            if attempt >= max_retries {
                RetryDecision::GiveUp
            } else {
                RetryDecision::Retry(backoff_delay(attempt))
            }
        }
        _ => RetryDecision::GiveUp,
    }
}

/// `min(1s * 2^attempt, 10s) + uniform jitter [0, 1s)` per §4.3.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(1u64 << attempt.min(10));
    let capped_ms = base_ms.min(10_000);
    let jitter_ms = rand::random::<u64>() % 1_000;
    Duration::from_millis(capped_ms + jitter_ms)
}

/// Maintains stream sessions: opens the upstream connection, feeds bytes to
/// the SSE parser, fans decoded events out to subscribers, and applies
/// retry/backoff and lifecycle rules (§4.3).
pub struct StreamingEngine {
    http: HttpClient,
    auth: Arc<AuthCoordinator>,
    sessions: Arc<DashMap<SessionId, Arc<SessionHandle>>>,
    max_sessions: usize,
}

impl StreamingEngine {
    pub fn new(http: HttpClient, auth: Arc<AuthCoordinator>, max_sessions: usize) -> Self {
        Self {
            http,
            auth,
            sessions: Arc::new(DashMap::new()),
            max_sessions,
        }
    }

    /// Start a new stream session and return its id plus the caller's own
    /// subscription to it. Enforces `max_sessions` (§4.3).
    pub async fn start_stream(
        &self,
        request_body: GeminiGenerateContentRequest,
        model: impl Into<String>,
        auth_override: Option<AuthOverride>,
        max_retries: u32,
    ) -> Result<(SessionId, Subscription), Error> {
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::resource(format!(
                "maximum of {} concurrent stream sessions reached",
                self.max_sessions
            )));
        }

        let model = model.into();
        let strategy = auth_override
            .as_ref()
            .and_then(|o| o.strategy)
            .unwrap_or_else(|| self.auth.default_strategy());

        let id = SessionId::new();
        let handle = Arc::new(SessionHandle::new(
            id,
            model.clone(),
            strategy,
            Arc::downgrade(&self.sessions),
        ));
        self.sessions.insert(id, handle.clone());

        let (subscriber_id, mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);
        let subscription = Subscription {
            subscriber_id,
            session_id: id,
            mailbox,
            session: Arc::downgrade(&handle),
        };

        let http = self.http.clone();
        let auth = self.auth.clone();
        tokio::spawn(run_ingestion(
            handle,
            http,
            auth,
            request_body,
            model,
            auth_override,
            max_retries,
        ));

        Ok((id, subscription))
    }

    /// Subscribe to an existing session. If the session is already in a
    /// terminal state, the new subscriber's mailbox is seeded with the
    /// terminal event immediately (§8 invariant 7 "Terminal replay").
    pub fn subscribe(&self, session_id: SessionId) -> Result<Subscription, Error> {
        let handle = self.get_handle(session_id)?;
        let (subscriber_id, mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);
        if handle.is_terminal() {
            mailbox.push(handle.terminal_event());
        }
        Ok(Subscription {
            subscriber_id,
            session_id,
            mailbox,
            session: Arc::downgrade(&handle),
        })
    }

    /// Explicitly remove a subscriber. Equivalent to dropping its
    /// [`Subscription`]; provided for callers that track subscriber ids
    /// independently of the handle's lifetime.
    pub fn unsubscribe(&self, session_id: SessionId, subscriber_id: u64) -> Result<(), Error> {
        let handle = self.get_handle(session_id)?;
        handle.remove_subscriber(subscriber_id);
        Ok(())
    }

    /// Cancel the ingestion worker and transition to `Stopped`.
    pub fn stop(&self, session_id: SessionId) -> Result<(), Error> {
        let handle = self.get_handle(session_id)?;
        handle.transition_terminal(SessionState::Stopped, None);
        Ok(())
    }

    pub fn info(&self, session_id: SessionId) -> Result<SessionInfo, Error> {
        Ok(self.get_handle(session_id)?.snapshot())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    fn get_handle(&self, session_id: SessionId) -> Result<Arc<SessionHandle>, Error> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::resource(format!("unknown stream session {session_id}")))
    }
}

async fn run_ingestion(
    handle: Arc<SessionHandle>,
    http: HttpClient,
    auth: Arc<AuthCoordinator>,
    request_body: GeminiGenerateContentRequest,
    model: String,
    auth_override: Option<AuthOverride>,
    max_retries: u32,
) {
    let mut attempt: u32 = 0;
    let mut refreshed_after_401 = false;

    loop {
        if handle.is_terminal() {
            return;
        }

        let request_auth = match auth
            .coordinate(auth_override.as_ref(), &model, "streamGenerateContent")
            .await
        {
            Ok(auth) => auth,
            Err(e) => {
                handle.transition_terminal(SessionState::Errored, Some(e.to_string()));
                return;
            }
        };

        let url = format!(
            "{}/{}?alt=sse",
            request_auth.base_url.trim_end_matches('/'),
            request_auth.path
        );

        let open_result = http
            .open_stream(&url, &request_auth.headers, &request_body)
            .await;

        let outcome = match open_result {
            Ok(response) => {
                handle.set_state(SessionState::Active);
                drain_response(&handle, response).await
            }
            Err(e) => DrainOutcome::TransportError(e),
        };

        match outcome {
            DrainOutcome::Completed => {
                handle.transition_terminal(SessionState::Completed, None);
                return;
            }
            DrainOutcome::Cancelled => {
                return;
            }
            DrainOutcome::TransportError(e) => {
                match decide_retry(&e, attempt, max_retries, refreshed_after_401) {
                    RetryDecision::Retry(delay) => {
                        tracing::warn!(session = %handle.id, error = %e, delay_ms = delay.as_millis(), "retrying stream after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::RefreshAndRetry => {
                        refreshed_after_401 = true;
                        if let Err(refresh_err) = auth.refresh(request_auth.strategy).await {
                            handle.transition_terminal(SessionState::Errored, Some(refresh_err.to_string()));
                            return;
                        }
                        tracing::info!(session = %handle.id, "refreshed credentials after 401, retrying");
                    }
                    RetryDecision::GiveUp => {
                        handle.transition_terminal(SessionState::Errored, Some(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

async fn drain_response(handle: &Arc<SessionHandle>, response: reqwest::Response) -> DrainOutcome {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    loop {
        let notified = handle.cancel_notify.notified();
        tokio::pin!(notified);
        if handle.is_terminal() {
            return DrainOutcome::Cancelled;
        }

        tokio::select! {
            _ = &mut notified => {
                return DrainOutcome::Cancelled;
            }
            () = tokio::time::sleep(STREAM_IDLE_TIMEOUT) => {
                return DrainOutcome::TransportError(Error::Timeout(STREAM_IDLE_TIMEOUT));
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let events = parser.feed(&bytes);
                        if let Some(outcome) = dispatch_events(handle, events) {
                            return outcome;
                        }
                    }
                    Some(Err(e)) => {
                        return DrainOutcome::TransportError(Error::from(e));
                    }
                    None => {
                        let events = parser.finalize();
                        dispatch_events(handle, events);
                        return DrainOutcome::Completed;
                    }
                }
            }
        }
    }
}

/// Applies decoded events to the session. Returns `Some` only when a
/// terminal condition (`[DONE]`) was observed — the caller should stop
/// reading immediately rather than wait for end-of-body.
fn dispatch_events(handle: &Arc<SessionHandle>, events: Vec<SseEvent>) -> Option<DrainOutcome> {
    for event in events {
        match event.payload {
            SsePayload::Done => return Some(DrainOutcome::Completed),
            SsePayload::Data(value) => {
                handle.record_data_event();
                handle.deliver(SubscriberEvent::Data(value));
            }
            SsePayload::Invalid(raw) => {
                tracing::warn!(session = %handle.id, raw = %raw, "skipping undecodable SSE data frame");
                handle.deliver(SubscriberEvent::Warning {
                    message: "invalid JSON in SSE data frame".to_string(),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, Credentials};
    use gemini_schema::{Content, Part};

    fn request_body() -> GeminiGenerateContentRequest {
        GeminiGenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some("hello".to_string()),
                    ..Default::default()
                }],
                extra: Default::default(),
            }],
            system_instruction: None,
            generation_config: None,
            tools: None,
            tool_config: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn done_sentinel_completes_with_zero_data_events() {
        let handle = Arc::new(SessionHandle::new(
            SessionId::new(),
            "gemini-2.0-flash-lite".to_string(),
            AuthStrategy::Gemini,
            Weak::new(),
        ));
        let (_subscriber_id, mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);

        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n");
        let outcome = dispatch_events(&handle, events);

        assert!(matches!(outcome, Some(DrainOutcome::Completed)));
        assert_eq!(handle.events_count.load(Ordering::Relaxed), 0);
        assert!(mailbox.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscriber_drop_triggers_grace_stop() {
        let config = AuthConfig {
            strategy: AuthStrategy::Gemini,
            credentials: Credentials::Gemini {
                api_key: "AIza-TEST".to_string(),
            },
        };
        let auth = Arc::new(
            AuthCoordinator::new(config, reqwest::Client::new())
                .await
                .unwrap(),
        );
        let handle = Arc::new(SessionHandle::new(
            SessionId::new(),
            "gemini-2.0-flash-lite".to_string(),
            AuthStrategy::Gemini,
            Weak::new(),
        ));
        handle.set_state(SessionState::Active);
        let (sub_id, _mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);
        handle.remove_subscriber(sub_id);

        tokio::time::sleep(SUBSCRIBER_GRACE_PERIOD + Duration::from_millis(200)).await;
        assert_eq!(handle.state(), SessionState::Stopped);
        let _ = (request_body(), auth);
    }

    #[tokio::test]
    async fn resubscribing_before_grace_expiry_cancels_stop() {
        let handle = Arc::new(SessionHandle::new(
            SessionId::new(),
            "gemini-2.0-flash-lite".to_string(),
            AuthStrategy::Gemini,
            Weak::new(),
        ));
        handle.set_state(SessionState::Active);
        let (sub_id, _mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);
        handle.remove_subscriber(sub_id);
        let (_sub_id2, _mailbox2) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);

        tokio::time::sleep(SUBSCRIBER_GRACE_PERIOD + Duration::from_millis(200)).await;
        assert_eq!(handle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn terminal_subscribe_replays_terminal_event_immediately() {
        let handle = Arc::new(SessionHandle::new(
            SessionId::new(),
            "gemini-2.0-flash-lite".to_string(),
            AuthStrategy::Gemini,
            Weak::new(),
        ));
        handle.transition_terminal(SessionState::Completed, None);
        let (_id, mailbox) = handle.add_subscriber(SUBSCRIBER_MAILBOX_CAPACITY);
        mailbox.push(handle.terminal_event());
        let event = mailbox.recv().await;
        assert_eq!(event, SubscriberEvent::Completed);
    }

    #[tokio::test]
    async fn mailbox_overflow_drops_oldest_and_marks_gap() {
        let mailbox = Mailbox::new(2);
        mailbox.push(SubscriberEvent::Data(Value::from(1)));
        mailbox.push(SubscriberEvent::Data(Value::from(2)));
        mailbox.push(SubscriberEvent::Data(Value::from(3)));

        let first = mailbox.recv().await;
        assert_eq!(first, SubscriberEvent::Overflow);
        let second = mailbox.recv().await;
        assert_eq!(second, SubscriberEvent::Data(Value::from(3)));
    }

    #[tokio::test]
    async fn unknown_session_operations_return_resource_error() {
        let auth = Arc::new(
            AuthCoordinator::new(
                AuthConfig {
                    strategy: AuthStrategy::Gemini,
                    credentials: Credentials::Gemini {
                        api_key: "AIza-TEST".to_string(),
                    },
                },
                reqwest::Client::new(),
            )
            .await
            .unwrap(),
        );
        let engine = StreamingEngine::new(HttpClient::from_client(reqwest::Client::new()), auth, 10);
        let bogus = SessionId::new();
        assert!(matches!(engine.info(bogus), Err(Error::Resource { .. })));
        assert!(matches!(engine.stop(bogus), Err(Error::Resource { .. })));
    }

    #[tokio::test]
    async fn max_sessions_is_enforced() {
        let auth = Arc::new(
            AuthCoordinator::new(
                AuthConfig {
                    strategy: AuthStrategy::Gemini,
                    credentials: Credentials::Gemini {
                        api_key: "AIza-TEST".to_string(),
                    },
                },
                reqwest::Client::new(),
            )
            .await
            .unwrap(),
        );
        let engine = StreamingEngine::new(HttpClient::from_client(reqwest::Client::new()), auth, 0);
        let err = engine
            .start_stream(request_body(), "gemini-2.0-flash-lite", None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[tokio::test]
    async fn backoff_delay_is_capped_at_ten_seconds() {
        let delay = backoff_delay(20);
        assert!(delay <= Duration::from_millis(11_000));
        assert!(delay >= Duration::from_secs(10));
    }
}
