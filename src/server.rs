use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::InitialValues;
use crate::llm::CompletionClient;
use crate::message::Message;
use crate::persona::Persona;
use crate::session::{ChatSession, SessionOptions, TurnOutcome};
use crate::Result;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

struct SessionEntry<C: CompletionClient> {
    session: Arc<Mutex<ChatSession<C>>>,
    last_active: std::sync::Mutex<Instant>,
}

impl<C: CompletionClient> SessionEntry<C> {
    fn new(session: ChatSession<C>) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Hosts one [`ChatSession`] per session id behind a JSON API.
///
/// Sessions untouched for longer than the idle timeout are dropped by
/// [`ChatServer::sweep_idle`]; a session with a turn in flight is never dropped.
pub struct ChatServer<C: CompletionClient + 'static> {
    client: Arc<C>,
    initial: Arc<InitialValues>,
    persona: Arc<Persona>,
    options: SessionOptions,
    idle_timeout: Duration,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry<C>>>>,
}

impl<C: CompletionClient + 'static> Clone for ChatServer<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            initial: Arc::clone(&self.initial),
            persona: Arc::clone(&self.persona),
            options: self.options,
            idle_timeout: self.idle_timeout,
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<C: CompletionClient + 'static> ChatServer<C> {
    pub fn new(
        client: Arc<C>,
        initial: InitialValues,
        persona: Persona,
        options: SessionOptions,
    ) -> Self {
        Self {
            client,
            initial: Arc::new(initial),
            persona: Arc::new(persona),
            options,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn open_session(&self) -> (Uuid, Vec<Message>) {
        let id = Uuid::new_v4();
        let session = ChatSession::new(Arc::clone(&self.client), &self.initial, self.options);
        let history = session.history_for_display();
        self.sessions
            .write()
            .await
            .insert(id, SessionEntry::new(session));
        tracing::info!(session = %id, "session opened");
        (id, history)
    }

    pub async fn close_session(&self, id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(session = %id, "session closed");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session(&self, id: Uuid) -> Option<Arc<Mutex<ChatSession<C>>>> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id)?;
        entry.touch();
        Some(Arc::clone(&entry.session))
    }

    /// Drop every session idle for longer than the idle timeout and return
    /// how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            if entry.idle_for() <= self.idle_timeout {
                return true;
            }
            // A held lock means a completion is still running.
            if entry.session.try_lock().is_err() {
                return true;
            }
            tracing::info!(session = %id, "idle session expired");
            false
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "idle sweep finished");
        }
        removed
    }

    /// Run [`ChatServer::sweep_idle`] on a fixed interval in the background.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let server = self.clone();
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                server.sweep_idle().await;
            }
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/persona", get(persona::<C>))
            .route("/sessions", axum::routing::post(create_session::<C>))
            .route("/sessions/:id", axum::routing::delete(delete_session::<C>))
            .route(
                "/sessions/:id/messages",
                get(list_messages::<C>).post(post_message::<C>),
            )
            .with_state(self.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            %addr,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "chat server listening"
        );
        let sweeper = self.spawn_sweeper();
        let served = axum::serve(listener, app.into_make_service()).await;
        sweeper.abort();
        served.map_err(|err| crate::error::PersonaError::Protocol(format!("server error: {err}")))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SessionView {
    id: Uuid,
    messages: Vec<Message>,
    awaiting_reply: bool,
}

#[derive(Deserialize)]
struct PostMessage {
    content: String,
}

#[derive(Serialize)]
struct ReplyView {
    reply: String,
    messages: Vec<Message>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn persona<C: CompletionClient + 'static>(
    State(state): State<ChatServer<C>>,
) -> impl IntoResponse {
    let persona = state.persona.as_ref();
    Json(json!({
        "title": persona.title,
        "page_title": persona.page_title(),
        "heading": persona.heading,
        "input_placeholder": persona.input_placeholder,
        "avatars": {
            "assistant": persona.assistant_avatar,
            "user": persona.user_avatar,
        },
    }))
}

async fn create_session<C: CompletionClient + 'static>(
    State(state): State<ChatServer<C>>,
) -> impl IntoResponse {
    let (id, messages) = state.open_session().await;
    (
        StatusCode::CREATED,
        Json(SessionView {
            id,
            messages,
            awaiting_reply: false,
        }),
    )
}

async fn delete_session<C: CompletionClient + 'static>(
    State(state): State<ChatServer<C>>,
    Path(id): Path<Uuid>,
) -> Response {
    if state.close_session(id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found")
    }
}

async fn list_messages<C: CompletionClient + 'static>(
    State(state): State<ChatServer<C>>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(session) = state.session(id).await else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    let session = session.lock().await;
    Json(SessionView {
        id,
        messages: session.history_for_display(),
        awaiting_reply: session.awaiting_reply(),
    })
    .into_response()
}

async fn post_message<C: CompletionClient + 'static>(
    State(state): State<ChatServer<C>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PostMessage>,
) -> Response {
    let Some(session) = state.session(id).await else {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    };
    let Ok(mut session) = session.try_lock() else {
        return error_response(StatusCode::CONFLICT, "a reply is still being generated");
    };

    match session.submit(&req.content).await {
        Ok(TurnOutcome::Replied(reply)) => Json(ReplyView {
            reply,
            messages: session.history_for_display(),
        })
        .into_response(),
        Ok(TurnOutcome::Ignored) => error_response(StatusCode::BAD_REQUEST, "message is empty"),
        Err(err) => {
            tracing::warn!(session = %id, error = %err, "turn left unanswered");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StubModel, StubReply};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn server(replies: Vec<StubReply>) -> ChatServer<StubModel> {
        ChatServer::new(
            StubModel::scripted(replies),
            InitialValues::new("Hello", "You are X"),
            Persona::default(),
            SessionOptions::default(),
        )
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn creates_session_with_greeting() {
        let app = server(vec![]).router();
        let resp = app
            .oneshot(Request::post("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(
            body["messages"],
            json!([{"role": "assistant", "content": "Hello"}])
        );
    }

    #[tokio::test]
    async fn posts_turn_and_returns_reply() {
        let server = server(vec![StubReply::Text("Hi there".into())]);
        let (id, _) = server.open_session().await;

        let resp = server
            .router()
            .oneshot(post(
                &format!("/sessions/{id}/messages"),
                json!({"content": "Hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["reply"], "Hi there");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn backend_failure_is_bad_gateway_and_leaves_turn_unanswered() {
        let server = server(vec![StubReply::Fail("invalid api key".into())]);
        let (id, _) = server.open_session().await;

        let resp = server
            .router()
            .oneshot(post(
                &format!("/sessions/{id}/messages"),
                json!({"content": "Hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = server
            .router()
            .oneshot(
                Request::get(format!("/sessions/{id}/messages"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["awaiting_reply"], true);
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "Hi"}));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let server = server(vec![]);
        let (id, _) = server.open_session().await;
        let resp = server
            .router()
            .oneshot(post(
                &format!("/sessions/{id}/messages"),
                json!({"content": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_and_closed_sessions_are_not_found() {
        let server = server(vec![]);
        let (id, _) = server.open_session().await;
        assert!(server.close_session(id).await);
        assert_eq!(server.session_count().await, 0);

        let resp = server
            .router()
            .oneshot(
                Request::get(format!("/sessions/{id}/messages"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let server = server(vec![]).with_idle_timeout(Duration::from_secs(60));
        let (stale, _) = server.open_session().await;
        tokio::time::advance(Duration::from_secs(45)).await;
        let (fresh, _) = server.open_session().await;
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(server.sweep_idle().await, 1);
        assert!(server.session(stale).await.is_none());
        assert!(server.session(fresh).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_a_session_alive() {
        let server = server(vec![]).with_idle_timeout(Duration::from_secs(60));
        let (id, _) = server.open_session().await;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(40)).await;
            assert!(server.session(id).await.is_some());
            assert_eq!(server.sweep_idle().await, 0);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(server.sweep_idle().await, 1);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_in_flight_survives_the_sweep() {
        let server = server(vec![]).with_idle_timeout(Duration::from_secs(60));
        let (id, _) = server.open_session().await;
        let session = server.session(id).await.unwrap();
        let guard = session.lock().await;
        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(server.sweep_idle().await, 0);
        drop(guard);
        assert_eq!(server.sweep_idle().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_expires_sessions() {
        let server = server(vec![]).with_idle_timeout(Duration::from_secs(10));
        server.open_session().await;
        let sweeper = server.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(server.session_count().await, 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn outstanding_turn_blocks_a_second_one() {
        let server = server(vec![]);
        let (id, _) = server.open_session().await;
        let session = server.session(id).await.unwrap();
        let _guard = session.lock().await;

        let resp = server
            .router()
            .oneshot(post(
                &format!("/sessions/{id}/messages"),
                json!({"content": "Hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
