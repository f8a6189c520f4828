//! Session routes and the per-session event socket.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AppState, client_ip, error_response};
use crate::error::FunnelError;
use crate::funnel::{ActionOutcome, FunnelEvent, FunnelSession, SessionCloser, SessionSnapshot};
use crate::lead::Attribution;

/// Everything needed to reach a live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<Mutex<FunnelSession>>,
    /// Subscribe here without waiting on the session lock.
    pub events: broadcast::Sender<FunnelEvent>,
    /// Abandons the session even while an operation holds the lock.
    pub closer: SessionCloser,
    /// Latest snapshot, readable while an operation holds the lock.
    pub snapshot: watch::Receiver<SessionSnapshot>,
    last_active: Arc<std::sync::Mutex<Instant>>,
}

impl SessionHandle {
    /// Record client activity.
    pub fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Live sessions by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, dropping any finished ones that are idle.
    pub async fn insert(&self, session: FunnelSession) -> SessionHandle {
        let id = session.id();
        let handle = SessionHandle {
            events: session.event_sender(),
            closer: session.closer(),
            snapshot: session.watch_snapshot(),
            last_active: Arc::new(std::sync::Mutex::new(Instant::now())),
            session: Arc::new(Mutex::new(session)),
        };

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, h| !h.snapshot.borrow().phase.is_terminal());
        sessions.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Abandon and drop sessions with no client activity for `ttl`.
    /// Returns how many were dropped.
    pub async fn expire_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, h| {
            if h.idle_for() < ttl {
                return true;
            }
            h.closer.close();
            if let Ok(mut session) = h.session.try_lock() {
                session.abandon();
            }
            debug!(session_id = %id, "Session expired");
            false
        });
        let expired = before - sessions.len();
        if expired > 0 {
            info!(count = expired, "Expired idle sessions");
        }
        expired
    }
}

/// Spawn a background task that periodically expires idle sessions.
pub fn spawn_session_expiry(
    registry: Arc<SessionRegistry>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = ttl.clamp(Duration::from_millis(10), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    registry.expire_idle(ttl).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn lookup(state: &AppState, id: &str) -> Result<(Uuid, SessionHandle), Response> {
    let Ok(session_id) = Uuid::parse_str(id) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "Invalid session ID"));
    };
    match state.sessions.get(session_id).await {
        Some(handle) => {
            handle.touch();
            Ok((session_id, handle))
        }
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            FunnelError::SessionNotFound(session_id).to_string(),
        )),
    }
}

fn action_response(session: &FunnelSession, result: Result<ActionOutcome, FunnelError>) -> Response {
    match result {
        Ok(outcome) => Json(serde_json::json!({
            "result": outcome,
            "session": session.snapshot(),
        }))
        .into_response(),
        Err(e) => {
            error!(session_id = %session.id(), error = %e, "Funnel configuration fault");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── REST ────────────────────────────────────────────────────────────────

/// Create a session from optional attribution and reveal its entry step.
pub(super) async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut attribution: Attribution = if body.is_empty() {
        Attribution::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "Rejected session attribution body");
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid attribution: {e}"));
            }
        }
    };
    if attribution.ip_address.is_none() {
        attribution.ip_address = client_ip(&headers);
    }

    let session = FunnelSession::new(
        Arc::clone(&state.graph),
        state.deps.clone(),
        state.timing,
        attribution,
    );
    let id = session.id();
    let handle = state.sessions.insert(session).await;
    info!(session_id = %id, "Session created");

    let mut session = handle.session.lock().await;
    if let Err(e) = session.start().await {
        error!(session_id = %id, error = %e, "Funnel configuration fault on start");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    (StatusCode::CREATED, Json(session.snapshot())).into_response()
}

pub(super) async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (_, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let snapshot = handle.snapshot.borrow().clone();
    Json(snapshot).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AnswerRequest {
    step_id: String,
    value: String,
}

pub(super) async fn submit_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerRequest>,
) -> Response {
    let (_, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut session = handle.session.lock().await;
    let result = session.submit_answer(&body.step_id, &body.value).await;
    action_response(&session, result)
}

pub(super) async fn resend_code(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (_, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut session = handle.session.lock().await;
    let result = session.resend_code().await;
    action_response(&session, result)
}

pub(super) async fn change_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let (_, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut session = handle.session.lock().await;
    let result = session.change_channel().await;
    action_response(&session, result)
}

/// Abandon a session. In-flight delays and calls end early and their
/// results are dropped.
pub(super) async fn abandon_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let (session_id, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    handle.closer.close();
    handle.session.lock().await.abandon();
    state.sessions.remove(session_id).await;
    info!(session_id = %session_id, "Session abandoned");
    Json(serde_json::json!({"status": "abandoned"})).into_response()
}

// ── WebSocket ───────────────────────────────────────────────────────────

/// Actions a socket client can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientAction {
    Answer {
        #[serde(alias = "stepId")]
        step_id: String,
        value: String,
    },
    Resend,
    ChangeChannel,
    Abandon,
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let (session_id, handle) = match lookup(&state, &id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    info!(session_id = %session_id, "Session socket connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, handle, state))
}

async fn send_snapshot(socket: &mut WebSocket, handle: &SessionHandle) -> bool {
    let snapshot = handle.session.lock().await.snapshot();
    let msg = serde_json::json!({"type": "snapshot", "session": snapshot});
    socket.send(Message::Text(msg.to_string().into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, session_id: Uuid, handle: SessionHandle, state: AppState) {
    // Subscribe before the snapshot so nothing falls between them.
    let mut rx = handle.events.subscribe();
    if !send_snapshot(&mut socket, &handle).await {
        warn!(session_id = %session_id, "Failed to send initial snapshot, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event)
                            && socket.send(Message::Text(json.into())).await.is_err()
                        {
                            debug!(session_id = %session_id, "Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session_id = %session_id, missed = n, "Socket lagged behind session events");
                        if !send_snapshot(&mut socket, &handle).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(session_id = %session_id, "Session event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle.touch();
                        handle_client_message(&text, session_id, &handle, &state).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "Session socket disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(session_id = %session_id, "Session socket closed");
}

/// Run a client action off the socket loop so events keep flowing while the
/// session reveals its next step.
async fn handle_client_message(text: &str, session_id: Uuid, handle: &SessionHandle, state: &AppState) {
    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, text = text, "Unrecognized socket message");
            return;
        }
    };

    if matches!(action, ClientAction::Abandon) {
        handle.closer.close();
        handle.session.lock().await.abandon();
        state.sessions.remove(session_id).await;
        info!(session_id = %session_id, "Session abandoned via socket");
        return;
    }

    let session = Arc::clone(&handle.session);
    tokio::spawn(async move {
        let mut session = session.lock().await;
        let result = match action {
            ClientAction::Answer { step_id, value } => session.submit_answer(&step_id, &value).await,
            ClientAction::Resend => session.resend_code().await,
            ClientAction::ChangeChannel => session.change_channel().await,
            ClientAction::Abandon => Ok(ActionOutcome::Ignored),
        };
        match result {
            Ok(outcome) => debug!(session_id = %session_id, ?outcome, "Socket action handled"),
            Err(e) => error!(session_id = %session_id, error = %e, "Funnel configuration fault"),
        }
    });
}
