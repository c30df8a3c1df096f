//! Server core: shared state, WebSocket handler, and REST endpoints.
//!
//! One WebSocket connection per authenticated user at
//! `/ws/chat/{token}` (the token rides in the path because the upgrade
//! cannot carry custom headers from a browser client). Accepted messages
//! are persisted, delivered live to the receiver when connected, and
//! echoed back to the sender with the client's correlation id attached.
//! Rejected messages produce an `error` frame to the sender only.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use sohbet_proto::codec;
use sohbet_proto::frame::{ClientFrame, ServerFrame};
use sohbet_proto::message::{MessageRecord, UserId, validate_content};

use crate::store::ChatStore;

/// Shared server state: persistence, live connections, and moderation.
pub struct ServerState {
    /// Message log and user directory.
    pub store: ChatStore,
    /// Maps user id to the channel feeding that user's WebSocket writer.
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Substrings that cause a message to be rejected.
    banned_terms: Vec<String>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates state with no moderation rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_banned_terms(Vec::new())
    }

    /// Creates state rejecting messages containing any of `banned_terms`.
    #[must_use]
    pub fn with_banned_terms(banned_terms: Vec<String>) -> Self {
        Self {
            store: ChatStore::new(),
            connections: RwLock::new(HashMap::new()),
            banned_terms,
        }
    }

    /// Registers a user's connection, replacing any existing one. The old
    /// writer task sees its channel close and shuts down.
    async fn register(&self, user: &UserId, sender: mpsc::UnboundedSender<Message>) {
        let mut conns = self.connections.write().await;
        if conns.insert(user.as_str().to_string(), sender).is_some() {
            tracing::info!(user = %user, "replaced existing connection");
        }
    }

    /// Removes a user's connection from the registry.
    async fn unregister(&self, user: &UserId) {
        let mut conns = self.connections.write().await;
        conns.remove(user.as_str());
    }

    /// Deliver a frame to a user's live connection, if any. Offline users
    /// simply miss the live copy; they will see the message in history.
    async fn deliver(&self, user: &UserId, frame: &ServerFrame) {
        let sender = {
            let conns = self.connections.read().await;
            conns.get(user.as_str()).cloned()
        };
        if let Some(sender) = sender
            && let Ok(text) = codec::encode_server(frame)
        {
            let _ = sender.send(Message::Text(text.into()));
        }
    }

    /// Send a WebSocket Close frame to every connected user.
    ///
    /// Each writer task forwards the close frame, which the client side
    /// observes as an unexpected closure. Used by tests to simulate a
    /// server-initiated drop.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, sender) in conns.iter() {
            tracing::info!(user = %user, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }

    /// The first banned term found in `content`, if any.
    fn violation(&self, content: &str) -> Option<&str> {
        self.banned_terms
            .iter()
            .find(|term| content.contains(term.as_str()))
            .map(String::as_str)
    }
}

/// Handles one user's upgraded WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, user: UserId) {
    tracing::info!(user = %user, "chat channel opened");
    state.store.add_user(&user).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(&user, tx).await;

    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(&reader_user, &text, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {
                    // Binary, ping and pong frames are ignored.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(&user).await;
    tracing::info!(user = %user, "chat channel closed");
}

/// Process one inbound text frame from `sender`.
async fn handle_text_frame(sender: &UserId, text: &str, state: &Arc<ServerState>) {
    let frame = match codec::decode_client(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user = %sender, err = %e, "undecodable frame");
            state
                .deliver(
                    sender,
                    &ServerFrame::Error {
                        message: format!("unreadable frame: {e}"),
                    },
                )
                .await;
            return;
        }
    };

    let ClientFrame::Message {
        receiver_id,
        content,
        local_id,
    } = frame;

    if let Err(e) = validate_content(&content) {
        state
            .deliver(
                sender,
                &ServerFrame::Error {
                    message: e.to_string(),
                },
            )
            .await;
        return;
    }

    if let Some(term) = state.violation(&content) {
        tracing::info!(user = %sender, term, "message blocked by moderation");
        state
            .deliver(
                sender,
                &ServerFrame::Error {
                    message: format!("message blocked: contains \"{term}\""),
                },
            )
            .await;
        return;
    }

    let record = state.store.record(sender, &receiver_id, &content).await;
    tracing::debug!(user = %sender, receiver = %receiver_id, id = %record.id, "message accepted");

    // Receiver gets the plain record; the sender's echo carries the
    // correlation id so the client can reconcile its optimistic copy.
    state
        .deliver(&receiver_id, &ServerFrame::Message(record.clone()))
        .await;
    let echo = MessageRecord {
        local_id: Some(local_id),
        ..record
    };
    state.deliver(sender, &ServerFrame::Message(echo)).await;
}

/// Upgrades `/ws/chat/{token}` to a WebSocket. A blank token is rejected
/// before the upgrade completes.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> axum::response::Response {
    let token = token.trim().to_string();
    if token.is_empty() {
        tracing::warn!("rejecting connection with blank token");
        return StatusCode::FORBIDDEN.into_response();
    }
    let user = UserId::new(token);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

/// `GET /chat/history/{peer}` — the transcript between the authenticated
/// user and `peer`, oldest first.
async fn history_handler(
    Path(peer): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> axum::response::Response {
    let Some(requester) = bearer_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let transcript = state.store.history(&requester, &UserId::new(peer)).await;
    axum::Json(transcript).into_response()
}

/// Query parameters for the directory listing.
#[derive(serde::Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

/// `GET /users/?limit=N` — directory entries for peer selection.
async fn users_handler(
    Query(query): Query<ListQuery>,
    State(state): State<Arc<ServerState>>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(20);
    let users = state.store.list_users(limit).await;
    axum::Json(users).into_response()
}

/// Extract the user identified by a `Bearer` token, if present.
fn bearer_user(headers: &HeaderMap) -> Option<UserId> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(UserId::new(token))
    }
}

/// Starts the server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with pre-configured [`ServerState`].
///
/// This is the entry point shared by `main.rs` and test code; tests bind
/// to `127.0.0.1:0` and keep the state handle to drive the store and
/// connection registry directly.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws/chat/{token}", axum::routing::get(ws_handler))
        .route("/chat/history/{peer}", axum::routing::get(history_handler))
        .route("/users/", axum::routing::get(users_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
