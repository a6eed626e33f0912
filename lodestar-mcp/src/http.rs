//! HTTP transports built on axum.
//!
//! - SSE: `GET /sse` opens an event stream whose first event names the
//!   endpoint (`/messages/?session_id=...`) the client posts messages to.
//!   Responses and notifications arrive on the stream.
//! - Streamable HTTP: `POST /mcp` answers each request with either a JSON
//!   body or, when the client accepts `text/event-stream`, a short stream of
//!   progress notifications followed by the response. The session is carried
//!   in the `Mcp-Session-Id` header.
//!
//! Research work is always spawned, so a client hanging up never aborts a
//! research call; the unit still commits.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use lodestar_core::TransportKind;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::handlers::{Outbound, RequestHandler};
use crate::protocol::{IncomingMessage, JsonRpcResponse, RequestId};
use crate::session::McpSession;
use crate::{serialize_response, McpServer, OUTBOUND_BUFFER};

/// Header carrying the streamable-HTTP session id.
pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// Streamable-HTTP sessions kept at once before the least recently used goes.
pub const DEFAULT_MAX_HTTP_SESSIONS: usize = 1024;

/// Streamable-HTTP sessions unused for this long are dropped.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

struct SseClient {
    session: Arc<McpSession>,
    outbound: Outbound,
}

struct StreamableSession {
    session: Arc<McpSession>,
    last_seen: Instant,
}

struct HttpInner {
    handler: Arc<RequestHandler>,
    transport: TransportKind,
    sse_clients: RwLock<HashMap<String, SseClient>>,
    sessions: RwLock<HashMap<String, StreamableSession>>,
    max_sessions: usize,
    session_idle: Duration,
    started_at: Instant,
}

/// Shared state of the HTTP transports.
#[derive(Clone)]
pub struct HttpState {
    inner: Arc<HttpInner>,
}

impl HttpState {
    pub fn new(server: &McpServer, transport: TransportKind) -> Self {
        Self::with_session_limits(server, transport, DEFAULT_MAX_HTTP_SESSIONS, DEFAULT_SESSION_IDLE)
    }

    /// Bound the streamable-HTTP session table by count and idle time.
    pub fn with_session_limits(
        server: &McpServer,
        transport: TransportKind,
        max_sessions: usize,
        session_idle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                handler: Arc::clone(server.handler()),
                transport,
                sse_clients: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                max_sessions: max_sessions.max(1),
                session_idle,
                started_at: Instant::now(),
            }),
        }
    }

    fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.inner.handler)
    }

    fn register_sse(&self, session: Arc<McpSession>, outbound: Outbound) {
        let mut clients = self
            .inner
            .sse_clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        clients.insert(session.id().to_string(), SseClient { session, outbound });
    }

    fn sse_client(&self, id: &str) -> Option<(Arc<McpSession>, Outbound)> {
        let clients = self
            .inner
            .sse_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        clients
            .get(id)
            .map(|c| (Arc::clone(&c.session), c.outbound.clone()))
    }

    fn remove_sse(&self, id: &str) {
        let mut clients = self
            .inner
            .sse_clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if clients.remove(id).is_some() {
            info!(session = id, "SSE client disconnected");
        }
    }

    fn create_session(&self) -> Arc<McpSession> {
        let session = Arc::new(McpSession::new());
        let now = Instant::now();
        let idle = self.inner.session_idle;
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_seen) < idle);
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, "Dropped idle streamable HTTP sessions");
        }
        while sessions.len() >= self.inner.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            info!(session = %oldest, "Evicted least recently used streamable HTTP session");
        }

        sessions.insert(
            session.id().to_string(),
            StreamableSession {
                session: Arc::clone(&session),
                last_seen: now,
            },
        );
        session
    }

    /// Look up a live session and mark it used. Idle sessions are dropped.
    fn session(&self, id: &str) -> Option<Arc<McpSession>> {
        let now = Instant::now();
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(id)?;
        if now.duration_since(entry.last_seen) >= self.inner.session_idle {
            sessions.remove(id);
            debug!(session = id, "Streamable HTTP session expired");
            return None;
        }
        entry.last_seen = now;
        Some(Arc::clone(&entry.session))
    }

    fn end_session(&self, id: &str) -> bool {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.remove(id).is_some()
    }

    /// End every open SSE stream so graceful shutdown is not held up by them.
    fn close_streams(&self) {
        let mut clients = self
            .inner
            .sse_clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        clients.clear();
    }

    fn connection_count(&self) -> usize {
        let sse = self
            .inner
            .sse_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let streamable = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        sse + streamable
    }
}

/// Deregisters an SSE client when its event stream is dropped.
struct SseGuard {
    state: HttpState,
    id: String,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.state.remove_sse(&self.id);
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

fn message_event(message: String) -> Result<Event, Infallible> {
    Ok(Event::default().event("message").data(message))
}

fn json_rpc_error(status: StatusCode, err: McpError) -> Response {
    let body = JsonRpcResponse::from_mcp_error(RequestId::Null, err);
    (status, Json(body)).into_response()
}

/// Run one request on its own task and return the serialized response, if any.
///
/// The spawned task outlives the caller, so the research still commits when
/// the HTTP client goes away mid-request.
fn spawn_request(
    handler: Arc<RequestHandler>,
    session: Arc<McpSession>,
    message: IncomingMessage,
    outbound: Option<Outbound>,
) -> tokio::task::JoinHandle<Option<String>> {
    tokio::spawn(async move {
        handler
            .handle_message(&session, message, outbound.as_ref())
            .await
            .map(|response| serialize_response(&response))
    })
}

// ---------------------------------------------------------------------------
// SSE transport
// ---------------------------------------------------------------------------

/// Router for the SSE transport: `/sse`, `/messages/` and `/health`.
pub fn sse_router(state: HttpState) -> Router {
    Router::new()
        .route("/sse", get(sse_connect))
        .route("/messages/", post(sse_message))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn sse_connect(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = Arc::new(McpSession::new());
    let id = session.id().to_string();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    state.register_sse(session, tx);
    info!(session = %id, "SSE client connected");

    let endpoint = format!("/messages/?session_id={id}");
    let guard = SseGuard { state, id };
    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = ReceiverStream::new(rx).map(move |message| {
        let _ = &guard;
        message_event(message)
    });

    Sse::new(first.chain(messages)).keep_alive(KeepAlive::default())
}

async fn sse_message(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Response {
    let Some(id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "session_id is required").into_response();
    };
    let Some((session, outbound)) = state.sse_client(&id) else {
        return (StatusCode::NOT_FOUND, "Could not find session").into_response();
    };
    let message = match RequestHandler::parse_message(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!(session = %id, error = %e, "Rejected malformed MCP message");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    debug!(session = %id, method = %message.method, "SSE message received");

    let handler = state.handler();
    if RequestHandler::is_long_running(&message.method) {
        let task = spawn_request(handler, session, message, Some(outbound.clone()));
        tokio::spawn(async move {
            if let Ok(Some(response)) = task.await {
                if outbound.send(response).await.is_err() {
                    debug!("SSE client gone, discarding response");
                }
            }
        });
    } else if let Some(response) = handler.handle_message(&session, message, None).await {
        if outbound.send(serialize_response(&response)).await.is_err() {
            debug!("SSE client gone, discarding response");
        }
    }
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

// ---------------------------------------------------------------------------
// Streamable HTTP transport
// ---------------------------------------------------------------------------

/// Router for the streamable-HTTP transport: `/mcp` and `/health`.
pub fn streamable_router(state: HttpState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).delete(mcp_delete))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

async fn mcp_post(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    let message = match RequestHandler::parse_message(&body) {
        Ok(message) => message,
        Err(e) => return json_rpc_error(StatusCode::BAD_REQUEST, e),
    };

    let session = if message.method == "initialize" {
        let session = state.create_session();
        info!(session = session.id(), "Streamable HTTP session created");
        session
    } else {
        let Some(id) = session_header(&headers) else {
            return json_rpc_error(
                StatusCode::BAD_REQUEST,
                McpError::InvalidRequest {
                    message: "Missing Mcp-Session-Id header".to_string(),
                },
            );
        };
        match state.session(&id) {
            Some(session) => session,
            None => {
                return json_rpc_error(
                    StatusCode::NOT_FOUND,
                    McpError::InvalidRequest {
                        message: format!("Unknown session: {id}"),
                    },
                );
            }
        }
    };
    let session_id = session.id().to_string();
    let handler = state.handler();

    if message.is_notification() {
        handler.handle_message(&session, message, None).await;
        return (StatusCode::ACCEPTED, [(MCP_SESSION_HEADER, session_id)]).into_response();
    }

    if accepts_event_stream(&headers) && RequestHandler::is_long_running(&message.method) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let task = spawn_request(handler, session, message, Some(tx.clone()));
        tokio::spawn(async move {
            if let Ok(Some(response)) = task.await {
                let _ = tx.send(response).await;
            }
        });
        let events = ReceiverStream::new(rx).map(message_event);
        return ([(MCP_SESSION_HEADER, session_id)], Sse::new(events)).into_response();
    }

    match spawn_request(handler, session, message, None).await {
        Ok(Some(response)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), "application/json".to_string()),
                (MCP_SESSION_HEADER, session_id),
            ],
            response,
        )
            .into_response(),
        Ok(None) => (StatusCode::ACCEPTED, [(MCP_SESSION_HEADER, session_id)]).into_response(),
        Err(e) => json_rpc_error(StatusCode::INTERNAL_SERVER_ERROR, McpError::internal(e)),
    }
}

async fn mcp_delete(State(state): State<HttpState>, headers: HeaderMap) -> StatusCode {
    match session_header(&headers) {
        Some(id) if state.end_session(&id) => {
            info!(session = %id, "Streamable HTTP session ended");
            StatusCode::OK
        }
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let service = state.inner.handler.dispatcher().service();
    Json(serde_json::json!({
        "status": "ok",
        "transport": state.inner.transport.to_string(),
        "connections": state.connection_count(),
        "research_sessions": service.registry().len(),
        "cached_topics": service.cache().len(),
        "uptime_secs": state.inner.started_at.elapsed().as_secs(),
    }))
}

/// Serve `server` over an HTTP transport until the process is stopped.
pub async fn serve(
    server: &McpServer,
    transport: TransportKind,
    host: &str,
    port: u16,
) -> Result<(), McpError> {
    let state = HttpState::new(server, transport);
    let app = match transport {
        TransportKind::Sse => sse_router(state.clone()),
        TransportKind::StreamableHttp => streamable_router(state.clone()),
        TransportKind::Stdio => {
            return Err(McpError::TransportError {
                message: "stdio is not an HTTP transport".to_string(),
            });
        }
    };

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, transport = %transport, "MCP HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            state.close_streams();
        })
        .await?;
    info!("MCP HTTP server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
