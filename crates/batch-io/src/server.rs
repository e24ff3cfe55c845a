//! HTTP command surface and the `/ws` realtime channel.

use crate::auth::{AuthError, TokenClaims, TokenValidator};
use crate::fanout::{ClientId, FanoutHub};
use crate::gateway::{CommandError, CommandGateway};
use crate::metrics;
use crate::protocol::{CommandReply, HoldAction, InboundCommand, InboundMessage, OutboundMessage};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use batch_core::{tags, TagRole};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct AppState {
    gateway: Arc<CommandGateway>,
    hub: FanoutHub,
    auth: Option<TokenValidator>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "auth" => StatusCode::UNAUTHORIZED,
        "not_connected" | "connect" => StatusCode::SERVICE_UNAVAILABLE,
        "read" | "write" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl ApiError {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            kind,
            message: message.into(),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        ApiError::new(err.kind(), err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::new("auth", err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::new("malformed", err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "ok": true })))
}

impl AppState {
    /// `Ok(None)` when auth is disabled.
    fn authorize(&self, token: Option<&str>) -> Result<Option<TokenClaims>, AuthError> {
        let Some(validator) = &self.auth else {
            return Ok(None);
        };
        match validator.check(token) {
            Ok(claims) => Ok(Some(claims)),
            Err(AuthError::Missing) => {
                metrics::AUTH_MISSING.inc();
                Err(AuthError::Missing)
            }
            Err(e) => {
                metrics::AUTH_FAILURES.inc();
                Err(e)
            }
        }
    }

    fn authorize_http(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if let Some(claims) = self.authorize(token)? {
            debug!(operator = %claims.operator, "HTTP command authorized");
        }
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .route("/api/start", post(post_start))
        .route("/api/reset", post(post_reset))
        .route("/api/manual", post(post_manual))
        .route("/write", post(post_write))
        .route("/api/status", get(get_status))
        .route("/api/snapshot", get(get_snapshot))
        .with_state(state)
}

/// Builder for the bridge's HTTP and WebSocket server.
pub struct ServerBuilder {
    listen: SocketAddr,
    gateway: Arc<CommandGateway>,
    hub: FanoutHub,
    auth: Option<TokenValidator>,
}

impl ServerBuilder {
    pub fn new(listen: SocketAddr, gateway: Arc<CommandGateway>, hub: FanoutHub) -> Self {
        Self {
            listen,
            gateway,
            hub,
            auth: None,
        }
    }

    /// Require a valid token on every command.
    pub fn with_auth(mut self, validator: TokenValidator) -> Self {
        self.auth = Some(validator);
        self
    }

    /// Bind and serve in a background task.
    pub async fn spawn(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, auth = self.auth.is_some(), "bridge server listening");

        let app = router(Arc::new(AppState {
            gateway: self.gateway,
            hub: self.hub,
            auth: self.auth,
        }));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "bridge server exited with error");
            }
        });

        Ok(ServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

pub struct ServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Trigger graceful shutdown and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(true);
        self.task.await
    }
}

async fn post_start(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    state.authorize_http(&headers)?;
    state.gateway.pulse(ClientId::HTTP, tags::INICIO.name).await?;
    ok()
}

async fn post_reset(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    state.authorize_http(&headers)?;
    state.gateway.pulse(ClientId::HTTP, tags::RESET.name).await?;
    ok()
}

#[derive(Debug, Deserialize)]
struct ManualBody {
    action: String,
}

async fn post_manual(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ManualBody>, JsonRejection>,
) -> ApiResult {
    state.authorize_http(&headers)?;
    let Json(body) = body?;
    match body.action.as_str() {
        "on" => state.gateway.press(ClientId::HTTP, tags::TARA.name).await?,
        "off" => state.gateway.release(ClientId::HTTP, tags::TARA.name).await?,
        other => {
            return Err(ApiError::new(
                "validation",
                format!("action must be 'on' or 'off', got '{other}'"),
            ))
        }
    }
    ok()
}

#[derive(Debug, Deserialize)]
struct WriteBody {
    tag: String,
    value: serde_json::Value,
}

async fn post_write(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<WriteBody>, JsonRejection>,
) -> ApiResult {
    state.authorize_http(&headers)?;
    let Json(body) = body?;
    let tag = body.tag.trim().to_ascii_uppercase();
    state
        .gateway
        .write_tag(ClientId::HTTP, &tag, &body.value)
        .await?;
    ok()
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let session = state.gateway.session();
    Json(json!({
        "status": "ok",
        "session": session.state().as_str(),
        "endpoint": session.endpoint(),
        "subscribers": state.hub.subscriber_count(),
    }))
}

async fn get_snapshot(State(state): State<Arc<AppState>>) -> ApiResult {
    match state.hub.latest() {
        Some(snapshot) => Ok(Json(json!({ "ok": true, "data": snapshot }))),
        None => Err(ApiError::new("not_connected", "no snapshot published yet")),
    }
}

async fn upgrade_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| client_loop(socket, state))
}

async fn send(socket: &mut WebSocket, message: &OutboundMessage) -> bool {
    match message.to_json() {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "failed to serialise outbound message");
            true
        }
    }
}

async fn client_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.hub.subscribe();
    let client = subscription.id();
    info!(client = %client, "subscriber connected");
    if let Some(observer) = state.gateway.observer() {
        observer.on_subscriber(client, true);
    }

    let mut open = match state.hub.latest() {
        Some(snapshot) => send(&mut socket, &OutboundMessage::PlcUpdate(snapshot)).await,
        None => true,
    };

    while open {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Ok(message) => open = send(&mut socket, &message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        metrics::FRAMES_LAGGED.inc_by(skipped);
                        warn!(client = %client, skipped, "subscriber lagged behind; dropping frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => open = false,
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        let reply = handle_text(&state, client, &text).await;
                        open = send(&mut socket, &OutboundMessage::CommandResult(reply)).await;
                    }
                    Message::Binary(_) => {
                        let reply = CommandReply::error("malformed", "binary frames are not supported");
                        open = send(&mut socket, &OutboundMessage::CommandResult(reply)).await;
                    }
                    Message::Ping(payload) => {
                        open = socket.send(Message::Pong(payload)).await.is_ok();
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    drop(subscription);
    let released = state.gateway.abandon(client).await;
    info!(client = %client, released, "subscriber disconnected");
    if let Some(observer) = state.gateway.observer() {
        observer.on_subscriber(client, false);
    }
}

async fn handle_text(state: &AppState, client: ClientId, text: &str) -> CommandReply {
    let message = match InboundMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            metrics::MALFORMED_MESSAGES.inc();
            warn!(client = %client, error = %err, "dropping malformed message");
            return CommandReply::error("malformed", err.to_string());
        }
    };

    if message.command.touches_plc() {
        match state.authorize(message.auth_token.as_deref()) {
            Ok(Some(claims)) => {
                debug!(client = %client, operator = %claims.operator, command = message.command.name(), "command authorized")
            }
            Ok(None) => {}
            Err(err) => return CommandReply::error("auth", err.to_string()),
        }
    }

    let gateway = &state.gateway;
    let result = match &message.command {
        InboundCommand::SetArido { tag, value } => {
            gateway.set_role_json(client, tag, TagRole::SetPoint, value).await
        }
        InboundCommand::SetCompuerta { tag, value } => {
            gateway.set_role_json(client, tag, TagRole::Actuator, value).await
        }
        InboundCommand::Iniciar => gateway.pulse(client, tags::INICIO.name).await,
        InboundCommand::Reset => gateway.pulse(client, tags::RESET.name).await,
        InboundCommand::Tara(HoldAction::Press) => gateway.press(client, tags::TARA.name).await,
        InboundCommand::Tara(HoldAction::Release) => {
            gateway.release(client, tags::TARA.name).await
        }
        InboundCommand::Echo(event) => {
            state.hub.publish_echo(*event);
            Ok(())
        }
    };

    match result {
        Ok(()) => CommandReply::ok(),
        Err(err) => CommandReply::error(err.kind(), err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_for("validation"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("unknown_tag"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("malformed"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("auth"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for("not_connected"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("connect"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("read"), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for("write"), StatusCode::BAD_GATEWAY);
    }
}
