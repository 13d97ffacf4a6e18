//! WebDriver HTTP front end.
//!
//! Session creation and deletion go to the orchestrator; every other
//! `/session/{id}/...` request is answered locally or relayed to the native
//! or web view server as decided by [`spresso::routing`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method as HttpMethod, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use spresso::{RouteTarget, SessionOrchestrator};
use spresso_protocol::{
	Capabilities, Method, NewSessionPayload, NewSessionResponse, ProxyRequest, ProxyResponse, WireValue,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
	orchestrator: Arc<Mutex<SessionOrchestrator>>,
	default_capabilities: Arc<Capabilities>,
}

impl AppState {
	pub fn new(orchestrator: SessionOrchestrator, default_capabilities: Capabilities) -> Self {
		Self {
			orchestrator: Arc::new(Mutex::new(orchestrator)),
			default_capabilities: Arc::new(default_capabilities),
		}
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/status", get(status))
		.route("/session", post(create_session))
		.route("/session/{id}", delete(delete_session).get(session_command))
		.route("/session/{id}/{*rest}", any(session_command))
		.with_state(state)
}

pub async fn serve(host: &str, port: u16, state: AppState) -> AnyResult<()> {
	let addr: SocketAddr = format!("{host}:{port}")
		.parse()
		.with_context(|| format!("Invalid host/port combination: {host}:{port}"))?;

	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("Failed to bind WebDriver server to {addr}"))?;
	info!(target = "spresso.http", %addr, "WebDriver server listening");

	let orchestrator = state.orchestrator.clone();
	axum::serve(listener, router(state).into_make_service())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("WebDriver server error")?;

	// a running session still holds the device and a forwarded port
	orchestrator.lock().await.delete().await;
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(target = "spresso.http", error = %err, "Unable to listen for shutdown signal");
		std::future::pending::<()>().await;
	}
	info!(target = "spresso.http", "shutting down");
}

async fn status(State(state): State<AppState>) -> Json<Value> {
	let busy = state.orchestrator.try_lock().map_or(true, |orchestrator| orchestrator.session_id().is_some());
	Json(json!({
		"value": {
			"ready": !busy,
			"message": if busy { "A session is running" } else { "Ready for a new session" },
			"build": { "version": env!("CARGO_PKG_VERSION") },
		}
	}))
}

async fn create_session(State(state): State<AppState>, body: Bytes) -> Result<Json<WireValue>> {
	let payload: NewSessionPayload = serde_json::from_slice(&body)
		.map_err(|e| ApiError::InvalidArgument(format!("Invalid new session payload: {e}")))?;

	let mut caps = (*state.default_capabilities).clone();
	caps.merge(&payload.merged());

	let (session_id, caps) = state.orchestrator.lock().await.create(caps).await?;
	let response = NewSessionResponse {
		session_id,
		capabilities: caps.into_value(),
	};
	Ok(Json(WireValue::new(
		serde_json::to_value(response).map_err(spresso::SessionError::from)?,
	)))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<WireValue>> {
	state.orchestrator.lock().await.delete_session(&id).await?;
	Ok(Json(WireValue::new(Value::Null)))
}

async fn session_command(
	State(state): State<AppState>,
	http_method: HttpMethod,
	uri: Uri,
	body: Bytes,
) -> Result<Response> {
	let path = uri.path().to_string();
	let method: Method = http_method
		.as_str()
		.parse()
		.map_err(|_| ApiError::UnknownCommand(format!("The command '{http_method} {path}' is not implemented")))?;
	let session_id = session_id_of(&path).unwrap_or_default();

	let mut orchestrator = state.orchestrator.lock().await;
	orchestrator.ensure_session(session_id)?;

	let route = orchestrator.route(method, &path);
	debug!(target = "spresso.http", %method, path = %path, ?route, "dispatching");

	let request = ProxyRequest {
		method,
		path: path.clone(),
		body: body.to_vec(),
	};
	match route {
		RouteTarget::Local => {
			let body = parse_body(&body)?;
			let value = orchestrator.execute_local(method, &path, body).await?;
			Ok(Json(WireValue::new(value)).into_response())
		}
		RouteTarget::ForwardToNative => {
			let server = orchestrator.native_server()?;
			drop(orchestrator);
			Ok(relay(server.proxy(request).await?))
		}
		RouteTarget::ForwardToSecondary => {
			let driver = orchestrator.webview_driver()?;
			drop(orchestrator);
			Ok(relay(driver.proxy(request).await?))
		}
	}
}

fn session_id_of(path: &str) -> Option<&str> {
	path.strip_prefix("/session/")?.split('/').next()
}

fn parse_body(body: &[u8]) -> Result<Option<Value>> {
	if body.iter().all(u8::is_ascii_whitespace) {
		return Ok(None);
	}
	serde_json::from_slice(body)
		.map(Some)
		.map_err(|e| ApiError::InvalidArgument(format!("Request body is not valid JSON: {e}")))
}

/// Returns the upstream response unchanged.
fn relay(upstream: ProxyResponse) -> Response {
	let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
	let mut response = Response::new(Body::from(upstream.body));
	*response.status_mut() = status;
	if let Some(content_type) = upstream.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
		response.headers_mut().insert(header::CONTENT_TYPE, content_type);
	}
	response
}
