//! The single-session state machine.
//!
//! [`SessionOrchestrator`] owns at most one [`SessionContext`] and decides,
//! from its state, whether a command is answered locally or relayed. Startup
//! lives in `create.rs` and teardown in `delete.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use spresso_protocol::{DeviceInfo, Method};
use spresso_runtime::{AppResolver, DeviceConnector, TestServer, TestServerFactory, WebviewConnector, WebviewDriver};

use super::SessionContext;
use crate::commands::{self, AndroidCommands};
use crate::error::{Result, SessionError};
use crate::routing::{RouteInput, RouteTarget, resolve_route};

/// Per-session auxiliary handlers registered outside the orchestrator.
#[async_trait]
pub trait SessionHandlers: Send + Sync {
	/// Drops every handler registered for `session_id`.
	async fn remove_all(&self, session_id: &str) -> Result<()>;
}

/// External collaborators a session is built from.
#[derive(Clone)]
pub struct Collaborators {
	pub connector: Arc<dyn DeviceConnector>,
	pub servers: Arc<dyn TestServerFactory>,
	/// Shared across sessions so the artifact cache outlives them.
	pub resolver: Arc<AppResolver>,
	pub webviews: Option<Arc<dyn WebviewConnector>>,
	pub handlers: Option<Arc<dyn SessionHandlers>>,
}

impl Collaborators {
	pub fn new(
		connector: Arc<dyn DeviceConnector>,
		servers: Arc<dyn TestServerFactory>,
		resolver: Arc<AppResolver>,
	) -> Self {
		Self {
			connector,
			servers,
			resolver,
			webviews: None,
			handlers: None,
		}
	}

	pub fn with_webviews(mut self, webviews: Arc<dyn WebviewConnector>) -> Self {
		self.webviews = Some(webviews);
		self
	}

	pub fn with_handlers(mut self, handlers: Arc<dyn SessionHandlers>) -> Self {
		self.handlers = Some(handlers);
		self
	}
}

/// Lifecycle of the single session an orchestrator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Idle,
	Creating,
	Active,
	Deleting,
}

/// Creates, routes for and tears down one session at a time.
pub struct SessionOrchestrator {
	pub(super) collaborators: Collaborators,
	pub(super) state: SessionState,
	pub(super) session: Option<SessionContext>,
}

impl SessionOrchestrator {
	pub fn new(collaborators: Collaborators) -> Self {
		Self {
			collaborators,
			state: SessionState::Idle,
			session: None,
		}
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn session_id(&self) -> Option<&str> {
		self.session.as_ref().map(|ctx| ctx.session_id.as_str())
	}

	pub fn context(&self) -> Option<&SessionContext> {
		self.session.as_ref()
	}

	/// Commands go to the on-device server only while this is true.
	pub fn proxy_active(&self) -> bool {
		self.session.as_ref().is_some_and(|ctx| ctx.proxy_active)
	}

	/// The on-device server can always take commands once a session exists.
	pub fn can_proxy(&self) -> bool {
		self.session.is_some()
	}

	/// Fails unless `session_id` names the running session.
	pub fn ensure_session(&self, session_id: &str) -> Result<&SessionContext> {
		match &self.session {
			Some(ctx) if ctx.session_id == session_id && self.state == SessionState::Active => Ok(ctx),
			_ => Err(SessionError::NoSuchSession),
		}
	}

	pub fn route_input(&self) -> RouteInput {
		match &self.session {
			Some(ctx) => RouteInput {
				has_webview_driver: ctx.webview.is_some(),
				in_webview_context: ctx.in_webview_context(),
				native_web_screenshot: ctx.opts.native_web_screenshot,
			},
			None => RouteInput::default(),
		}
	}

	pub fn route(&self, method: Method, path: &str) -> RouteTarget {
		resolve_route(method, path, self.route_input())
	}

	/// Server handle for forwarding; only available while proxying is active.
	pub fn native_server(&self) -> Result<Arc<dyn TestServer>> {
		self.session
			.as_ref()
			.filter(|ctx| ctx.proxy_active)
			.and_then(|ctx| ctx.server.clone())
			.ok_or(SessionError::NoSuchSession)
	}

	pub fn webview_driver(&self) -> Result<Arc<dyn WebviewDriver>> {
		let ctx = self.session.as_ref().ok_or(SessionError::NoSuchSession)?;
		ctx.webview
			.clone()
			.ok_or_else(|| SessionError::NoSuchContext(ctx.current_context.clone()))
	}

	/// Answers a command the routing policy keeps local.
	pub async fn execute_local(&mut self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
		commands::execute_local(self, method, path, body).await
	}

	/// Deletes the session named by `session_id`.
	pub async fn delete_session(&mut self, session_id: &str) -> Result<()> {
		self.ensure_session(session_id)?;
		self.delete().await;
		Ok(())
	}
}

#[async_trait]
impl AndroidCommands for SessionOrchestrator {
	fn session(&self) -> Result<&SessionContext> {
		self.session.as_ref().ok_or(SessionError::NoSuchSession)
	}

	fn session_mut(&mut self) -> Result<&mut SessionContext> {
		self.session.as_mut().ok_or(SessionError::NoSuchSession)
	}

	fn webview_connector(&self) -> Option<Arc<dyn WebviewConnector>> {
		self.collaborators.webviews.clone()
	}

	/// The server reports device details without extra shell round trips.
	async fn mobile_get_device_info(&self) -> Result<DeviceInfo> {
		let value = self
			.test_server()?
			.proxy_command(Method::Get, "/appium/device/info", None)
			.await?;
		Ok(serde_json::from_value(value)?)
	}
}
