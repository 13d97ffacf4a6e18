//! Per-session mutable state.

use std::sync::Arc;

use serde_json::{Map, Value};
use spresso_protocol::{Capabilities, SessionOptions};
use spresso_runtime::{DeviceControl, NATIVE_CONTEXT, TestServer, WEBVIEW_CONTEXT_PREFIX, WebviewDriver};

/// Recordings and streams started during the session that teardown must stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingState {
	pub screen_recording: bool,
	pub screen_streaming: bool,
}

/// Everything one session owns.
///
/// Exactly one exists per [`super::SessionOrchestrator`]; it is created at the
/// start of session creation and dropped at the end of teardown.
pub struct SessionContext {
	pub session_id: String,
	/// Client capabilities, enriched during startup.
	pub caps: Capabilities,
	pub opts: SessionOptions,
	pub current_context: String,
	pub device: Option<Arc<dyn DeviceControl>>,
	pub server: Option<Arc<dyn TestServer>>,
	/// Engine attached to a web view, if any.
	pub webview: Option<Arc<dyn WebviewDriver>>,
	/// True exactly between a successful startup and the start of teardown.
	pub proxy_active: bool,
	/// Host port forwarded to the on-device server.
	pub system_port: Option<u16>,
	pub api_level: Option<u32>,
	/// Animations were on and startup turned them off.
	pub animations_disabled: bool,
	/// IME active before the session switched keyboards.
	pub default_ime: Option<String>,
	/// Emulator started for this session.
	pub booted_avd: Option<String>,
	pub recording: RecordingState,
	/// The app under test was already installed and no `app` was given.
	pub app_on_device: bool,
	pub timeouts: Map<String, Value>,
}

impl SessionContext {
	pub fn new(session_id: impl Into<String>, caps: Capabilities) -> Self {
		Self {
			session_id: session_id.into(),
			caps,
			opts: SessionOptions::default(),
			current_context: NATIVE_CONTEXT.to_string(),
			device: None,
			server: None,
			webview: None,
			proxy_active: false,
			system_port: None,
			api_level: None,
			animations_disabled: false,
			default_ime: None,
			booted_avd: None,
			recording: RecordingState::default(),
			app_on_device: false,
			timeouts: Map::new(),
		}
	}

	pub fn in_webview_context(&self) -> bool {
		self.current_context.starts_with(WEBVIEW_CONTEXT_PREFIX)
	}

	/// Browser sessions are rejected at startup, so this only reflects the raw capability.
	pub fn is_browser_session(&self) -> bool {
		self.opts
			.browser_name
			.as_deref()
			.is_some_and(|name| !name.trim().is_empty())
	}
}

impl std::fmt::Debug for SessionContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionContext")
			.field("session_id", &self.session_id)
			.field("current_context", &self.current_context)
			.field("device", &self.device.as_ref().map(|d| d.device_id().to_string()))
			.field("has_server", &self.server.is_some())
			.field("has_webview", &self.webview.is_some())
			.field("proxy_active", &self.proxy_active)
			.field("system_port", &self.system_port)
			.finish_non_exhaustive()
	}
}
