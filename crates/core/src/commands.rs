//! Commands the driver answers itself instead of forwarding them.
//!
//! [`AndroidCommands`] carries the generic Android behavior as default
//! methods; [`crate::SessionOrchestrator`] overrides what the Espresso server
//! does better.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use spresso_protocol::{DeviceInfo, Method, ProxyRequest};
use spresso_runtime::{
	DEFAULT_RECORDING_TIME_LIMIT_SECS, DeviceControl, MAX_RECORDING_TIME_LIMIT_SECS, NATIVE_CONTEXT,
	RecordingOptions, StreamOptions, TestServer, WEBVIEW_CONTEXT_PREFIX, WebviewConnector,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::session::SessionContext;

#[async_trait]
pub trait AndroidCommands: Send + Sync {
	fn session(&self) -> Result<&SessionContext>;

	fn session_mut(&mut self) -> Result<&mut SessionContext>;

	fn webview_connector(&self) -> Option<Arc<dyn WebviewConnector>>;

	fn device(&self) -> Result<Arc<dyn DeviceControl>> {
		self.session()?
			.device
			.clone()
			.ok_or(SessionError::NoSuchSession)
	}

	fn default_context_name(&self) -> &'static str {
		NATIVE_CONTEXT
	}

	/// `WEBVIEW_<appPackage>`.
	fn default_webview_name(&self) -> Result<String> {
		let package = self.session()?.opts.app_package.clone().unwrap_or_default();
		Ok(format!("{WEBVIEW_CONTEXT_PREFIX}{package}"))
	}

	async fn get_current_context(&self) -> Result<String> {
		Ok(self.session()?.current_context.clone())
	}

	async fn get_contexts(&self) -> Result<Vec<String>> {
		let mut contexts = vec![self.default_context_name().to_string()];
		if let Some(connector) = self.webview_connector() {
			let device = self.device()?;
			contexts.extend(connector.webview_contexts(&*device).await?);
		}
		Ok(contexts)
	}

	async fn set_context(&mut self, name: &str) -> Result<()> {
		let name = if name.is_empty() { self.default_context_name() } else { name };
		if self.session()?.current_context == name {
			return Ok(());
		}
		if name == self.default_context_name() {
			self.session_mut()?.current_context = name.to_string();
			return Ok(());
		}

		let contexts = self.get_contexts().await?;
		if !contexts.iter().any(|context| context == name) {
			return Err(SessionError::NoSuchContext(name.to_string()));
		}
		let connector = self
			.webview_connector()
			.ok_or_else(|| SessionError::NoSuchContext(name.to_string()))?;

		let attached = self
			.session()?
			.webview
			.clone()
			.filter(|driver| driver.context_name() == name);
		let driver = match attached {
			Some(driver) => driver,
			None => {
				if let Some(previous) = self.session_mut()?.webview.take() {
					if let Err(err) = previous.stop().await {
						warn!(target = "spresso.session", error = %err, "failed to stop previous web view engine");
					}
				}
				let device = self.device()?;
				let opts = self.session()?.opts.clone();
				connector.attach(device, name, &opts).await?
			}
		};

		let ctx = self.session_mut()?;
		ctx.webview = Some(driver);
		ctx.current_context = name.to_string();
		debug!(target = "spresso.session", context = name, "context switched");
		Ok(())
	}

	async fn get_current_activity(&self) -> Result<String> {
		Ok(self.device()?.focused_activity().await?.1)
	}

	async fn get_current_package(&self) -> Result<String> {
		Ok(self.device()?.focused_activity().await?.0)
	}

	async fn mobile_get_device_info(&self) -> Result<DeviceInfo> {
		Ok(self.device()?.device_info().await?)
	}

	/// Server of the running session, for commands relayed as JSON values.
	fn test_server(&self) -> Result<Arc<dyn TestServer>> {
		self.session()?
			.server
			.clone()
			.ok_or(SessionError::NoSuchSession)
	}

	async fn get_screenshot(&self) -> Result<String> {
		Ok(self.device()?.screenshot().await?)
	}

	async fn get_settings(&self) -> Result<Value> {
		Ok(self
			.test_server()?
			.proxy_command(Method::Get, "/appium/settings", None)
			.await?)
	}

	async fn update_settings(&self, settings: Value) -> Result<Value> {
		Ok(self
			.test_server()?
			.proxy_command(Method::Post, "/appium/settings", Some(settings))
			.await?)
	}

	async fn start_recording_screen(&mut self, options: &RecordingOptions) -> Result<()> {
		self.device()?.start_screen_recording(options).await?;
		self.session_mut()?.recording.screen_recording = true;
		Ok(())
	}

	/// Returns the base64 video, empty when nothing was recording.
	async fn stop_recording_screen(&mut self) -> Result<String> {
		let video = self.device()?.stop_screen_recording().await;
		self.session_mut()?.recording.screen_recording = false;
		Ok(video?.unwrap_or_default())
	}

	async fn mobile_start_screen_streaming(&mut self, options: &StreamOptions) -> Result<()> {
		self.device()?.start_screen_streaming(options).await?;
		self.session_mut()?.recording.screen_streaming = true;
		Ok(())
	}

	async fn mobile_stop_screen_streaming(&mut self) -> Result<()> {
		let stopped = self.device()?.stop_screen_streaming().await;
		self.session_mut()?.recording.screen_streaming = false;
		stopped?;
		Ok(())
	}

	/// Runs `mobile: <command>`. Device-level commands stay on the host; the
	/// rest are implemented by the on-device server.
	async fn execute_mobile(&mut self, command: &str, args: Value) -> Result<Value> {
		debug!(target = "spresso.session", command, "mobile command");
		match command {
			"getDeviceInfo" => Ok(serde_json::to_value(self.mobile_get_device_info().await?)?),
			"startScreenStreaming" => {
				self.mobile_start_screen_streaming(&stream_options(&args)?).await?;
				Ok(Value::Null)
			}
			"stopScreenStreaming" => {
				self.mobile_stop_screen_streaming().await?;
				Ok(Value::Null)
			}
			"isMediaProjectionRecordingRunning" => {
				Ok(Value::from(self.device()?.is_media_projection_recording_running().await?))
			}
			"stopMediaProjectionRecording" => {
				self.device()?.stop_media_projection_recording().await?;
				Ok(Value::Null)
			}
			_ => {
				let path = format!("/appium/execute_mobile/{command}");
				Ok(self
					.test_server()?
					.proxy_command(Method::Post, &path, Some(args))
					.await?)
			}
		}
	}
}

/// Locally handled commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
	GetSession,
	GetContext,
	GetContexts,
	SetContext,
	CurrentActivity,
	CurrentPackage,
	GetTimeouts,
	SetTimeouts,
	Screenshot,
	GetSettings,
	UpdateSettings,
	Execute,
	StartRecordingScreen,
	StopRecordingScreen,
}

impl LocalCommand {
	/// Maps `(method, /session/<id>/<suffix>)` to a handler.
	pub fn parse(method: Method, path: &str) -> Option<Self> {
		let rest = path.strip_prefix("/session/")?;
		let suffix = rest.find('/').map_or("", |idx| &rest[idx..]);
		let command = match (method, suffix.trim_end_matches('/')) {
			(Method::Get, "") => Self::GetSession,
			(Method::Get, "/context") => Self::GetContext,
			(Method::Get, "/contexts") => Self::GetContexts,
			(Method::Post, "/context") => Self::SetContext,
			(Method::Get, "/appium/device/current_activity") => Self::CurrentActivity,
			(Method::Get, "/appium/device/current_package") => Self::CurrentPackage,
			(Method::Get, "/timeouts") => Self::GetTimeouts,
			(Method::Post, "/timeouts") => Self::SetTimeouts,
			(Method::Get, "/screenshot") => Self::Screenshot,
			(Method::Get, "/appium/settings") => Self::GetSettings,
			(Method::Post, "/appium/settings") => Self::UpdateSettings,
			(Method::Post, "/execute" | "/execute/sync") => Self::Execute,
			(Method::Post, "/appium/start_recording_screen") => Self::StartRecordingScreen,
			(Method::Post, "/appium/stop_recording_screen") => Self::StopRecordingScreen,
			_ => return None,
		};
		Some(command)
	}
}

/// Runs a locally handled command and returns the W3C `value`.
pub async fn execute_local<C>(commands: &mut C, method: Method, path: &str, body: Option<Value>) -> Result<Value>
where
	C: AndroidCommands + ?Sized,
{
	let Some(command) = LocalCommand::parse(method, path) else {
		return Err(SessionError::UnknownCommand(format!(
			"The command '{method} {path}' is not implemented"
		)));
	};
	let body = body.unwrap_or(Value::Null);

	let value = match command {
		LocalCommand::GetSession => commands.session()?.caps.clone().into_value(),
		LocalCommand::GetContext => Value::from(commands.get_current_context().await?),
		LocalCommand::GetContexts => Value::from(commands.get_contexts().await?),
		LocalCommand::SetContext => {
			let name = match body.get("name") {
				Some(Value::String(name)) => name.clone(),
				Some(Value::Null) | None => String::new(),
				Some(other) => {
					return Err(SessionError::InvalidArgument(format!(
						"Context name must be a string, got {other}"
					)));
				}
			};
			commands.set_context(&name).await?;
			Value::Null
		}
		LocalCommand::CurrentActivity => Value::from(commands.get_current_activity().await?),
		LocalCommand::CurrentPackage => Value::from(commands.get_current_package().await?),
		LocalCommand::GetTimeouts => Value::Object(commands.session()?.timeouts.clone()),
		LocalCommand::SetTimeouts => {
			let Value::Object(values) = body else {
				return Err(SessionError::InvalidArgument("Timeouts must be a JSON object".to_string()));
			};
			commands.session_mut()?.timeouts.extend(values);
			Value::Null
		}
		LocalCommand::Screenshot => Value::from(commands.get_screenshot().await?),
		LocalCommand::GetSettings => commands.get_settings().await?,
		LocalCommand::UpdateSettings => {
			if !body.get("settings").is_some_and(Value::is_object) {
				return Err(SessionError::InvalidArgument("'settings' must be a JSON object".to_string()));
			}
			commands.update_settings(body).await?
		}
		LocalCommand::Execute => execute_script(commands, method, path, body).await?,
		LocalCommand::StartRecordingScreen => {
			let options = recording_options(body.get("options").unwrap_or(&Value::Null))?;
			commands.start_recording_screen(&options).await?;
			info!(target = "spresso.session", time_limit = options.time_limit_secs, "screen recording started");
			Value::Null
		}
		LocalCommand::StopRecordingScreen => Value::from(commands.stop_recording_screen().await?),
	};
	Ok(value)
}

/// `mobile:` scripts run anywhere; other scripts only inside a web view.
async fn execute_script<C>(commands: &mut C, method: Method, path: &str, body: Value) -> Result<Value>
where
	C: AndroidCommands + ?Sized,
{
	let Some(script) = body.get("script").and_then(Value::as_str) else {
		return Err(SessionError::InvalidArgument("'script' must be a string".to_string()));
	};
	if let Some(command) = script.trim().strip_prefix("mobile:") {
		let command = command.trim();
		if command.is_empty() {
			return Err(SessionError::InvalidArgument("The mobile command name is missing".to_string()));
		}
		let args = match body.get("args") {
			Some(Value::Array(args)) => args.first().cloned().unwrap_or(Value::Null),
			Some(other) => other.clone(),
			None => Value::Null,
		};
		let args = if args.is_null() { Value::Object(Map::new()) } else { args };
		return commands.execute_mobile(command, args).await;
	}

	let ctx = commands.session()?;
	let driver = match &ctx.webview {
		Some(driver) if ctx.in_webview_context() => driver.clone(),
		_ => {
			return Err(SessionError::UnknownCommand(
				"Only 'mobile:' scripts can be executed in the native context".to_string(),
			));
		}
	};
	let response = driver
		.proxy(ProxyRequest {
			method,
			path: path.to_string(),
			body: serde_json::to_vec(&body)?,
		})
		.await?;
	let mut payload: Value = serde_json::from_slice(&response.body)?;
	let value = payload.get_mut("value").map(Value::take).unwrap_or(Value::Null);
	if response.status >= 400 {
		let message = value
			.get("message")
			.and_then(Value::as_str)
			.unwrap_or("script execution failed");
		return Err(spresso_runtime::Error::Webview(message.to_string()).into());
	}
	Ok(value)
}

/// Reads `startRecordingScreen` options; `timeLimit` may be a number or a numeric string.
fn recording_options(options: &Value) -> Result<RecordingOptions> {
	let number = |key: &str| -> Result<Option<u32>> {
		let parsed = match options.get(key) {
			None | Some(Value::Null) => return Ok(None),
			Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
			Some(Value::String(s)) => s.trim().parse().ok(),
			Some(_) => None,
		};
		parsed
			.map(Some)
			.ok_or_else(|| SessionError::InvalidArgument(format!("'{key}' must be a positive integer")))
	};

	let time_limit_secs = number("timeLimit")?.unwrap_or(DEFAULT_RECORDING_TIME_LIMIT_SECS);
	if time_limit_secs == 0 || time_limit_secs > MAX_RECORDING_TIME_LIMIT_SECS {
		return Err(SessionError::InvalidArgument(format!(
			"'timeLimit' must be in range 1..={MAX_RECORDING_TIME_LIMIT_SECS} seconds, got {time_limit_secs}"
		)));
	}
	Ok(RecordingOptions {
		time_limit_secs,
		bit_rate: number("bitRate")?,
		video_size: options.get("videoSize").and_then(Value::as_str).map(str::to_string),
	})
}

fn stream_options(args: &Value) -> Result<StreamOptions> {
	let mut options = StreamOptions::default();
	if let Some(host) = args.get("host").and_then(Value::as_str) {
		options.host = host.to_string();
	}
	match args.get("port") {
		None | Some(Value::Null) => {}
		Some(port) => {
			options.port = port
				.as_u64()
				.and_then(|port| u16::try_from(port).ok())
				.ok_or_else(|| SessionError::InvalidArgument(format!("'port' must be a TCP port, got {port}")))?;
		}
	}
	Ok(options)
}
