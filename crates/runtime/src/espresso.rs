//! HTTP client for the Espresso instrumentation server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use spresso_protocol::{Capabilities, Method, ProxyRequest, ProxyResponse};
use tracing::{debug, info, warn};

use crate::device::DeviceControl;
use crate::error::{Error, Result};
use crate::server::{ServerConfig, TEST_APK_PKG, TestServer, TestServerFactory};

/// Instrumentation runner that hosts the server.
pub const INSTRUMENTATION_COMPONENT: &str =
	"io.appium.espressoserver.test/androidx.test.runner.AndroidJUnitRunner";

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

/// Creates [`EspressoServer`] handles that install a prebuilt server package.
#[derive(Debug, Clone)]
pub struct EspressoServerFactory {
	server_apk: PathBuf,
}

impl EspressoServerFactory {
	pub fn new(server_apk: impl Into<PathBuf>) -> Self {
		Self {
			server_apk: server_apk.into(),
		}
	}
}

impl TestServerFactory for EspressoServerFactory {
	fn create(&self, config: ServerConfig, device: Arc<dyn DeviceControl>) -> Arc<dyn TestServer> {
		Arc::new(EspressoServer::new(config, device, self.server_apk.clone()))
	}
}

/// One Espresso server reachable through a forwarded host port.
pub struct EspressoServer {
	config: ServerConfig,
	device: Arc<dyn DeviceControl>,
	server_apk: PathBuf,
	http: reqwest::Client,
	session_id: Mutex<Option<String>>,
}

impl EspressoServer {
	pub fn new(config: ServerConfig, device: Arc<dyn DeviceControl>, server_apk: PathBuf) -> Self {
		let http = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.unwrap_or_default();
		Self {
			config,
			device,
			server_apk,
			http,
			session_id: Mutex::new(None),
		}
	}

	/// Session id assigned by the server, once started.
	pub fn session_id(&self) -> Option<String> {
		self.session_id.lock().clone()
	}

	fn remote_session_id(&self) -> Result<String> {
		self.session_id()
			.ok_or_else(|| Error::ServerError("no session is running on the Espresso server".to_string()))
	}

	/// Copies the server package next to the session files so signing never touches the original.
	async fn prepare_server_apk(&self) -> Result<PathBuf> {
		if !tokio::fs::try_exists(&self.server_apk).await.unwrap_or(false) {
			return Err(Error::InvalidApp {
				app: self.server_apk.display().to_string(),
				reason: "the Espresso server package does not exist".to_string(),
			});
		}
		let dir = match &self.config.tmp_dir {
			Some(dir) => dir.clone(),
			None => std::env::temp_dir(),
		};
		tokio::fs::create_dir_all(&dir).await?;
		let package = self.config.app_package.as_deref().unwrap_or("app");
		let target = dir.join(format!("espresso-server-{package}.apk"));
		tokio::fs::copy(&self.server_apk, &target).await?;

		let signed = self
			.device
			.check_apk_cert(&target, Some(TEST_APK_PKG))
			.await?;
		if !signed {
			self.device.sign(&target, Some(TEST_APK_PKG)).await.map_err(|e| Error::SigningFailed {
				path: target.clone(),
				reason: e.to_string(),
			})?;
		}
		Ok(target)
	}
}

#[async_trait]
impl TestServer for EspressoServer {
	async fn install_test_apk(&self) -> Result<()> {
		if self.config.skip_server_installation {
			info!(target = "spresso.server", "skipping Espresso server installation");
			return Ok(());
		}
		if self.config.force_rebuild || self.config.build_config.is_some() {
			warn!(
				target = "spresso.server",
				apk = %self.server_apk.display(),
				"server rebuilds are not supported; installing the prebuilt server package"
			);
		}

		let apk = self.prepare_server_apk().await?;
		if self.device.is_app_installed(TEST_APK_PKG).await? {
			self.device.uninstall_apk(TEST_APK_PKG).await?;
		}
		self.device
			.install_apk(&apk, self.config.install_timeout_ms)
			.await?;
		info!(target = "spresso.server", apk = %apk.display(), "installed Espresso server");
		Ok(())
	}

	async fn start_session(&self, caps: &Capabilities) -> Result<()> {
		let mut args = vec![
			("debug".to_string(), "false".to_string()),
			("disableAnalytics".to_string(), "true".to_string()),
		];
		if self.config.disable_suppress_accessibility_service {
			args.push(("disableSuppressAccessibilityService".to_string(), "true".to_string()));
		}
		self.device
			.start_instrumentation(INSTRUMENTATION_COMPONENT, &args)
			.await?;

		let base_url = self.config.base_url();
		wait_for_status(&self.http, &base_url, self.config.launch_timeout_ms).await?;

		let payload = json!({
			"capabilities": {
				"firstMatch": [caps],
				"alwaysMatch": {},
			}
		});
		let response = self
			.http
			.post(format!("{base_url}/session"))
			.json(&payload)
			.send()
			.await?;
		let status = response.status().as_u16();
		let body: Value = response.json().await?;
		let session_id = parse_session_response(status, &body)?;
		info!(target = "spresso.server", session_id = %session_id, "Espresso session started");
		*self.session_id.lock() = Some(session_id);
		Ok(())
	}

	async fn delete_session(&self) -> Result<()> {
		let Some(session_id) = self.session_id.lock().take() else {
			return Ok(());
		};
		let url = format!("{}/session/{session_id}", self.config.base_url());
		let response = self.http.delete(url).send().await?;
		if !response.status().is_success() {
			return Err(Error::ServerError(format!(
				"deleting session {session_id} returned HTTP {}",
				response.status().as_u16()
			)));
		}
		Ok(())
	}

	async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse> {
		let path = match self.session_id() {
			Some(id) => rewrite_session_path(&request.path, &id),
			None => request.path.clone(),
		};
		let url = format!("{}{path}", self.config.base_url());
		debug!(target = "spresso.server", method = %request.method, url = %url, "proxying");

		let mut builder = self.http.request(to_reqwest(request.method), url);
		if !request.body.is_empty() {
			builder = builder
				.header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
				.body(request.body);
		}
		let response = builder.send().await?;
		let status = response.status().as_u16();
		let content_type = response
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.map(str::to_string);
		let body = response.bytes().await?.to_vec();
		Ok(ProxyResponse {
			status,
			content_type,
			body,
		})
	}

	async fn proxy_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
		let url = format!("{}/session/{}{path}", self.config.base_url(), self.remote_session_id()?);
		let mut builder = self.http.request(to_reqwest(method), url);
		if let Some(body) = &body {
			builder = builder.json(body);
		}
		let response = builder.send().await?;
		let status = response.status().as_u16();
		let body: Value = response.json().await?;
		if let Some(message) = error_message(&body) {
			return Err(Error::ServerError(message));
		}
		if status >= 400 {
			return Err(Error::ServerError(format!("{method} {path} returned HTTP {status}")));
		}
		Ok(body.get("value").cloned().unwrap_or(Value::Null))
	}
}

/// Polls `GET /status` until the server answers successfully.
pub async fn wait_for_status(http: &reqwest::Client, base_url: &str, timeout_ms: u64) -> Result<()> {
	let url = format!("{base_url}/status");
	let deadline = Instant::now() + Duration::from_millis(timeout_ms);
	loop {
		match http.get(&url).timeout(STATUS_POLL_INTERVAL * 4).send().await {
			Ok(response) if response.status().is_success() => {
				debug!(target = "spresso.server", url = %url, "server is up");
				return Ok(());
			}
			Ok(response) => {
				debug!(target = "spresso.server", status = response.status().as_u16(), "server not ready")
			}
			Err(err) => debug!(target = "spresso.server", error = %err, "server not reachable yet"),
		}
		if Instant::now() >= deadline {
			return Err(Error::ServerLaunchTimeout { timeout_ms });
		}
		tokio::time::sleep(STATUS_POLL_INTERVAL).await;
	}
}

/// Extracts the session id from a `POST /session` answer.
pub fn parse_session_response(status: u16, body: &Value) -> Result<String> {
	if let Some(message) = error_message(body) {
		return Err(Error::ServerError(message));
	}
	if status >= 400 {
		return Err(Error::ServerError(format!("session creation returned HTTP {status}")));
	}
	body.pointer("/value/sessionId")
		.or_else(|| body.get("sessionId"))
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| Error::ServerError(format!("session creation returned no session id: {body}")))
}

fn error_message(body: &Value) -> Option<String> {
	let value = body.get("value")?;
	let error = value.get("error")?.as_str()?;
	let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
	Some(format!("{error}: {message}"))
}

/// Replaces the session id segment of `/session/<id>/...` with `server_id`.
pub fn rewrite_session_path(path: &str, server_id: &str) -> String {
	let Some(rest) = path.strip_prefix("/session/") else {
		return path.to_string();
	};
	match rest.split_once('/') {
		Some((_, tail)) => format!("/session/{server_id}/{tail}"),
		None => format!("/session/{server_id}"),
	}
}

fn to_reqwest(method: Method) -> reqwest::Method {
	match method {
		Method::Get => reqwest::Method::GET,
		Method::Post => reqwest::Method::POST,
		Method::Delete => reqwest::Method::DELETE,
	}
}
