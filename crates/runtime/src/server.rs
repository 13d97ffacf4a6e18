//! On-device test server seam.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use spresso_protocol::{Capabilities, Method, ProxyRequest, ProxyResponse};

use crate::device::DeviceControl;
use crate::error::Result;

/// Port the Espresso server listens on inside the device.
pub const DEVICE_PORT: u16 = 6791;

/// Package of the instrumentation APK that hosts the Espresso server.
pub const TEST_APK_PKG: &str = "io.appium.espressoserver.test";

/// Helper app used for IME, unlock and recording on the device.
pub const SETTINGS_HELPER_PKG_ID: &str = "io.appium.settings";

/// Keystore used to sign the server and app under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreConfig {
	pub path: PathBuf,
	pub password: Option<String>,
	pub alias: Option<String>,
	pub key_password: Option<String>,
}

/// Everything needed to build, install and talk to the on-device server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
	pub host: String,
	pub system_port: u16,
	pub device_port: u16,
	/// Resolved app under test.
	pub apk: Option<PathBuf>,
	pub tmp_dir: Option<PathBuf>,
	pub app_package: Option<String>,
	pub app_activity: Option<String>,
	pub force_rebuild: bool,
	pub build_config: Option<Value>,
	pub show_gradle_log: bool,
	pub launch_timeout_ms: u64,
	pub install_timeout_ms: u64,
	pub skip_server_installation: bool,
	pub keystore: Option<KeystoreConfig>,
	pub disable_suppress_accessibility_service: bool,
}

impl ServerConfig {
	pub fn base_url(&self) -> String {
		format!("http://{}:{}", self.host, self.system_port)
	}
}

/// Control handle for the on-device server.
#[async_trait]
pub trait TestServer: Send + Sync {
	/// Installs (or reinstalls) the server instrumentation package.
	async fn install_test_apk(&self) -> Result<()>;

	/// Launches the server and opens a remote session with `caps`.
	async fn start_session(&self, caps: &Capabilities) -> Result<()>;

	/// Closes the remote session.
	async fn delete_session(&self) -> Result<()>;

	/// Relays a raw request byte-for-byte.
	async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse>;

	/// Sends a command relative to the remote session and returns its `value`.
	async fn proxy_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;
}

/// Builds [`TestServer`] handles once package/activity and port are known.
pub trait TestServerFactory: Send + Sync {
	fn create(&self, config: ServerConfig, device: Arc<dyn DeviceControl>) -> Arc<dyn TestServer>;
}
