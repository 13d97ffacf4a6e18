//! Typed session options derived from capabilities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::caps::Capabilities;

/// Default adb server port.
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// Default APK install timeout in milliseconds.
pub const DEFAULT_INSTALL_TIMEOUT_MS: u64 = 90_000;

/// Default time to wait for the launch activity, in milliseconds.
pub const DEFAULT_APP_WAIT_DURATION_MS: u64 = 20_000;

/// Default time to wait for the on-device server to answer `/status`.
pub const DEFAULT_SERVER_LAUNCH_TIMEOUT_MS: u64 = 45_000;

/// Default time budget for switching into the web view on startup.
pub const DEFAULT_AUTO_WEBVIEW_TIMEOUT_MS: u64 = 2_000;

/// Runtime options for one session.
///
/// Built from the negotiated [`Capabilities`] and completed with defaults
/// by [`SessionOptions::apply_defaults`]. A few fields (`udid`,
/// `emulator_port`, resolved `app`, package and activity names) are filled
/// in during session bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
	/// App reference: local path, URL, or resolved package path after bootstrap.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_package: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_activity: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_wait_package: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_wait_activity: Option<String>,
	/// Activity wait timeout in ms.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub app_wait_duration: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub browser_name: Option<String>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub platform_version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub udid: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub emulator_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub avd: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub avd_args: Option<String>,
	pub reboot: bool,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub full_reset: Option<bool>,
	pub fast_reset: bool,
	pub skip_uninstall: bool,
	pub skip_unlock: bool,
	pub no_sign: bool,
	pub dont_stop_app_on_reset: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auto_launch: Option<bool>,

	/// Host-side port forwarded to the on-device server.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub adb_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_adb_host: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub android_install_timeout: Option<u64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub espresso_server_launch_timeout: Option<u64>,
	pub force_espresso_rebuild: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub espresso_build_config: Option<Value>,
	pub show_gradle_log: bool,
	pub skip_server_installation: bool,
	pub disable_suppress_accessibility_service: bool,

	pub use_keystore: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub keystore_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub keystore_password: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub key_alias: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub key_password: Option<String>,

	pub auto_webview: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auto_webview_timeout: Option<u64>,
	pub native_web_screenshot: bool,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub uninstall_other_packages: Option<PackageList>,
	pub unicode_keyboard: bool,
	pub reset_keyboard: bool,
	pub ignore_hidden_api_policy_error: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub locale: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tmp_dir: Option<String>,
}

impl SessionOptions {
	/// Decodes options from a capability map; unknown keys are ignored.
	pub fn from_capabilities(caps: &Capabilities) -> serde_json::Result<Self> {
		serde_json::from_value(caps.clone().into_value())
	}

	/// Fills the options every session relies on when the client left them out.
	pub fn apply_defaults(&mut self) {
		self.full_reset.get_or_insert(false);
		self.auto_launch.get_or_insert(true);
		self.adb_port.get_or_insert(DEFAULT_ADB_PORT);
		self.android_install_timeout
			.get_or_insert(DEFAULT_INSTALL_TIMEOUT_MS);
	}

	pub fn full_reset(&self) -> bool {
		self.full_reset.unwrap_or(false)
	}

	pub fn auto_launch(&self) -> bool {
		self.auto_launch.unwrap_or(true)
	}

	pub fn adb_port(&self) -> u16 {
		self.adb_port.unwrap_or(DEFAULT_ADB_PORT)
	}

	pub fn install_timeout_ms(&self) -> u64 {
		self.android_install_timeout
			.unwrap_or(DEFAULT_INSTALL_TIMEOUT_MS)
	}

	pub fn app_wait_duration_ms(&self) -> u64 {
		self.app_wait_duration
			.unwrap_or(DEFAULT_APP_WAIT_DURATION_MS)
	}

	pub fn server_launch_timeout_ms(&self) -> u64 {
		self.espresso_server_launch_timeout
			.unwrap_or(DEFAULT_SERVER_LAUNCH_TIMEOUT_MS)
	}

	pub fn auto_webview_timeout_ms(&self) -> u64 {
		self.auto_webview_timeout
			.filter(|ms| *ms > 0)
			.unwrap_or(DEFAULT_AUTO_WEBVIEW_TIMEOUT_MS)
	}

	/// Host the on-device server is reachable on after port forwarding.
	pub fn server_host(&self) -> &str {
		self.remote_adb_host
			.as_deref()
			.or(self.host.as_deref())
			.unwrap_or("127.0.0.1")
	}
}

/// Package list given either as a JSON array or a comma separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageList {
	List(Vec<String>),
	Text(String),
}

impl PackageList {
	/// Returns the trimmed, non-empty package names.
	pub fn packages(&self) -> Vec<String> {
		let items: Vec<String> = match self {
			PackageList::List(items) => items.clone(),
			PackageList::Text(text) => {
				let trimmed = text.trim();
				if trimmed.starts_with('[') {
					serde_json::from_str::<Vec<String>>(trimmed).unwrap_or_default()
				} else {
					trimmed.split(',').map(str::to_string).collect()
				}
			}
		};
		items
			.into_iter()
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn caps(value: serde_json::Value) -> Capabilities {
		Capabilities::from_map(value.as_object().unwrap().clone())
	}

	#[test]
	fn defaults_fill_only_missing_values() {
		let mut opts = SessionOptions::from_capabilities(&caps(json!({
			"fullReset": true,
			"adbPort": 5038,
		})))
		.unwrap();
		opts.apply_defaults();
		assert_eq!(opts.full_reset, Some(true));
		assert_eq!(opts.auto_launch, Some(true));
		assert_eq!(opts.adb_port, Some(5038));
		assert_eq!(opts.android_install_timeout, Some(90_000));
	}

	#[test]
	fn unknown_keys_are_ignored() {
		let opts = SessionOptions::from_capabilities(&caps(json!({
			"platformName": "Android",
			"automationName": "Espresso",
			"appium:noSign": true,
		})))
		.unwrap();
		assert!(opts.no_sign);
	}

	#[test]
	fn package_list_accepts_all_shapes() {
		let text = PackageList::Text("com.a, com.b,,".to_string());
		assert_eq!(text.packages(), vec!["com.a", "com.b"]);

		let json_text = PackageList::Text(r#"["com.a","com.c"]"#.to_string());
		assert_eq!(json_text.packages(), vec!["com.a", "com.c"]);

		let list = PackageList::List(vec!["com.d".into(), " ".into()]);
		assert_eq!(list.packages(), vec!["com.d"]);
	}

	#[test]
	fn server_host_prefers_remote_adb_host() {
		let mut opts = SessionOptions::default();
		assert_eq!(opts.server_host(), "127.0.0.1");
		opts.host = Some("10.0.0.2".into());
		assert_eq!(opts.server_host(), "10.0.0.2");
		opts.remote_adb_host = Some("10.0.0.3".into());
		assert_eq!(opts.server_host(), "10.0.0.3");
	}
}
