//! Device metadata reported back to clients.

use serde::{Deserialize, Serialize};

/// Metadata queried from the device once the session is up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
	/// API level as reported by `ro.build.version.sdk`.
	pub api_version: String,
	pub platform_version: String,
	pub manufacturer: String,
	pub model: String,
	/// Physical display size, e.g. `1080x2400`.
	pub real_display_size: String,
	pub display_density: u32,
}

/// Launch information read from an application manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInfo {
	pub app_package: Option<String>,
	pub app_activity: Option<String>,
	pub app_wait_package: Option<String>,
	pub app_wait_activity: Option<String>,
}
