//! Device-control seam.
//!
//! The session orchestrator only talks to the device through these traits.
//! [`crate::adb`] provides the implementation backed by the `adb` binary;
//! tests plug in in-memory fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use spresso_protocol::{DeviceInfo, LaunchInfo, SessionOptions};

use crate::error::{Error, Result};

/// Package signing and bundle conversion.
///
/// Split from [`DeviceControl`] because app resolution only needs these
/// three operations.
#[async_trait]
pub trait PackageTools: Send + Sync {
	/// Returns true when `apk` is already signed with the certificate expected for `package`.
	async fn check_apk_cert(&self, apk: &Path, package: Option<&str>) -> Result<bool>;

	/// Signs `apk` in place.
	async fn sign(&self, apk: &Path, package: Option<&str>) -> Result<()>;

	/// Builds a universal `.apk` out of an `.aab` bundle and returns its path.
	async fn extract_universal_apk(&self, aab: &Path) -> Result<PathBuf>;
}

/// Result of [`DeviceControl::init_device`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOutcome {
	/// IME that was active before the session switched keyboards.
	pub default_ime: Option<String>,
}

/// Parameters of an on-device `screenrecord` capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingOptions {
	/// Maximum capture length; `screenrecord` refuses more than 1800 seconds.
	pub time_limit_secs: u32,
	pub bit_rate: Option<u32>,
	/// `WIDTHxHEIGHT`.
	pub video_size: Option<String>,
}

impl Default for RecordingOptions {
	fn default() -> Self {
		Self {
			time_limit_secs: DEFAULT_RECORDING_TIME_LIMIT_SECS,
			bit_rate: None,
			video_size: None,
		}
	}
}

pub const DEFAULT_RECORDING_TIME_LIMIT_SECS: u32 = 180;
pub const MAX_RECORDING_TIME_LIMIT_SECS: u32 = 1800;

/// Where a raw H.264 screen stream is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
	pub host: String,
	pub port: u16,
}

pub const DEFAULT_STREAMING_PORT: u16 = 8093;

impl Default for StreamOptions {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: DEFAULT_STREAMING_PORT,
		}
	}
}

/// Device identity resolved from capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
	pub udid: String,
	/// Console port when the target is an emulator.
	pub emulator_port: Option<u16>,
	/// AVD name when the emulator was booted for this session.
	pub booted_avd: Option<String>,
}

/// Operations the session needs from a connected device.
#[async_trait]
pub trait DeviceControl: PackageTools {
	/// Serial of the device this handle talks to.
	fn device_id(&self) -> &str;

	async fn api_level(&self) -> Result<u32>;

	async fn set_hidden_api_policy(&self, value: &str, ignore_error: bool) -> Result<()>;

	async fn set_default_hidden_api_policy(&self, ignore_error: bool) -> Result<()>;

	/// Reads launch information from the app manifest when package or activity are unknown.
	async fn launch_info(&self, opts: &SessionOptions) -> Result<Option<LaunchInfo>>;

	/// Prepares the device for a session: locale, keyboard, log capture.
	async fn init_device(&self, opts: &SessionOptions) -> Result<InitOutcome>;

	async fn is_animation_on(&self) -> Result<bool>;

	async fn set_animation_state(&self, enabled: bool) -> Result<()>;

	async fn set_ime(&self, ime: &str) -> Result<()>;

	async fn forward_port(&self, system_port: u16, device_port: u16) -> Result<()>;

	async fn remove_port_forward(&self, system_port: u16) -> Result<()>;

	async fn unlock(&self) -> Result<()>;

	async fn is_app_installed(&self, package: &str) -> Result<bool>;

	async fn install_apk(&self, apk: &Path, timeout_ms: u64) -> Result<()>;

	/// Returns false when the package was not installed.
	async fn uninstall_apk(&self, package: &str) -> Result<bool>;

	/// Clears application data.
	async fn reset_app(&self, package: &str) -> Result<()>;

	async fn add_to_device_idle_whitelist(&self, packages: &[&str]) -> Result<()>;

	async fn force_stop(&self, package: &str) -> Result<()>;

	/// Waits until `package`/`activity` is focused.
	///
	/// `activity` may be a comma separated list and may contain `*` wildcards.
	async fn wait_for_activity(&self, package: &str, activity: &str, timeout_ms: u64)
	-> Result<()>;

	/// Returns the focused `(package, activity)`.
	async fn focused_activity(&self) -> Result<(String, String)>;

	/// Starts an instrumentation runner in the background.
	async fn start_instrumentation(&self, component: &str, args: &[(String, String)]) -> Result<()>;

	async fn stop_logcat(&self) -> Result<()>;

	async fn kill_emulator(&self, avd: &str) -> Result<()>;

	async fn device_info(&self) -> Result<DeviceInfo>;

	/// Captures the screen as a base64 encoded PNG.
	async fn screenshot(&self) -> Result<String>;

	async fn start_screen_recording(&self, _options: &RecordingOptions) -> Result<()> {
		Err(Error::Unsupported("screen recording"))
	}

	/// Stops the running capture and returns the video as base64, or `None`
	/// when nothing was recording.
	async fn stop_screen_recording(&self) -> Result<Option<String>> {
		Ok(None)
	}

	async fn is_media_projection_recording_running(&self) -> Result<bool> {
		Ok(false)
	}

	async fn stop_media_projection_recording(&self) -> Result<()> {
		Ok(())
	}

	async fn start_screen_streaming(&self, _options: &StreamOptions) -> Result<()> {
		Err(Error::Unsupported("screen streaming"))
	}

	async fn stop_screen_streaming(&self) -> Result<()> {
		Ok(())
	}
}

/// Picks a device from capabilities and opens a [`DeviceControl`] for it.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
	async fn resolve(&self, opts: &SessionOptions) -> Result<DeviceTarget>;

	async fn connect(
		&self,
		target: &DeviceTarget,
		opts: &SessionOptions,
	) -> Result<Arc<dyn DeviceControl>>;
}
