//! Capability normalization and the small derivations session startup needs.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use spresso_protocol::{Capabilities, SessionOptions};
use tracing::info;

use crate::error::{Result, SessionError};

const WIPE_DATA_ARG: &str = "-wipe-data";

static PACKAGE_OR_BUNDLE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^([a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+)+$").expect("package pattern is valid")
});

static AVD_NAME_INVALID_CHARS: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_.]").expect("avd pattern is valid"));

/// Rejects browser sessions, which the instrumentation cannot drive.
pub fn reject_browser_session(opts: &SessionOptions) -> Result<()> {
	match opts.browser_name.as_deref().map(str::trim) {
		Some(name) if !name.is_empty() => Err(SessionError::CapabilityValidation(format!(
			"Browser sessions ('browserName' is '{name}') cannot be run in Espresso because Espresso \
			 automation doesn't have permission to access browsers"
		))),
		_ => Ok(()),
	}
}

/// Returns the session capabilities with the static server details underneath.
///
/// Client capabilities win over the details; the untouched client set is kept
/// under `desired`.
pub fn with_server_details(caps: &Capabilities) -> Capabilities {
	let mut merged = Capabilities::new();
	merged.set("platform", "LINUX");
	merged.set("webStorageEnabled", false);
	merged.set("takesScreenshot", true);
	merged.set("javascriptEnabled", true);
	merged.set("databaseEnabled", false);
	merged.set("networkConnectionEnabled", true);
	merged.set("locationContextEnabled", false);
	merged.set("warnings", json!({}));
	merged.set("desired", caps.clone().into_value());
	merged.merge(caps);
	merged
}

/// Fills `opts.avd` from `deviceName` and `platformVersion` for reboot sessions.
pub fn set_avd_from_capabilities(opts: &mut SessionOptions) -> Result<()> {
	if opts.avd.is_some() {
		info!(target = "spresso.session", "avd name defined, ignoring device name and platform version");
		return Ok(());
	}
	let device_name = opts.device_name.as_deref().ok_or_else(|| {
		SessionError::CapabilityValidation(
			"avd or deviceName should be specified when reboot option is enabled".to_string(),
		)
	})?;
	let platform_version = opts.platform_version.as_deref().ok_or_else(|| {
		SessionError::CapabilityValidation(
			"avd or platformVersion should be specified when reboot option is enabled".to_string(),
		)
	})?;
	opts.avd = Some(avd_name(device_name, platform_version));
	Ok(())
}

/// `<device name with unsafe characters replaced>__<platform version>`.
pub fn avd_name(device_name: &str, platform_version: &str) -> String {
	let device = AVD_NAME_INVALID_CHARS.replace_all(device_name, "-");
	format!("{device}__{platform_version}")
}

/// Appends `-wipe-data` unless it is already present (case-insensitively).
pub fn add_wipe_data_to_avd_args(avd_args: &mut Option<String>) {
	match avd_args {
		None => *avd_args = Some(WIPE_DATA_ARG.to_string()),
		Some(args) if args.trim().is_empty() => *args = WIPE_DATA_ARG.to_string(),
		Some(args) if !args.to_lowercase().contains(WIPE_DATA_ARG) => {
			args.push(' ');
			args.push_str(WIPE_DATA_ARG);
		}
		Some(_) => {}
	}
}

/// Prefixes relative activity names with `package`.
///
/// `.Main` and `Main` become `<package>.Main`; fully qualified names pass through.
pub fn qualify_activity_name(activity: &str, package: Option<&str>) -> String {
	let Some(package) = package.filter(|package| !package.is_empty()) else {
		return activity.to_string();
	};
	if activity.starts_with('.') || !activity.contains('.') {
		format!("{package}.{}", activity.trim_start_matches('.'))
	} else {
		activity.to_string()
	}
}

/// Non-empty string capability.
pub fn string_value(caps: &Capabilities, key: &str) -> Option<String> {
	caps.get_str(key)
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_string)
}

/// Whether `value` looks like a package name rather than a file path.
pub fn is_package_or_bundle(value: &str) -> bool {
	PACKAGE_OR_BUNDLE.is_match(value)
}

/// `app` is absent but `appPackage` names an installed package.
pub fn app_on_device(opts: &SessionOptions) -> bool {
	opts.app.is_none() && opts.app_package.as_deref().is_some_and(is_package_or_bundle)
}
