//! Parsers for `adb` and SDK tool output.

/// A line of `adb devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
	pub udid: String,
	pub state: String,
}

impl ConnectedDevice {
	pub fn is_online(&self) -> bool {
		self.state == "device"
	}

	/// Console port of an `emulator-NNNN` serial.
	pub fn emulator_port(&self) -> Option<u16> {
		emulator_port(&self.udid)
	}
}

/// Parses `adb devices` output, skipping the header and daemon chatter.
pub fn parse_devices(output: &str) -> Vec<ConnectedDevice> {
	output
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
		.filter_map(|line| {
			let mut parts = line.split_whitespace();
			let udid = parts.next()?;
			let state = parts.next()?;
			Some(ConnectedDevice {
				udid: udid.to_string(),
				state: state.to_string(),
			})
		})
		.collect()
}

pub fn emulator_port(udid: &str) -> Option<u16> {
	udid.strip_prefix("emulator-")?.parse().ok()
}

/// Parses `wm size`, preferring an override over the physical size.
pub fn parse_wm_size(output: &str) -> Option<String> {
	let mut physical = None;
	for line in output.lines() {
		if let Some(size) = line.trim().strip_prefix("Override size:") {
			return Some(size.trim().to_string());
		}
		if let Some(size) = line.trim().strip_prefix("Physical size:") {
			physical = Some(size.trim().to_string());
		}
	}
	physical
}

/// Parses `wm density`, preferring an override over the physical density.
pub fn parse_wm_density(output: &str) -> Option<u32> {
	let mut physical = None;
	for line in output.lines() {
		if let Some(value) = line.trim().strip_prefix("Override density:") {
			return value.trim().parse().ok();
		}
		if let Some(value) = line.trim().strip_prefix("Physical density:") {
			physical = value.trim().parse().ok();
		}
	}
	physical
}

/// Extracts `(package, activity)` from `dumpsys window` output.
///
/// Looks at `mCurrentFocus` first and falls back to `mFocusedApp`.
pub fn parse_focused_activity(output: &str) -> Option<(String, String)> {
	["mCurrentFocus", "mFocusedApp"].iter().find_map(|marker| {
		output
			.lines()
			.filter(|line| line.contains(marker))
			.find_map(component_in_line)
	})
}

fn component_in_line(line: &str) -> Option<(String, String)> {
	line.split(|c: char| c.is_whitespace() || c == '}' || c == '{')
		.filter_map(|token| token.split_once('/'))
		.find(|(package, activity)| {
			!package.is_empty()
				&& !activity.is_empty()
				&& package.contains('.')
				&& package.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
		})
		.map(|(package, activity)| {
			let activity = if activity.starts_with('.') {
				format!("{package}{activity}")
			} else {
				activity.to_string()
			};
			(package.to_string(), activity)
		})
}

/// Launch information read from `aapt dump badging`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Badging {
	pub package: Option<String>,
	pub launchable_activity: Option<String>,
}

pub fn parse_badging(output: &str) -> Badging {
	let mut badging = Badging::default();
	for line in output.lines() {
		if let Some(rest) = line.strip_prefix("package:") {
			badging.package = quoted_attr(rest, "name");
		} else if let Some(rest) = line.strip_prefix("launchable-activity:") {
			if badging.launchable_activity.is_none() {
				badging.launchable_activity = quoted_attr(rest, "name");
			}
		}
	}
	badging
}

fn quoted_attr(line: &str, attr: &str) -> Option<String> {
	let needle = format!("{attr}='");
	let start = line.find(&needle)? + needle.len();
	let end = line[start..].find('\'')? + start;
	Some(line[start..end].to_string())
}

/// Tests whether the focused activity matches one of the wanted activities.
///
/// `wanted` is a comma separated list; entries may start with `.` (relative to
/// `package`) and may contain `*` wildcards.
pub fn activity_matches(package: &str, wanted: &str, focused: &str) -> bool {
	wanted
		.split(',')
		.map(str::trim)
		.filter(|pattern| !pattern.is_empty())
		.any(|pattern| {
			let full = if pattern.starts_with('.') {
				format!("{package}{pattern}")
			} else {
				pattern.to_string()
			};
			wildcard_match(&full, focused)
				|| (!pattern.contains('.') && wildcard_match(pattern, focused.rsplit('.').next().unwrap_or(focused)))
		})
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
	let parts: Vec<&str> = pattern.split('*').collect();
	if parts.len() == 1 {
		return pattern == text;
	}
	let mut rest = text;
	for (idx, part) in parts.iter().enumerate() {
		if idx == 0 {
			let Some(stripped) = rest.strip_prefix(part) else {
				return false;
			};
			rest = stripped;
		} else if idx == parts.len() - 1 {
			return rest.ends_with(part);
		} else {
			let Some(pos) = rest.find(part) else {
				return false;
			};
			rest = &rest[pos + part.len()..];
		}
	}
	true
}
