//! Decides where each client command is executed.
//!
//! Two ordered tables list the commands that must never reach the native
//! server: one for plain native sessions and one used while a web view engine
//! is attached. The first matching `(method, pattern)` entry wins.

use std::sync::LazyLock;

use regex::Regex;
use spresso_protocol::Method;
use spresso_protocol::Method::{Get, Post};

/// A `(method, pattern)` pair. Patterns are anchored at the start of the path.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
	pub method: Method,
	pub pattern: Regex,
}

impl ProxyRoute {
	fn new(method: Method, pattern: &str) -> Self {
		Self {
			method,
			pattern: Regex::new(pattern).expect("route table patterns are valid"),
		}
	}

	pub fn matches(&self, method: Method, path: &str) -> bool {
		self.method == method && self.pattern.is_match(path)
	}
}

fn table(entries: &[(Method, &str)]) -> Vec<ProxyRoute> {
	entries
		.iter()
		.map(|(method, pattern)| ProxyRoute::new(*method, pattern))
		.collect()
}

/// Commands handled locally in native sessions.
pub static NATIVE_NO_PROXY: LazyLock<Vec<ProxyRoute>> = LazyLock::new(|| {
	table(&[
		(Get, r"^/session/[^/]*$"),
		(Get, r"^/session/[^/]+/appium/device/current_activity"),
		(Get, r"^/session/[^/]+/appium/device/current_package"),
		(Get, r"^/session/[^/]+/appium/device/display_density"),
		(Get, r"^/session/[^/]+/appium/device/is_keyboard_shown"),
		(Get, r"^/session/[^/]+/appium/device/system_bars"),
		(Get, r"^/session/[^/]+/appium/device/system_time"),
		(Get, r"^/session/[^/]+/appium/settings"),
		(Get, r"^/session/[^/]+/context"),
		(Get, r"^/session/[^/]+/contexts"),
		(Get, r"^/session/[^/]+/ime/[^/]+"),
		(Get, r"^/session/[^/]+/network_connection"),
		(Get, r"^/session/[^/]+/timeouts"),
		(Get, r"^/session/[^/]+/url"),
		(Post, r"^/session/[^/]+/appium/app/background"),
		(Post, r"^/session/[^/]+/appium/app/close"),
		(Post, r"^/session/[^/]+/appium/app/launch"),
		(Post, r"^/session/[^/]+/appium/app/reset"),
		(Post, r"^/session/[^/]+/appium/app/strings"),
		(Post, r"^/session/[^/]+/appium/compare_images"),
		(Post, r"^/session/[^/]+/appium/device/activate_app"),
		(Post, r"^/session/[^/]+/appium/device/app_installed"),
		(Post, r"^/session/[^/]+/appium/device/app_state"),
		(Post, r"^/session/[^/]+/appium/device/finger_print"),
		(Post, r"^/session/[^/]+/appium/device/get_clipboard"),
		(Post, r"^/session/[^/]+/appium/device/install_app"),
		(Post, r"^/session/[^/]+/appium/device/is_locked"),
		(Post, r"^/session/[^/]+/appium/device/lock"),
		(Post, r"^/session/[^/]+/appium/device/pull_file"),
		(Post, r"^/session/[^/]+/appium/device/pull_folder"),
		(Post, r"^/session/[^/]+/appium/device/push_file"),
		(Post, r"^/session/[^/]+/appium/device/remove_app"),
		(Post, r"^/session/[^/]+/appium/device/start_activity"),
		(Post, r"^/session/[^/]+/appium/device/terminate_app"),
		(Post, r"^/session/[^/]+/appium/device/unlock"),
		(Post, r"^/session/[^/]+/appium/getPerformanceData"),
		(Post, r"^/session/[^/]+/appium/performanceData/types"),
		(Post, r"^/session/[^/]+/appium/settings"),
		(Post, r"^/session/[^/]+/appium/execute_driver"),
		(Post, r"^/session/[^/]+/appium/start_recording_screen"),
		(Post, r"^/session/[^/]+/appium/stop_recording_screen"),
		(Post, r"^/session/[^/]+/context"),
		(Post, r"^/session/[^/]+/execute"),
		(Post, r"^/session/[^/]+/execute/async"),
		(Post, r"^/session/[^/]+/execute/sync"),
		(Post, r"^/session/[^/]+/execute_async"),
		(Post, r"^/session/[^/]+/ime/[^/]+"),
		(Post, r"^/session/[^/]+/location"),
		(Post, r"^/session/[^/]+/network_connection"),
		(Post, r"^/session/[^/]+/timeouts"),
		(Post, r"^/session/[^/]+/url"),
		(Get, r"^/session/[^/]+/log/types"),
		(Post, r"^/session/[^/]+/log"),
		(Get, r"^/session/[^/]+/se/log/types"),
		(Post, r"^/session/[^/]+/se/log"),
	])
});

/// Commands handled locally while a web view engine is attached.
pub static WEBVIEW_NO_PROXY: LazyLock<Vec<ProxyRoute>> = LazyLock::new(|| {
	table(&[
		(Get, r"^/session/[^/]+/appium"),
		(Get, r"^/session/[^/]+/context"),
		(Get, r"^/session/[^/]+/element/[^/]+/rect"),
		(Get, r"^/session/[^/]+/orientation"),
		(Post, r"^/session/[^/]+/appium"),
		(Post, r"^/session/[^/]+/context"),
		(Post, r"^/session/[^/]+/orientation"),
		(Post, r"^/session/[^/]+/touch/multi/perform"),
		(Post, r"^/session/[^/]+/touch/perform"),
		// mobile: commands keep working in web contexts
		(Post, r"^/session/[^/]+/execute$"),
		(Post, r"^/session/[^/]+/execute/sync"),
		(Get, r"^/session/[^/]+/log/types"),
		(Post, r"^/session/[^/]+/log"),
		(Get, r"^/session/[^/]+/se/log/types"),
		(Post, r"^/session/[^/]+/se/log"),
	])
});

/// Appended to the active table when `nativeWebScreenshot` is set.
pub static SCREENSHOT_NO_PROXY: LazyLock<ProxyRoute> =
	LazyLock::new(|| ProxyRoute::new(Get, r"^/session/[^/]+/screenshot"));

/// Where a command goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
	/// Handled by the driver itself.
	Local,
	/// Forwarded byte-for-byte to the on-device server.
	ForwardToNative,
	/// Forwarded to the engine attached to the current web view.
	ForwardToSecondary,
}

/// Session state the routing decision depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteInput {
	/// A web view engine is attached to the session.
	pub has_webview_driver: bool,
	/// The current context is a web view.
	pub in_webview_context: bool,
	pub native_web_screenshot: bool,
}

/// The avoid list active for `input`, screenshot rule last.
pub fn avoid_list(input: RouteInput) -> Vec<&'static ProxyRoute> {
	let base: &'static [ProxyRoute] = if input.has_webview_driver {
		&WEBVIEW_NO_PROXY
	} else {
		&NATIVE_NO_PROXY
	};
	let mut routes: Vec<&'static ProxyRoute> = base.iter().collect();
	if input.native_web_screenshot {
		routes.push(&SCREENSHOT_NO_PROXY);
	}
	routes
}

/// Returns true when `(method, path)` must not be forwarded to the native server.
pub fn is_local(method: Method, path: &str, input: RouteInput) -> bool {
	avoid_list(input)
		.iter()
		.any(|route| route.matches(method, path))
}

/// Resolves the target for one command.
pub fn resolve_route(method: Method, path: &str, input: RouteInput) -> RouteTarget {
	if is_local(method, path, input) {
		RouteTarget::Local
	} else if input.has_webview_driver && input.in_webview_context {
		RouteTarget::ForwardToSecondary
	} else {
		RouteTarget::ForwardToNative
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn native() -> RouteInput {
		RouteInput::default()
	}

	fn webview() -> RouteInput {
		RouteInput {
			has_webview_driver: true,
			in_webview_context: true,
			native_web_screenshot: false,
		}
	}

	#[test]
	fn all_patterns_compile() {
		assert_eq!(NATIVE_NO_PROXY.len(), 55);
		assert_eq!(WEBVIEW_NO_PROXY.len(), 15);
		assert!(SCREENSHOT_NO_PROXY.matches(Get, "/session/abc/screenshot"));
	}

	#[test]
	fn contexts_are_local_in_native_session() {
		assert_eq!(resolve_route(Get, "/session/abc/contexts", native()), RouteTarget::Local);
		assert_eq!(resolve_route(Get, "/session/abc", native()), RouteTarget::Local);
	}

	#[test]
	fn element_commands_forward_to_native() {
		assert_eq!(
			resolve_route(Post, "/session/abc/element", native()),
			RouteTarget::ForwardToNative
		);
		assert_eq!(
			resolve_route(Get, "/session/abc/element/1/text", native()),
			RouteTarget::ForwardToNative
		);
	}

	#[test]
	fn method_match_is_exact() {
		assert_eq!(resolve_route(Post, "/session/abc/contexts", native()), RouteTarget::ForwardToNative);
		assert_eq!(resolve_route(Method::Delete, "/session/abc/timeouts", native()), RouteTarget::ForwardToNative);
	}

	#[test]
	fn patterns_are_anchored() {
		assert_eq!(resolve_route(Get, "/x/session/abc/contexts", native()), RouteTarget::ForwardToNative);
	}

	#[test]
	fn execute_only_exact_in_webview() {
		assert_eq!(resolve_route(Post, "/session/abc/execute", webview()), RouteTarget::Local);
		assert_eq!(resolve_route(Post, "/session/abc/execute/sync", webview()), RouteTarget::Local);
		assert_eq!(
			resolve_route(Post, "/session/abc/execute/async", webview()),
			RouteTarget::ForwardToSecondary
		);
		assert_eq!(resolve_route(Post, "/session/abc/execute/async", native()), RouteTarget::Local);
	}

	#[test]
	fn screenshot_rule_follows_capability() {
		let mut input = native();
		assert_eq!(resolve_route(Get, "/session/abc/screenshot", input), RouteTarget::ForwardToNative);
		input.native_web_screenshot = true;
		assert_eq!(resolve_route(Get, "/session/abc/screenshot", input), RouteTarget::Local);
		assert!(std::ptr::eq(*avoid_list(input).last().unwrap(), &*SCREENSHOT_NO_PROXY));
	}

	#[test]
	fn webview_handle_in_native_context_forwards_to_native() {
		let input = RouteInput {
			has_webview_driver: true,
			in_webview_context: false,
			native_web_screenshot: false,
		};
		assert_eq!(resolve_route(Get, "/session/abc/source", input), RouteTarget::ForwardToNative);
		// list selection depends on the handle alone
		assert_eq!(resolve_route(Get, "/session/abc/timeouts", input), RouteTarget::ForwardToNative);
		assert_eq!(resolve_route(Get, "/session/abc/orientation", input), RouteTarget::Local);
	}

	#[test]
	fn webview_list_replaces_native_list() {
		assert_eq!(resolve_route(Get, "/session/abc/url", webview()), RouteTarget::ForwardToSecondary);
		assert_eq!(resolve_route(Get, "/session/abc/element/1/rect", webview()), RouteTarget::Local);
	}
}
