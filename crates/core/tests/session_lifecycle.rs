// Session lifecycle tests against in-memory device and server fakes.
//
// Every fake appends to one shared call log so tests can assert on the order
// in which startup and teardown touch the device.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use spresso::{
	AndroidCommands, Collaborators, RouteTarget, SessionError, SessionOrchestrator, SessionState, TROUBLESHOOTING_HINT,
};
use spresso_protocol::{Capabilities, DeviceInfo, LaunchInfo, Method, ProxyRequest, ProxyResponse, SessionOptions};
use spresso_runtime::{
	AppResolver, DeviceConnector, DeviceControl, DeviceTarget, Error, InitOutcome, PackageTools, RecordingOptions,
	Result, ServerConfig, StreamOptions, TestServer, TestServerFactory, WebviewConnector, WebviewDriver,
};
use tokio::sync::Barrier;

#[derive(Default)]
struct Calls {
	log: Mutex<Vec<String>>,
	fail: Mutex<HashSet<&'static str>>,
}

impl Calls {
	fn record(&self, call: impl Into<String>) {
		self.log.lock().push(call.into());
	}

	fn check(&self, name: &'static str) -> Result<()> {
		self.record(name);
		if self.fail.lock().contains(name) {
			return Err(Error::DeviceUnavailable(format!("{name} failed")));
		}
		Ok(())
	}

	fn fail_on(&self, name: &'static str) {
		self.fail.lock().insert(name);
	}

	fn names(&self) -> Vec<String> {
		self.log.lock().clone()
	}

	fn position(&self, name: &str) -> Option<usize> {
		self.log.lock().iter().position(|call| call == name)
	}

	fn contains(&self, name: &str) -> bool {
		self.position(name).is_some()
	}

	fn count(&self, name: &str) -> usize {
		self.log.lock().iter().filter(|call| *call == name).count()
	}
}

struct FakeDevice {
	calls: Arc<Calls>,
	signed: bool,
	installed: bool,
	animations_on: bool,
	/// Capture stops wait here, so they only finish when run side by side.
	stop_barrier: Option<Arc<Barrier>>,
}

impl FakeDevice {
	async fn rendezvous(&self) {
		if let Some(barrier) = &self.stop_barrier {
			barrier.wait().await;
		}
	}
}

#[async_trait]
impl PackageTools for FakeDevice {
	async fn check_apk_cert(&self, _apk: &Path, _package: Option<&str>) -> Result<bool> {
		self.calls.check("check_apk_cert")?;
		Ok(self.signed)
	}

	async fn sign(&self, _apk: &Path, _package: Option<&str>) -> Result<()> {
		self.calls.check("sign")
	}

	async fn extract_universal_apk(&self, _aab: &Path) -> Result<PathBuf> {
		self.calls.check("extract_universal_apk")?;
		Err(Error::DeviceUnavailable("no bundletool".into()))
	}
}

#[async_trait]
impl DeviceControl for FakeDevice {
	fn device_id(&self) -> &str {
		"emulator-5554"
	}

	async fn api_level(&self) -> Result<u32> {
		self.calls.check("api_level")?;
		Ok(30)
	}

	async fn set_hidden_api_policy(&self, value: &str, _ignore_error: bool) -> Result<()> {
		self.calls.check("set_hidden_api_policy")?;
		assert_eq!(value, "1");
		Ok(())
	}

	async fn set_default_hidden_api_policy(&self, _ignore_error: bool) -> Result<()> {
		self.calls.check("set_default_hidden_api_policy")
	}

	async fn launch_info(&self, _opts: &SessionOptions) -> Result<Option<LaunchInfo>> {
		self.calls.check("launch_info")?;
		Ok(None)
	}

	async fn init_device(&self, _opts: &SessionOptions) -> Result<InitOutcome> {
		self.calls.check("init_device")?;
		Ok(InitOutcome {
			default_ime: Some("com.android.latin/.LatinIME".into()),
		})
	}

	async fn is_animation_on(&self) -> Result<bool> {
		self.calls.check("is_animation_on")?;
		Ok(self.animations_on)
	}

	async fn set_animation_state(&self, enabled: bool) -> Result<()> {
		self.calls.check(if enabled { "animations_on" } else { "animations_off" })
	}

	async fn set_ime(&self, _ime: &str) -> Result<()> {
		self.calls.check("set_ime")
	}

	async fn forward_port(&self, system_port: u16, device_port: u16) -> Result<()> {
		assert_eq!((system_port, device_port), (8300, 6791));
		self.calls.check("forward_port")
	}

	async fn remove_port_forward(&self, system_port: u16) -> Result<()> {
		assert_eq!(system_port, 8300);
		self.calls.check("remove_port_forward")
	}

	async fn unlock(&self) -> Result<()> {
		self.calls.check("unlock")
	}

	async fn is_app_installed(&self, _package: &str) -> Result<bool> {
		self.calls.check("is_app_installed")?;
		Ok(self.installed)
	}

	async fn install_apk(&self, _apk: &Path, _timeout_ms: u64) -> Result<()> {
		self.calls.check("install_apk")
	}

	async fn uninstall_apk(&self, package: &str) -> Result<bool> {
		self.calls.check("uninstall_apk")?;
		self.calls.record(format!("uninstall {package}"));
		Ok(true)
	}

	async fn reset_app(&self, _package: &str) -> Result<()> {
		self.calls.check("reset_app")
	}

	async fn add_to_device_idle_whitelist(&self, _packages: &[&str]) -> Result<()> {
		self.calls.check("idle_whitelist")
	}

	async fn force_stop(&self, _package: &str) -> Result<()> {
		self.calls.check("force_stop")
	}

	async fn wait_for_activity(&self, package: &str, activity: &str, _timeout_ms: u64) -> Result<()> {
		self.calls.check("wait_for_activity")?;
		self.calls.record(format!("waited {package}/{activity}"));
		Ok(())
	}

	async fn focused_activity(&self) -> Result<(String, String)> {
		self.calls.check("focused_activity")?;
		Ok(("com.example.app".into(), ".MainActivity".into()))
	}

	async fn start_instrumentation(&self, _component: &str, _args: &[(String, String)]) -> Result<()> {
		self.calls.check("start_instrumentation")
	}

	async fn stop_logcat(&self) -> Result<()> {
		self.calls.check("stop_logcat")
	}

	async fn kill_emulator(&self, _avd: &str) -> Result<()> {
		self.calls.check("kill_emulator")
	}

	async fn device_info(&self) -> Result<DeviceInfo> {
		self.calls.check("device_info")?;
		Ok(DeviceInfo::default())
	}

	async fn screenshot(&self) -> Result<String> {
		self.calls.check("screenshot")?;
		Ok("iVBORw0KGgo=".into())
	}

	async fn start_screen_recording(&self, options: &RecordingOptions) -> Result<()> {
		self.calls.check("start_screen_recording")?;
		self.calls.record(format!("recording limit {}", options.time_limit_secs));
		Ok(())
	}

	async fn stop_screen_recording(&self) -> Result<Option<String>> {
		self.rendezvous().await;
		self.calls.check("stop_screen_recording")?;
		Ok(Some("AAAAIGZ0eXBpc29t".into()))
	}

	async fn is_media_projection_recording_running(&self) -> Result<bool> {
		self.calls.check("is_media_projection_recording_running")?;
		Ok(false)
	}

	async fn start_screen_streaming(&self, options: &StreamOptions) -> Result<()> {
		self.calls.check("start_screen_streaming")?;
		self.calls.record(format!("streaming on {}:{}", options.host, options.port));
		Ok(())
	}

	async fn stop_screen_streaming(&self) -> Result<()> {
		self.rendezvous().await;
		self.calls.check("stop_screen_streaming")
	}
}

struct FakeServer {
	calls: Arc<Calls>,
}

#[async_trait]
impl TestServer for FakeServer {
	async fn install_test_apk(&self) -> Result<()> {
		self.calls.check("install_test_apk")
	}

	async fn start_session(&self, caps: &Capabilities) -> Result<()> {
		self.calls.check("server_start_session")?;
		self.calls
			.record(format!("server activity {}", caps.get_str("appActivity").unwrap_or_default()));
		Ok(())
	}

	async fn delete_session(&self) -> Result<()> {
		self.calls.check("server_delete_session")
	}

	async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse> {
		self.calls.record(format!("proxy {}", request.path));
		Ok(ProxyResponse {
			status: 200,
			content_type: Some("application/json".into()),
			body: br#"{"value":null}"#.to_vec(),
		})
	}

	async fn proxy_command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
		self.calls.check("proxy_command")?;
		self.calls.record(format!("command {method} {path}"));
		match (method, path) {
			(Method::Get, "/appium/device/info") => Ok(json!({
				"apiVersion": "30",
				"platformVersion": "11",
				"manufacturer": "Google",
				"model": "Pixel 4",
				"realDisplaySize": "1080x2280",
				"displayDensity": 440,
			})),
			(Method::Get, "/appium/settings") => Ok(json!({"ignoreUnimportantViews": false})),
			_ => Ok(json!({"path": path, "body": body})),
		}
	}
}

struct FakeFactory {
	calls: Arc<Calls>,
}

impl TestServerFactory for FakeFactory {
	fn create(&self, config: ServerConfig, _device: Arc<dyn DeviceControl>) -> Arc<dyn TestServer> {
		self.calls.record("server_created");
		assert_eq!(config.base_url(), "http://127.0.0.1:8300");
		Arc::new(FakeServer {
			calls: self.calls.clone(),
		})
	}
}

struct FakeConnector {
	calls: Arc<Calls>,
	signed: bool,
	installed: bool,
	stop_barrier: Option<Arc<Barrier>>,
}

#[async_trait]
impl DeviceConnector for FakeConnector {
	async fn resolve(&self, _opts: &SessionOptions) -> Result<DeviceTarget> {
		self.calls.check("resolve")?;
		Ok(DeviceTarget {
			udid: "emulator-5554".into(),
			emulator_port: Some(5554),
			booted_avd: None,
		})
	}

	async fn connect(&self, _target: &DeviceTarget, _opts: &SessionOptions) -> Result<Arc<dyn DeviceControl>> {
		self.calls.check("connect")?;
		Ok(Arc::new(FakeDevice {
			calls: self.calls.clone(),
			signed: self.signed,
			installed: self.installed,
			animations_on: true,
			stop_barrier: self.stop_barrier.clone(),
		}))
	}
}

/// Attaches after `failures` refused attempts; `u32::MAX` never attaches.
struct FakeWebviews {
	calls: Arc<Calls>,
	failures: Mutex<u32>,
}

#[async_trait]
impl WebviewConnector for FakeWebviews {
	async fn webview_contexts(&self, _device: &dyn DeviceControl) -> Result<Vec<String>> {
		self.calls.check("webview_contexts")?;
		Ok(vec!["WEBVIEW_com.example.app".into()])
	}

	async fn attach(
		&self,
		_device: Arc<dyn DeviceControl>,
		context: &str,
		_opts: &SessionOptions,
	) -> Result<Arc<dyn WebviewDriver>> {
		self.calls.record("webview_attach");
		{
			let mut failures = self.failures.lock();
			if *failures > 0 {
				if *failures != u32::MAX {
					*failures -= 1;
				}
				return Err(Error::Webview("devtools socket is not ready".into()));
			}
		}
		Ok(Arc::new(FakeWebviewDriver {
			calls: self.calls.clone(),
			context: context.to_string(),
		}))
	}
}

struct FakeWebviewDriver {
	calls: Arc<Calls>,
	context: String,
}

#[async_trait]
impl WebviewDriver for FakeWebviewDriver {
	fn context_name(&self) -> &str {
		&self.context
	}

	async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse> {
		self.calls.record(format!("webview {}", request.path));
		Ok(ProxyResponse {
			status: 200,
			content_type: Some("application/json".into()),
			body: br#"{"value":"Example Domain"}"#.to_vec(),
		})
	}

	async fn stop(&self) -> Result<()> {
		self.calls.check("webview_stop")
	}
}

fn connector(calls: &Arc<Calls>, signed: bool, installed: bool) -> FakeConnector {
	FakeConnector {
		calls: calls.clone(),
		signed,
		installed,
		stop_barrier: None,
	}
}

fn collaborators(calls: &Arc<Calls>, connector: FakeConnector) -> Collaborators {
	Collaborators::new(
		Arc::new(connector),
		Arc::new(FakeFactory { calls: calls.clone() }),
		Arc::new(AppResolver::with_unzip_preference(false)),
	)
}

fn orchestrator(calls: &Arc<Calls>, signed: bool, installed: bool) -> SessionOrchestrator {
	SessionOrchestrator::new(collaborators(calls, connector(calls, signed, installed)))
}

fn webview_orchestrator(calls: &Arc<Calls>, failures: u32) -> SessionOrchestrator {
	let webviews = FakeWebviews {
		calls: calls.clone(),
		failures: Mutex::new(failures),
	};
	SessionOrchestrator::new(collaborators(calls, connector(calls, true, true)).with_webviews(Arc::new(webviews)))
}

/// Capabilities for an app that is already on the device.
fn installed_app(extra: Value) -> Capabilities {
	let mut value = json!({
		"appium:appPackage": "com.example.app",
		"appium:appActivity": ".MainActivity",
		"appium:systemPort": 8300,
	});
	if let (Value::Object(base), Value::Object(extra)) = (&mut value, extra) {
		base.extend(extra);
	}
	caps(value)
}

fn caps(value: Value) -> Capabilities {
	match value {
		Value::Object(map) => Capabilities::from_map(map),
		_ => panic!("capabilities must be an object"),
	}
}

fn local_apk() -> tempfile::NamedTempFile {
	let file = tempfile::Builder::new().suffix(".apk").tempfile().unwrap();
	std::fs::write(file.path(), b"not really an apk").unwrap();
	file
}

#[tokio::test]
async fn local_unsigned_apk_session_starts_and_tears_down() {
	let calls = Arc::new(Calls::default());
	let apk = local_apk();
	let mut session = orchestrator(&calls, false, false);

	let (id, caps) = session
		.create(caps(json!({
			"platformName": "Android",
			"appium:app": apk.path().display().to_string(),
			"appium:appPackage": "com.example.app",
			"appium:appActivity": ".MainActivity",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap();

	assert_eq!(session.state(), SessionState::Active);
	assert!(session.proxy_active());
	assert_eq!(session.session_id(), Some(id.as_str()));

	let log = calls.names();
	let sign = calls.position("sign").unwrap();
	let install = calls.position("install_apk").unwrap();
	let start = calls.position("server_start_session").unwrap();
	let wait = calls.position("wait_for_activity").unwrap();
	assert!(sign < install && install < start && start < wait, "{log:?}");
	assert!(log.contains(&"server activity com.example.app.MainActivity".to_string()));
	assert!(log.contains(&"waited com.example.app/com.example.app.MainActivity".to_string()));
	assert!(calls.contains("animations_off"));

	assert_eq!(caps.get("deviceApiLevel"), Some(&json!(30)));
	assert_eq!(caps.get_str("deviceModel"), Some("Pixel 4"));
	assert_eq!(caps.get_str("deviceName"), Some("emulator-5554"));
	assert_eq!(caps.get_str("deviceUDID"), Some("emulator-5554"));

	session.delete_session(&id).await.unwrap();
	assert_eq!(session.state(), SessionState::Idle);
	assert!(!session.proxy_active());
	for step in [
		"server_delete_session",
		"animations_on",
		"force_stop",
		"stop_logcat",
		"set_default_hidden_api_policy",
		"remove_port_forward",
	] {
		assert!(calls.contains(step), "missing {step} in {:?}", calls.names());
	}
}

#[tokio::test]
async fn browser_sessions_are_rejected_before_touching_the_device() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);

	let err = session
		.create(caps(json!({
			"browserName": "Chrome",
			"appium:app": "/tmp/app.apk",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap_err();

	assert!(matches!(err, SessionError::SessionNotCreated { .. }));
	assert!(matches!(err.root(), SessionError::CapabilityValidation(_)));
	assert!(calls.names().is_empty(), "{:?}", calls.names());
	assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn failed_startup_tears_down_and_reports_hint() {
	let calls = Arc::new(Calls::default());
	calls.fail_on("server_start_session");
	let apk = local_apk();
	let mut session = orchestrator(&calls, true, false);

	let err = session
		.create(caps(json!({
			"appium:app": apk.path().display().to_string(),
			"appium:appPackage": "com.example.app",
			"appium:appActivity": ".MainActivity",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap_err();

	assert_eq!(err.error_code(), "session not created");
	assert!(err.to_string().contains(TROUBLESHOOTING_HINT), "{err}");
	assert_eq!(session.state(), SessionState::Idle);
	assert!(session.context().is_none());

	// server session never opened, so it is not closed either
	assert!(!calls.contains("server_delete_session"));
	assert!(calls.contains("remove_port_forward"));
	assert!(calls.contains("stop_logcat"));
	assert!(!calls.contains("sign"));
}

#[tokio::test]
async fn teardown_runs_every_step_despite_failures() {
	let calls = Arc::new(Calls::default());
	let apk = local_apk();
	let mut session = orchestrator(&calls, true, false);
	let (id, _) = session
		.create(caps(json!({
			"appium:app": apk.path().display().to_string(),
			"appium:appPackage": "com.example.app",
			"appium:appActivity": ".MainActivity",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap();

	calls.fail_on("server_delete_session");
	calls.fail_on("animations_on");
	calls.fail_on("force_stop");
	session.delete_session(&id).await.unwrap();

	assert!(calls.contains("stop_logcat"));
	assert!(calls.contains("remove_port_forward"));
	assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn missing_installed_package_is_reported() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, false);

	let err = session
		.create(caps(json!({
			"appium:appPackage": "com.example.app",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap_err();

	assert!(err.to_string().contains("Could not find the package 'com.example.app'"), "{err}");
	assert!(!calls.contains("install_apk"));
}

#[tokio::test]
async fn full_reset_without_app_is_rejected() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);

	let err = session
		.create(caps(json!({
			"appium:appPackage": "com.example.app",
			"appium:fullReset": true,
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap_err();

	assert!(matches!(err.root(), SessionError::CapabilityValidation(_)));
	// app-on-device packages are never uninstalled on teardown
	assert!(!calls.contains("uninstall com.example.app"));
}

#[tokio::test]
async fn second_session_is_refused_while_one_runs() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);
	let request = json!({
		"appium:appPackage": "com.example.app",
		"appium:appActivity": ".MainActivity",
		"appium:systemPort": 8300,
	});
	let (id, _) = session.create(caps(request.clone())).await.unwrap();

	let err = session.create(caps(request)).await.unwrap_err();
	assert!(matches!(err, SessionError::SessionNotCreated { .. }));
	assert_eq!(session.session_id(), Some(id.as_str()));
	assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn routing_and_local_commands_follow_the_session() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);
	assert_eq!(session.route(Method::Get, "/session/x/element"), RouteTarget::ForwardToNative);
	assert!(session.native_server().is_err());

	let (id, _) = session
		.create(caps(json!({
			"appium:appPackage": "com.example.app",
			"appium:appActivity": ".MainActivity",
			"appium:systemPort": 8300,
		})))
		.await
		.unwrap();

	assert!(calls.contains("is_app_installed"));
	assert!(!calls.contains("install_apk"));

	let prefix = format!("/session/{id}");
	assert_eq!(session.route(Method::Get, &format!("{prefix}/context")), RouteTarget::Local);
	assert_eq!(session.route(Method::Post, &format!("{prefix}/element")), RouteTarget::ForwardToNative);
	assert!(session.native_server().is_ok());

	let context = session
		.execute_local(Method::Get, &format!("{prefix}/context"), None)
		.await
		.unwrap();
	assert_eq!(context, json!("NATIVE_APP"));

	let package = session
		.execute_local(Method::Get, &format!("{prefix}/appium/device/current_package"), None)
		.await
		.unwrap();
	assert_eq!(package, json!("com.example.app"));

	session
		.execute_local(Method::Post, &format!("{prefix}/timeouts"), Some(json!({"implicit": 500})))
		.await
		.unwrap();
	let timeouts = session
		.execute_local(Method::Get, &format!("{prefix}/timeouts"), None)
		.await
		.unwrap();
	assert_eq!(timeouts, json!({"implicit": 500}));

	assert!(matches!(
		session.delete_session("other").await,
		Err(SessionError::NoSuchSession)
	));
	session.delete_session(&id).await.unwrap();
	assert!(session.ensure_session(&id).is_err());
}

#[tokio::test]
async fn device_and_server_commands_are_answered_locally() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);
	let (id, _) = session
		.create(installed_app(json!({"appium:nativeWebScreenshot": true})))
		.await
		.unwrap();
	let prefix = format!("/session/{id}");

	let screenshot = format!("{prefix}/screenshot");
	assert_eq!(session.route(Method::Get, &screenshot), RouteTarget::Local);
	assert_eq!(
		session.execute_local(Method::Get, &screenshot, None).await.unwrap(),
		json!("iVBORw0KGgo=")
	);

	let settings = format!("{prefix}/appium/settings");
	assert_eq!(
		session.execute_local(Method::Get, &settings, None).await.unwrap(),
		json!({"ignoreUnimportantViews": false})
	);
	let updated = session
		.execute_local(Method::Post, &settings, Some(json!({"settings": {"waitForIdleTimeout": 0}})))
		.await
		.unwrap();
	assert_eq!(updated["body"], json!({"settings": {"waitForIdleTimeout": 0}}));
	assert!(calls.contains("command POST /appium/settings"));
	let err = session
		.execute_local(Method::Post, &settings, Some(json!({"waitForIdleTimeout": 0})))
		.await
		.unwrap_err();
	assert!(matches!(err, SessionError::InvalidArgument(_)), "{err:?}");

	let execute = format!("{prefix}/execute/sync");
	let swiped = session
		.execute_local(
			Method::Post,
			&execute,
			Some(json!({"script": "mobile: swipe", "args": [{"direction": "up"}]})),
		)
		.await
		.unwrap();
	assert_eq!(swiped, json!({"path": "/appium/execute_mobile/swipe", "body": {"direction": "up"}}));

	let info = session
		.execute_local(
			Method::Post,
			&format!("{prefix}/execute"),
			Some(json!({"script": "mobile:getDeviceInfo", "args": []})),
		)
		.await
		.unwrap();
	assert_eq!(info["model"], json!("Pixel 4"));

	let err = session
		.execute_local(Method::Post, &execute, Some(json!({"script": "return document.title", "args": []})))
		.await
		.unwrap_err();
	assert!(matches!(err, SessionError::UnknownCommand(_)), "{err:?}");

	session.delete_session(&id).await.unwrap();
}

#[tokio::test]
async fn screen_recording_is_tracked_until_stopped() {
	let calls = Arc::new(Calls::default());
	let mut session = orchestrator(&calls, true, true);
	let (id, _) = session.create(installed_app(json!({}))).await.unwrap();
	let start = format!("/session/{id}/appium/start_recording_screen");
	let stop = format!("/session/{id}/appium/stop_recording_screen");

	let err = session
		.execute_local(Method::Post, &start, Some(json!({"options": {"timeLimit": 3600}})))
		.await
		.unwrap_err();
	assert!(matches!(err, SessionError::InvalidArgument(_)), "{err:?}");

	calls.fail_on("start_screen_recording");
	assert!(session.execute_local(Method::Post, &start, None).await.is_err());
	assert!(!session.context().unwrap().recording.screen_recording);
	calls.fail.lock().clear();

	session.execute_local(Method::Post, &start, None).await.unwrap();
	assert!(calls.contains("recording limit 180"));
	assert!(session.context().unwrap().recording.screen_recording);

	let video = session.execute_local(Method::Post, &stop, Some(json!({}))).await.unwrap();
	assert_eq!(video, json!("AAAAIGZ0eXBpc29t"));
	assert!(!session.context().unwrap().recording.screen_recording);

	session.delete_session(&id).await.unwrap();
	// stopped by the client, so teardown leaves it alone
	assert_eq!(calls.count("stop_screen_recording"), 1);
	assert!(!calls.contains("stop_screen_streaming"));
}

#[tokio::test]
async fn captures_are_stopped_side_by_side_and_failures_do_not_block_teardown() {
	let calls = Arc::new(Calls::default());
	let mut device = connector(&calls, true, true);
	device.stop_barrier = Some(Arc::new(Barrier::new(2)));
	let mut session = SessionOrchestrator::new(collaborators(&calls, device));
	let (id, _) = session.create(installed_app(json!({}))).await.unwrap();
	let prefix = format!("/session/{id}");

	session
		.execute_local(
			Method::Post,
			&format!("{prefix}/appium/start_recording_screen"),
			Some(json!({"options": {"timeLimit": "60"}})),
		)
		.await
		.unwrap();
	session
		.execute_local(
			Method::Post,
			&format!("{prefix}/execute"),
			Some(json!({"script": "mobile: startScreenStreaming", "args": [{"port": 9100}]})),
		)
		.await
		.unwrap();
	assert!(calls.contains("recording limit 60"));
	assert!(calls.contains("streaming on 127.0.0.1:9100"));
	let recording = session.context().unwrap().recording;
	assert!(recording.screen_recording && recording.screen_streaming);

	calls.fail_on("stop_screen_recording");
	tokio::time::timeout(Duration::from_secs(5), session.delete_session(&id))
		.await
		.expect("capture stops must run concurrently")
		.unwrap();

	for step in [
		"stop_screen_recording",
		"stop_screen_streaming",
		"is_media_projection_recording_running",
		"animations_on",
		"stop_logcat",
		"remove_port_forward",
	] {
		assert!(calls.contains(step), "missing {step} in {:?}", calls.names());
	}
	assert!(calls.position("stop_screen_streaming") < calls.position("stop_logcat"));
	assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn activity_wait_failure_happens_before_proxying_starts() {
	let calls = Arc::new(Calls::default());
	calls.fail_on("wait_for_activity");
	let mut session = orchestrator(&calls, true, true);

	let err = session.create(installed_app(json!({}))).await.unwrap_err();
	assert_eq!(err.error_code(), "session not created");
	assert!(calls.contains("server_start_session"));
	// the server session was opened but proxying never became active
	assert!(!calls.contains("server_delete_session"));
	assert!(calls.contains("remove_port_forward"));
	assert!(!session.proxy_active());
	assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn failure_after_proxying_starts_closes_the_server_session() {
	let calls = Arc::new(Calls::default());
	calls.fail_on("proxy_command");
	let mut session = orchestrator(&calls, true, true);

	let err = session.create(installed_app(json!({}))).await.unwrap_err();
	assert_eq!(err.error_code(), "session not created");

	let waited = calls.position("wait_for_activity").unwrap();
	let info = calls.position("proxy_command").unwrap();
	let closed = calls.position("server_delete_session").unwrap();
	assert!(waited < info && info < closed, "{:?}", calls.names());
	assert!(!session.proxy_active());
	assert!(session.native_server().is_err());
}

#[tokio::test]
async fn auto_webview_retries_until_the_engine_attaches() {
	let calls = Arc::new(Calls::default());
	let mut session = webview_orchestrator(&calls, 2);
	let (id, _) = session
		.create(installed_app(json!({"appium:autoWebview": true})))
		.await
		.unwrap();
	let prefix = format!("/session/{id}");

	assert_eq!(session.state(), SessionState::Active);
	assert!(session.proxy_active());
	assert_eq!(calls.count("webview_attach"), 3);
	assert_eq!(session.get_current_context().await.unwrap(), "WEBVIEW_com.example.app");
	assert_eq!(
		session.route(Method::Post, &format!("{prefix}/element")),
		RouteTarget::ForwardToSecondary
	);
	assert_eq!(session.webview_driver().unwrap().context_name(), "WEBVIEW_com.example.app");

	// plain scripts run in the page, mobile: ones still reach the server
	let execute = format!("{prefix}/execute/sync");
	let title = session
		.execute_local(Method::Post, &execute, Some(json!({"script": "return document.title", "args": []})))
		.await
		.unwrap();
	assert_eq!(title, json!("Example Domain"));
	assert!(calls.contains(&format!("webview {execute}")));
	session
		.execute_local(Method::Post, &execute, Some(json!({"script": "mobile: backdoor"})))
		.await
		.unwrap();
	assert!(calls.contains("command POST /appium/execute_mobile/backdoor"));

	session.delete_session(&id).await.unwrap();
	assert!(calls.contains("webview_stop"));
}

#[tokio::test]
async fn auto_webview_gives_up_after_its_timeout() {
	let calls = Arc::new(Calls::default());
	let mut session = webview_orchestrator(&calls, u32::MAX);

	let err = session
		.create(installed_app(json!({
			"appium:autoWebview": true,
			"appium:autoWebviewTimeout": 1000,
		})))
		.await
		.unwrap_err();

	assert!(matches!(err, SessionError::SessionNotCreated { .. }));
	assert!(matches!(err.root(), SessionError::Runtime(Error::Webview(_))), "{err:?}");
	assert_eq!(calls.count("webview_attach"), 2);
	assert!(!calls.contains("server_delete_session"));
	assert!(calls.contains("stop_logcat"));
	assert!(calls.contains("remove_port_forward"));
	assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn native_context_forwards_to_native_while_the_engine_stays_attached() {
	let calls = Arc::new(Calls::default());
	let mut session = webview_orchestrator(&calls, 0);
	let (id, _) = session
		.create(installed_app(json!({"appium:autoWebview": true})))
		.await
		.unwrap();
	let prefix = format!("/session/{id}");
	let context = format!("{prefix}/context");

	session
		.execute_local(Method::Post, &context, Some(json!({"name": "NATIVE_APP"})))
		.await
		.unwrap();
	assert_eq!(session.get_current_context().await.unwrap(), "NATIVE_APP");
	assert!(session.context().unwrap().webview.is_some());
	assert_eq!(session.route(Method::Post, &format!("{prefix}/element")), RouteTarget::ForwardToNative);
	// the web view table keeps applying while an engine is attached
	assert_eq!(session.route(Method::Get, &context), RouteTarget::Local);

	// switching back reuses the attached engine
	session
		.execute_local(Method::Post, &context, Some(json!({"name": "WEBVIEW_com.example.app"})))
		.await
		.unwrap();
	assert_eq!(calls.count("webview_attach"), 1);
	assert_eq!(
		session.route(Method::Post, &format!("{prefix}/element")),
		RouteTarget::ForwardToSecondary
	);

	session.delete_session(&id).await.unwrap();
}
