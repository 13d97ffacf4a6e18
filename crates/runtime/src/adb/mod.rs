//! [`DeviceControl`] backed by the `adb` binary and SDK build tools.

mod connector;
mod parse;
mod sdk;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use parking_lot::Mutex;
use spresso_protocol::{DEFAULT_ADB_PORT, DeviceInfo, LaunchInfo, SessionOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use connector::AdbConnector;
pub use parse::{
	Badging, ConnectedDevice, activity_matches, emulator_port, parse_badging, parse_devices,
	parse_focused_activity, parse_wm_density, parse_wm_size,
};
pub use sdk::{SDK_ROOT_ENV, Sdk, Tool};

use crate::device::{
	DeviceControl, InitOutcome, MAX_RECORDING_TIME_LIMIT_SECS, PackageTools, RecordingOptions, StreamOptions,
};
use crate::error::{Error, Result};
use crate::server::{KeystoreConfig, SETTINGS_HELPER_PKG_ID};

/// Default timeout for short `adb` invocations.
pub const DEFAULT_ADB_EXEC_TIMEOUT_MS: u64 = 20_000;

const ACTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const UNICODE_IME: &str = "io.appium.settings/.UnicodeIME";
const ANIMATION_SETTINGS: &[&str] = &[
	"animator_duration_scale",
	"transition_animation_scale",
	"window_animation_scale",
];
const HIDDEN_API_POLICY_KEYS: &[&str] = &[
	"hidden_api_policy_pre_p_apps",
	"hidden_api_policy_p_apps",
	"hidden_api_policy",
];
/// Hidden API policy settings only exist from Android P on.
const HIDDEN_API_POLICY_MIN_API: u32 = 28;
/// Time `screenrecord` gets to finalize the file after SIGINT.
const RECORDING_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const MEDIA_TRANSFER_TIMEOUT_MS: u64 = 120_000;

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
	pub code: Option<i32>,
	pub stdout: String,
	pub stderr: String,
}

impl CommandOutput {
	pub fn success(&self) -> bool {
		self.code == Some(0)
	}
}

async fn run_raw(program: &Path, args: &[String], timeout_ms: u64) -> Result<std::process::Output> {
	debug!(target = "spresso.adb", program = %program.display(), args = %args.join(" "), "exec");
	let future = Command::new(program)
		.args(args)
		.stdin(Stdio::null())
		.kill_on_drop(true)
		.output();
	Ok(tokio::time::timeout(Duration::from_millis(timeout_ms), future)
		.await
		.map_err(|_| Error::CommandTimeout {
			program: program.display().to_string(),
			timeout_ms,
		})??)
}

/// Runs `program args` and captures its output, killing it after `timeout_ms`.
pub async fn run_tool(program: &Path, args: &[String], timeout_ms: u64) -> Result<CommandOutput> {
	let output = run_raw(program, args, timeout_ms).await?;
	Ok(CommandOutput {
		code: output.status.code(),
		stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
		stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
	})
}

/// Like [`run_tool`] but fails on a non-zero exit.
pub async fn exec_tool(program: &Path, args: &[String], timeout_ms: u64) -> Result<String> {
	let output = run_tool(program, args, timeout_ms).await?;
	if !output.success() {
		return Err(Error::CommandFailed {
			program: program.display().to_string(),
			args: args.join(" "),
			code: output.code,
			stderr: output.stderr.trim().to_string(),
		});
	}
	Ok(output.stdout)
}

/// Connection to the adb server plus the serial of one device.
#[derive(Debug, Clone)]
pub struct AdbServer {
	pub executable: PathBuf,
	pub host: Option<String>,
	pub port: u16,
}

impl AdbServer {
	pub fn new(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: executable.into(),
			host: None,
			port: DEFAULT_ADB_PORT,
		}
	}

	fn base_args(&self) -> Vec<String> {
		let mut args = vec!["-P".to_string(), self.port.to_string()];
		if let Some(host) = &self.host {
			args.push("-H".to_string());
			args.push(host.clone());
		}
		args
	}

	fn command(&self, serial: Option<&str>, args: &[&str]) -> Vec<String> {
		let mut full = self.base_args();
		if let Some(serial) = serial {
			full.push("-s".to_string());
			full.push(serial.to_string());
		}
		full.extend(args.iter().map(|arg| arg.to_string()));
		full
	}

	/// Lists devices known to the adb server.
	pub async fn devices(&self) -> Result<Vec<ConnectedDevice>> {
		let args = self.command(None, &["devices"]);
		let stdout = exec_tool(&self.executable, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS).await?;
		Ok(parse_devices(&stdout))
	}
}

/// A `screenrecord` process and the file it writes on the device.
struct ScreenRecording {
	child: Child,
	remote_path: String,
}

/// A device reachable through adb.
pub struct Adb {
	server: AdbServer,
	udid: String,
	sdk: Sdk,
	keystore: Option<KeystoreConfig>,
	logcat: Mutex<Option<Child>>,
	instrumentation: Mutex<Option<Child>>,
	recording: Mutex<Option<ScreenRecording>>,
	streaming: Mutex<Option<JoinHandle<()>>>,
}

impl Adb {
	pub fn new(server: AdbServer, udid: impl Into<String>) -> Self {
		Self {
			server,
			udid: udid.into(),
			sdk: Sdk::from_env(),
			keystore: None,
			logcat: Mutex::new(None),
			instrumentation: Mutex::new(None),
			recording: Mutex::new(None),
			streaming: Mutex::new(None),
		}
	}

	pub fn with_sdk(mut self, sdk: Sdk) -> Self {
		self.sdk = sdk;
		self
	}

	pub fn with_keystore(mut self, keystore: Option<KeystoreConfig>) -> Self {
		self.keystore = keystore;
		self
	}

	/// Runs `adb -s <udid> args...` and returns stdout.
	pub async fn exec(&self, args: &[&str], timeout_ms: u64) -> Result<String> {
		let full = self.server.command(Some(&self.udid), args);
		exec_tool(&self.server.executable, &full, timeout_ms).await
	}

	async fn run(&self, args: &[&str], timeout_ms: u64) -> Result<CommandOutput> {
		let full = self.server.command(Some(&self.udid), args);
		run_tool(&self.server.executable, &full, timeout_ms).await
	}

	/// Runs `adb -s <udid> exec-out args...` and returns the raw stdout.
	async fn exec_out(&self, args: &[&str], timeout_ms: u64) -> Result<Vec<u8>> {
		let mut full = vec!["exec-out"];
		full.extend_from_slice(args);
		let full = self.server.command(Some(&self.udid), &full);
		let output = run_raw(&self.server.executable, &full, timeout_ms).await?;
		if !output.status.success() {
			return Err(Error::CommandFailed {
				program: self.server.executable.display().to_string(),
				args: full.join(" "),
				code: output.status.code(),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(output.stdout)
	}

	/// Runs `adb shell` with the given arguments.
	pub async fn shell(&self, args: &[&str]) -> Result<String> {
		let mut full = Vec::with_capacity(args.len() + 1);
		full.push("shell");
		full.extend_from_slice(args);
		self.exec(&full, DEFAULT_ADB_EXEC_TIMEOUT_MS).await
	}

	async fn getprop(&self, prop: &str) -> Result<String> {
		Ok(self.shell(&["getprop", prop]).await?.trim().to_string())
	}

	async fn global_setting(&self, key: &str) -> Result<String> {
		Ok(self.shell(&["settings", "get", "global", key]).await?.trim().to_string())
	}

	/// Spawns a long running `adb` child whose stdout is forwarded to the log.
	fn spawn_logged(&self, args: &[&str], source: &'static str) -> Result<Child> {
		let full = self.server.command(Some(&self.udid), args);
		let mut child = Command::new(&self.server.executable)
			.args(&full)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()?;

		if let Some(stdout) = child.stdout.take() {
			let udid = self.udid.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stdout).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					debug!(target = "spresso.device", udid = %udid, source, "{line}");
				}
			});
		}
		Ok(child)
	}

	async fn is_locked(&self) -> Result<bool> {
		let output = self.shell(&["dumpsys", "window"]).await?;
		Ok(["mDreamingLockscreen=true", "mShowingLockscreen=true", "isStatusBarKeyguard=true"]
			.iter()
			.any(|marker| output.contains(marker)))
	}

	fn keystore_args(&self) -> Result<Vec<String>> {
		let keystore = match &self.keystore {
			Some(keystore) => keystore.clone(),
			None => debug_keystore()?,
		};
		let password = keystore.password.unwrap_or_else(|| "android".to_string());
		let mut args = vec![
			"--ks".to_string(),
			keystore.path.display().to_string(),
			"--ks-pass".to_string(),
			format!("pass:{password}"),
		];
		if let Some(alias) = keystore.alias {
			args.push("--ks-key-alias".to_string());
			args.push(alias);
		}
		if let Some(key_password) = keystore.key_password {
			args.push("--key-pass".to_string());
			args.push(format!("pass:{key_password}"));
		}
		Ok(args)
	}
}

/// Keystore created by the Android tooling under `~/.android`.
fn debug_keystore() -> Result<KeystoreConfig> {
	let home = dirs::home_dir().ok_or_else(|| Error::SigningFailed {
		path: PathBuf::from("~/.android/debug.keystore"),
		reason: "cannot determine the home directory".to_string(),
	})?;
	let path = home.join(".android").join("debug.keystore");
	if !path.is_file() {
		return Err(Error::SigningFailed {
			path,
			reason: "debug keystore does not exist; provide keystorePath with useKeystore".to_string(),
		});
	}
	Ok(KeystoreConfig {
		path,
		password: Some("android".to_string()),
		alias: Some("androiddebugkey".to_string()),
		key_password: Some("android".to_string()),
	})
}

#[async_trait]
impl PackageTools for Adb {
	async fn check_apk_cert(&self, apk: &Path, _package: Option<&str>) -> Result<bool> {
		let apksigner = self.sdk.locate(Tool::Apksigner)?;
		let args = vec!["verify".to_string(), apk.display().to_string()];
		let output = run_tool(&apksigner, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS).await?;
		if !output.success() {
			debug!(
				target = "spresso.adb",
				apk = %apk.display(),
				stderr = %output.stderr.trim(),
				"package does not verify"
			);
		}
		Ok(output.success())
	}

	async fn sign(&self, apk: &Path, _package: Option<&str>) -> Result<()> {
		let apksigner = self.sdk.locate(Tool::Apksigner)?;
		let mut args = vec!["sign".to_string()];
		args.extend(self.keystore_args()?);
		args.push(apk.display().to_string());
		exec_tool(&apksigner, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS * 3).await?;
		info!(target = "spresso.adb", apk = %apk.display(), "signed package");
		Ok(())
	}

	async fn extract_universal_apk(&self, aab: &Path) -> Result<PathBuf> {
		let bundletool = self.sdk.locate(Tool::Bundletool)?;
		let stem = aab
			.file_stem()
			.and_then(|stem| stem.to_str())
			.unwrap_or("app")
			.to_string();
		let dir = aab.parent().unwrap_or_else(|| Path::new("."));
		let apks = dir.join(format!("{stem}.apks"));
		let apk = dir.join(format!("{stem}.apk"));

		let mut args = vec![
			"build-apks".to_string(),
			format!("--bundle={}", aab.display()),
			format!("--output={}", apks.display()),
			"--mode=universal".to_string(),
			"--overwrite".to_string(),
		];
		if let Some(keystore) = &self.keystore {
			args.push(format!("--ks={}", keystore.path.display()));
			if let Some(password) = &keystore.password {
				args.push(format!("--ks-pass=pass:{password}"));
			}
			if let Some(alias) = &keystore.alias {
				args.push(format!("--ks-key-alias={alias}"));
			}
			if let Some(key_password) = &keystore.key_password {
				args.push(format!("--key-pass=pass:{key_password}"));
			}
		}
		exec_tool(&bundletool, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS * 9).await?;

		let (apks_path, apk_path) = (apks.clone(), apk.clone());
		tokio::task::spawn_blocking(move || -> Result<()> {
			let file = std::fs::File::open(&apks_path)?;
			let mut archive = zip::ZipArchive::new(file)?;
			let mut entry = archive.by_name("universal.apk")?;
			let mut out = std::fs::File::create(&apk_path)?;
			std::io::copy(&mut entry, &mut out)?;
			Ok(())
		})
		.await
		.map_err(|e| Error::Io(std::io::Error::other(e)))??;
		let _ = tokio::fs::remove_file(&apks).await;

		info!(target = "spresso.adb", aab = %aab.display(), apk = %apk.display(), "extracted universal apk");
		Ok(apk)
	}
}

#[async_trait]
impl DeviceControl for Adb {
	fn device_id(&self) -> &str {
		&self.udid
	}

	async fn api_level(&self) -> Result<u32> {
		let raw = self.getprop("ro.build.version.sdk").await?;
		raw.parse()
			.map_err(|_| Error::DeviceUnavailable(format!("unexpected API level '{raw}' on {}", self.udid)))
	}

	async fn set_hidden_api_policy(&self, value: &str, ignore_error: bool) -> Result<()> {
		if self.api_level().await? < HIDDEN_API_POLICY_MIN_API {
			return Ok(());
		}
		for &key in HIDDEN_API_POLICY_KEYS {
			if let Err(err) = self.shell(&["settings", "put", "global", key, value]).await {
				if !ignore_error {
					return Err(err);
				}
				warn!(target = "spresso.adb", key, error = %err, "failed to set hidden API policy");
			}
		}
		Ok(())
	}

	async fn set_default_hidden_api_policy(&self, ignore_error: bool) -> Result<()> {
		if self.api_level().await? < HIDDEN_API_POLICY_MIN_API {
			return Ok(());
		}
		for &key in HIDDEN_API_POLICY_KEYS {
			if let Err(err) = self.shell(&["settings", "delete", "global", key]).await {
				if !ignore_error {
					return Err(err);
				}
				warn!(target = "spresso.adb", key, error = %err, "failed to reset hidden API policy");
			}
		}
		Ok(())
	}

	async fn launch_info(&self, opts: &SessionOptions) -> Result<Option<LaunchInfo>> {
		if opts.app_package.is_some() && opts.app_activity.is_some() {
			return Ok(None);
		}
		let Some(app) = opts.app.as_deref() else {
			return Ok(None);
		};

		let aapt = self.sdk.locate(Tool::Aapt)?;
		let args = vec!["dump".to_string(), "badging".to_string(), app.to_string()];
		let badging = parse_badging(&exec_tool(&aapt, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS).await?);
		debug!(
			target = "spresso.adb",
			package = ?badging.package,
			activity = ?badging.launchable_activity,
			"parsed launch info"
		);
		Ok(Some(LaunchInfo {
			app_wait_package: badging.package.clone(),
			app_wait_activity: badging.launchable_activity.clone(),
			app_package: badging.package,
			app_activity: badging.launchable_activity,
		}))
	}

	async fn init_device(&self, opts: &SessionOptions) -> Result<InitOutcome> {
		let mut outcome = InitOutcome::default();

		if opts.language.is_some() || opts.locale.is_some() {
			let receiver = format!("{SETTINGS_HELPER_PKG_ID}/.receivers.LocaleSettingReceiver");
			let mut args = vec!["am", "broadcast", "-a", "io.appium.settings.locale", "-n", receiver.as_str()];
			if let Some(language) = opts.language.as_deref() {
				args.extend(["--es", "lang", language]);
			}
			if let Some(locale) = opts.locale.as_deref() {
				args.extend(["--es", "country", locale]);
			}
			self.shell(&args).await?;
		}

		if opts.unicode_keyboard {
			let default_ime = self
				.shell(&["settings", "get", "secure", "default_input_method"])
				.await?
				.trim()
				.to_string();
			self.shell(&["ime", "enable", UNICODE_IME]).await?;
			self.set_ime(UNICODE_IME).await?;
			outcome.default_ime = Some(default_ime).filter(|ime| !ime.is_empty() && ime != "null");
		}

		self.stop_logcat().await?;
		let child = self.spawn_logged(&["logcat", "-v", "threadtime"], "logcat")?;
		*self.logcat.lock() = Some(child);

		Ok(outcome)
	}

	async fn is_animation_on(&self) -> Result<bool> {
		for &key in ANIMATION_SETTINGS {
			let value = self.global_setting(key).await?;
			if value.parse::<f32>().map(|scale| scale != 0.0).unwrap_or(false) {
				return Ok(true);
			}
		}
		Ok(false)
	}

	async fn set_animation_state(&self, enabled: bool) -> Result<()> {
		let scale = if enabled { "1" } else { "0" };
		for &key in ANIMATION_SETTINGS {
			self.shell(&["settings", "put", "global", key, scale]).await?;
		}
		Ok(())
	}

	async fn set_ime(&self, ime: &str) -> Result<()> {
		self.shell(&["ime", "set", ime]).await?;
		Ok(())
	}

	async fn forward_port(&self, system_port: u16, device_port: u16) -> Result<()> {
		let local = format!("tcp:{system_port}");
		let remote = format!("tcp:{device_port}");
		self.exec(&["forward", local.as_str(), remote.as_str()], DEFAULT_ADB_EXEC_TIMEOUT_MS)
			.await?;
		Ok(())
	}

	async fn remove_port_forward(&self, system_port: u16) -> Result<()> {
		let local = format!("tcp:{system_port}");
		self.exec(&["forward", "--remove", local.as_str()], DEFAULT_ADB_EXEC_TIMEOUT_MS)
			.await?;
		Ok(())
	}

	async fn unlock(&self) -> Result<()> {
		if !self.is_locked().await? {
			return Ok(());
		}
		info!(target = "spresso.adb", udid = %self.udid, "unlocking screen");
		self.shell(&["input", "keyevent", "224"]).await?;
		self.shell(&["wm", "dismiss-keyguard"]).await?;
		if self.is_locked().await? {
			warn!(target = "spresso.adb", udid = %self.udid, "screen is still locked");
		}
		Ok(())
	}

	async fn is_app_installed(&self, package: &str) -> Result<bool> {
		let output = self.shell(&["pm", "list", "packages", package]).await?;
		let expected = format!("package:{package}");
		Ok(output.lines().any(|line| line.trim() == expected))
	}

	async fn install_apk(&self, apk: &Path, timeout_ms: u64) -> Result<()> {
		let path = apk.display().to_string();
		let output = self.exec(&["install", "-r", "-g", path.as_str()], timeout_ms).await?;
		if output.contains("Failure") {
			return Err(Error::CommandFailed {
				program: "adb install".to_string(),
				args: path,
				code: Some(0),
				stderr: output.trim().to_string(),
			});
		}
		info!(target = "spresso.adb", apk = %apk.display(), udid = %self.udid, "installed");
		Ok(())
	}

	async fn uninstall_apk(&self, package: &str) -> Result<bool> {
		let output = self
			.run(&["uninstall", package], DEFAULT_ADB_EXEC_TIMEOUT_MS)
			.await?;
		let combined = format!("{}{}", output.stdout, output.stderr);
		if combined.contains("Success") {
			info!(target = "spresso.adb", package, "uninstalled");
			return Ok(true);
		}
		debug!(target = "spresso.adb", package, output = %combined.trim(), "package was not uninstalled");
		Ok(false)
	}

	async fn reset_app(&self, package: &str) -> Result<()> {
		let output = self.shell(&["pm", "clear", package]).await?;
		if !output.contains("Success") {
			return Err(Error::CommandFailed {
				program: "pm clear".to_string(),
				args: package.to_string(),
				code: Some(0),
				stderr: output.trim().to_string(),
			});
		}
		Ok(())
	}

	async fn add_to_device_idle_whitelist(&self, packages: &[&str]) -> Result<()> {
		for package in packages {
			let entry = format!("+{package}");
			self.shell(&["dumpsys", "deviceidle", "whitelist", entry.as_str()]).await?;
		}
		Ok(())
	}

	async fn force_stop(&self, package: &str) -> Result<()> {
		self.shell(&["am", "force-stop", package]).await?;
		Ok(())
	}

	async fn wait_for_activity(&self, package: &str, activity: &str, timeout_ms: u64) -> Result<()> {
		let deadline = Instant::now() + Duration::from_millis(timeout_ms);
		loop {
			match self.focused_activity().await {
				Ok((focused_package, focused_activity))
					if focused_package == package
						&& activity_matches(package, activity, &focused_activity) =>
				{
					debug!(target = "spresso.adb", package, activity = %focused_activity, "activity focused");
					return Ok(());
				}
				Ok(_) => {}
				Err(err) => debug!(target = "spresso.adb", error = %err, "focused activity not available yet"),
			}
			if Instant::now() >= deadline {
				return Err(Error::ActivityWaitTimeout {
					package: package.to_string(),
					activity: activity.to_string(),
					timeout_ms,
				});
			}
			tokio::time::sleep(ACTIVITY_POLL_INTERVAL).await;
		}
	}

	async fn focused_activity(&self) -> Result<(String, String)> {
		let output = self.shell(&["dumpsys", "window", "windows"]).await?;
		parse_focused_activity(&output)
			.ok_or_else(|| Error::DeviceUnavailable(format!("no focused activity on {}", self.udid)))
	}

	async fn start_instrumentation(&self, component: &str, args: &[(String, String)]) -> Result<()> {
		let mut full = vec!["shell", "am", "instrument", "-w"];
		for (key, value) in args {
			full.extend(["-e", key.as_str(), value.as_str()]);
		}
		full.push(component);

		let previous = self.instrumentation.lock().take();
		if let Some(mut previous) = previous {
			let _ = previous.start_kill();
		}
		let child = self.spawn_logged(&full, "instrumentation")?;
		*self.instrumentation.lock() = Some(child);
		info!(target = "spresso.adb", component, udid = %self.udid, "instrumentation started");
		Ok(())
	}

	async fn stop_logcat(&self) -> Result<()> {
		let child = self.logcat.lock().take();
		if let Some(mut child) = child {
			child.start_kill()?;
			let _ = child.wait().await;
		}
		Ok(())
	}

	async fn kill_emulator(&self, avd: &str) -> Result<()> {
		info!(target = "spresso.adb", avd, udid = %self.udid, "killing emulator");
		self.exec(&["emu", "kill"], DEFAULT_ADB_EXEC_TIMEOUT_MS).await?;

		let deadline = Instant::now() + Duration::from_millis(connector::AVD_KILL_TIMEOUT_MS);
		while Instant::now() < deadline {
			let devices = self.server.devices().await?;
			if !devices.iter().any(|device| device.udid == self.udid) {
				return Ok(());
			}
			tokio::time::sleep(ACTIVITY_POLL_INTERVAL).await;
		}
		Err(Error::CommandTimeout {
			program: format!("emu kill ({avd})"),
			timeout_ms: connector::AVD_KILL_TIMEOUT_MS,
		})
	}

	async fn device_info(&self) -> Result<DeviceInfo> {
		Ok(DeviceInfo {
			api_version: self.getprop("ro.build.version.sdk").await?,
			platform_version: self.getprop("ro.build.version.release").await?,
			manufacturer: self.getprop("ro.product.manufacturer").await?,
			model: self.getprop("ro.product.model").await?,
			real_display_size: parse_wm_size(&self.shell(&["wm", "size"]).await?).unwrap_or_default(),
			display_density: parse_wm_density(&self.shell(&["wm", "density"]).await?).unwrap_or_default(),
		})
	}

	async fn screenshot(&self) -> Result<String> {
		let png = self.exec_out(&["screencap", "-p"], DEFAULT_ADB_EXEC_TIMEOUT_MS).await?;
		if png.is_empty() {
			return Err(Error::DeviceUnavailable(format!("empty screenshot from {}", self.udid)));
		}
		Ok(general_purpose::STANDARD.encode(png))
	}

	async fn start_screen_recording(&self, options: &RecordingOptions) -> Result<()> {
		let running = self.recording.lock().is_some();
		if running {
			self.stop_screen_recording().await?;
		}

		let remote_path = format!("/sdcard/spresso-{}.mp4", unix_millis());
		let time_limit = options.time_limit_secs.clamp(1, MAX_RECORDING_TIME_LIMIT_SECS).to_string();
		let bit_rate = options.bit_rate.map(|rate| rate.to_string());
		let mut args = vec!["shell", "screenrecord", "--time-limit", time_limit.as_str()];
		if let Some(bit_rate) = bit_rate.as_deref() {
			args.extend(["--bit-rate", bit_rate]);
		}
		if let Some(size) = options.video_size.as_deref() {
			args.extend(["--size", size]);
		}
		args.push(remote_path.as_str());

		let full = self.server.command(Some(&self.udid), &args);
		let child = Command::new(&self.server.executable)
			.args(&full)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()?;
		*self.recording.lock() = Some(ScreenRecording { child, remote_path });
		info!(target = "spresso.adb", udid = %self.udid, time_limit = %time_limit, "screen recording started");
		Ok(())
	}

	async fn stop_screen_recording(&self) -> Result<Option<String>> {
		let recording = self.recording.lock().take();
		let Some(mut recording) = recording else {
			return Ok(None);
		};
		let output = self.run(&["shell", "pkill", "-2", "screenrecord"], DEFAULT_ADB_EXEC_TIMEOUT_MS).await?;
		debug!(target = "spresso.adb", code = ?output.code, "interrupted screenrecord");
		if tokio::time::timeout(RECORDING_STOP_TIMEOUT, recording.child.wait()).await.is_err() {
			warn!(target = "spresso.adb", udid = %self.udid, "screenrecord did not exit in time");
			let _ = recording.child.start_kill();
		}

		let video = self
			.exec_out(&["cat", recording.remote_path.as_str()], MEDIA_TRANSFER_TIMEOUT_MS)
			.await;
		if let Err(err) = self.shell(&["rm", "-f", recording.remote_path.as_str()]).await {
			warn!(target = "spresso.adb", path = %recording.remote_path, error = %err, "failed to remove recording");
		}
		let video = video?;
		info!(target = "spresso.adb", udid = %self.udid, bytes = video.len(), "screen recording stopped");
		Ok(Some(general_purpose::STANDARD.encode(video)))
	}

	async fn is_media_projection_recording_running(&self) -> Result<bool> {
		let service = format!("{SETTINGS_HELPER_PKG_ID}/.recorder.RecorderService");
		let output = self
			.shell(&["dumpsys", "activity", "services", service.as_str()])
			.await?;
		Ok(output.contains("ServiceRecord"))
	}

	async fn stop_media_projection_recording(&self) -> Result<()> {
		let component = format!("{SETTINGS_HELPER_PKG_ID}/.recorder.RecorderService");
		self.shell(&[
			"am",
			"startservice",
			"-n",
			component.as_str(),
			"-a",
			"io.appium.settings.recording.ACTION_STOP",
		])
		.await?;
		Ok(())
	}

	async fn start_screen_streaming(&self, options: &StreamOptions) -> Result<()> {
		self.stop_screen_streaming().await?;
		let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
		let args = self.server.command(
			Some(&self.udid),
			&["exec-out", "screenrecord", "--output-format=h264", "-"],
		);
		let task = tokio::spawn(serve_screen_stream(listener, self.server.executable.clone(), args));
		*self.streaming.lock() = Some(task);
		info!(target = "spresso.adb", udid = %self.udid, host = %options.host, port = options.port, "screen streaming started");
		Ok(())
	}

	async fn stop_screen_streaming(&self) -> Result<()> {
		let task = self.streaming.lock().take();
		if let Some(task) = task {
			task.abort();
			let _ = task.await;
			info!(target = "spresso.adb", udid = %self.udid, "screen streaming stopped");
		}
		Ok(())
	}
}

impl Drop for Adb {
	fn drop(&mut self) {
		for slot in [&self.logcat, &self.instrumentation] {
			if let Some(mut child) = slot.lock().take() {
				let _ = child.start_kill();
			}
		}
		if let Some(mut recording) = self.recording.lock().take() {
			let _ = recording.child.start_kill();
		}
		if let Some(stream) = self.streaming.lock().take() {
			stream.abort();
		}
	}
}

fn unix_millis() -> u128 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis())
		.unwrap_or_default()
}

/// Pipes `screenrecord`'s H.264 output to one client at a time.
async fn serve_screen_stream(listener: TcpListener, executable: PathBuf, args: Vec<String>) {
	loop {
		let (mut socket, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				warn!(target = "spresso.adb", error = %err, "screen stream listener failed");
				return;
			}
		};
		debug!(target = "spresso.adb", %peer, "screen stream client connected");

		let spawned = Command::new(&executable)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn();
		let mut child = match spawned {
			Ok(child) => child,
			Err(err) => {
				warn!(target = "spresso.adb", error = %err, "failed to start screenrecord for streaming");
				continue;
			}
		};
		if let Some(mut stdout) = child.stdout.take() {
			if let Err(err) = tokio::io::copy(&mut stdout, &mut socket).await {
				debug!(target = "spresso.adb", %peer, error = %err, "screen stream client went away");
			}
		}
		let _ = child.start_kill();
	}
}
