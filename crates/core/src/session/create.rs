//! Session startup.

use std::path::PathBuf;
use std::time::Duration;

use spresso_protocol::{Capabilities, LaunchInfo, SessionOptions};
use spresso_runtime::{
	AppResolver, DEVICE_PORT, DeviceControl, KeystoreConfig, ResolveRequest, SETTINGS_HELPER_PKG_ID,
	ServerConfig, TEST_APK_PKG, TestServer, find_system_port,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::caps;
use super::{SessionContext, SessionOrchestrator, SessionState};
use crate::commands::AndroidCommands;
use crate::error::{Result, SessionError};

/// Hidden API policy settings exist from Android P (API 28) on.
pub(super) const HIDDEN_API_POLICY_MIN_API: u32 = 28;

const AUTO_WEBVIEW_RETRY_INTERVAL: Duration = Duration::from_millis(500);

impl SessionOrchestrator {
	/// Starts a session for `caps` and returns its id and final capabilities.
	///
	/// Any failure tears the partially built session down before it is
	/// returned as [`SessionError::SessionNotCreated`].
	pub async fn create(&mut self, caps: Capabilities) -> Result<(String, Capabilities)> {
		if self.state != SessionState::Idle || self.session.is_some() {
			return Err(SessionError::not_created(
				"A session is already running. Delete it before starting a new one",
			));
		}

		let session_id = Uuid::new_v4().to_string();
		info!(target = "spresso.session", session_id = %session_id, "creating session");
		self.state = SessionState::Creating;
		self.session = Some(SessionContext::new(session_id.clone(), caps));

		match self.start_session().await {
			Ok(()) => {
				self.state = SessionState::Active;
				let caps = self.session()?.caps.clone();
				info!(target = "spresso.session", session_id = %session_id, "session started");
				Ok((session_id, caps))
			}
			Err(err) => {
				error!(target = "spresso.session", session_id = %session_id, error = %err, "session startup failed");
				self.delete().await;
				Err(err.into_session_not_created())
			}
		}
	}

	async fn start_session(&mut self) -> Result<()> {
		let collaborators = self.collaborators.clone();

		self.prepare_options()?;

		if self.session()?.opts.system_port.is_none() {
			let port = find_system_port().await?;
			self.session_mut()?.opts.system_port = Some(port);
		}
		let ctx = self.session_mut()?;
		ctx.system_port = ctx.opts.system_port;

		let opts = self.session()?.opts.clone();
		let target = collaborators.connector.resolve(&opts).await?;
		{
			let ctx = self.session_mut()?;
			ctx.opts.udid = Some(target.udid.clone());
			ctx.opts.emulator_port = target.emulator_port;
			ctx.booted_avd = target.booted_avd.clone();
		}
		let device = collaborators
			.connector
			.connect(&target, &self.session()?.opts)
			.await?;
		self.session_mut()?.device = Some(device.clone());

		self.configure_app(&collaborators.resolver, &*device).await?;
		let app_info = self.bootstrap_device(&*device).await?;

		{
			let ctx = self.session_mut()?;
			ctx.caps.set("deviceName", device.device_id());
			ctx.caps.set("deviceUDID", ctx.opts.udid.clone().unwrap_or_default());
		}

		let config = server_config(&self.session()?.opts);
		let server = collaborators.servers.create(config, device.clone());
		self.session_mut()?.server = Some(server.clone());

		let system_port = self.session()?.system_port.unwrap_or_default();
		debug!(target = "spresso.session", system_port, device_port = DEVICE_PORT, "forwarding server port");
		device.forward_port(system_port, DEVICE_PORT).await?;

		if self.session()?.opts.skip_unlock {
			debug!(target = "spresso.session", "'skipUnlock' capability set, so skipping device unlock");
		} else {
			device.unlock().await?;
		}

		self.init_aut(&*device, &*server).await?;
		self.finalize_launch_caps(&app_info)?;

		server.start_session(&self.session()?.caps).await?;

		let ctx = self.session()?;
		if ctx.opts.auto_launch() {
			let package = caps::string_value(&ctx.caps, "appWaitPackage");
			let activity = caps::string_value(&ctx.caps, "appWaitActivity");
			let (Some(package), Some(activity)) = (package, activity) else {
				return Err(SessionError::CapabilityValidation(
					"appWaitPackage and appWaitActivity could not be determined".to_string(),
				));
			};
			device
				.wait_for_activity(&package, &activity, ctx.opts.app_wait_duration_ms())
				.await?;
		} else {
			info!(
				target = "spresso.session",
				"Not waiting for the application activity to start because 'autoLaunch' is disabled"
			);
		}

		if self.session()?.opts.auto_webview {
			self.init_webview().await?;
		}

		self.session_mut()?.proxy_active = true;

		self.add_device_info_to_caps().await
	}

	/// Normalizes capabilities into options and applies defaults.
	fn prepare_options(&mut self) -> Result<()> {
		let default_context = self.default_context_name();
		let ctx = self.session_mut()?;
		let mut opts = SessionOptions::from_capabilities(&ctx.caps)
			.map_err(|e| SessionError::CapabilityValidation(format!("Invalid capabilities: {e}")))?;
		caps::reject_browser_session(&opts)?;

		ctx.caps = caps::with_server_details(&ctx.caps);
		ctx.current_context = default_context.to_string();

		opts.apply_defaults();
		if opts.reboot {
			caps::set_avd_from_capabilities(&mut opts)?;
			caps::add_wipe_data_to_avd_args(&mut opts.avd_args);
		}
		ctx.opts = opts;
		Ok(())
	}

	/// Resolves `app` into an installable package, or checks the installed package.
	async fn configure_app(&mut self, resolver: &AppResolver, device: &dyn DeviceControl) -> Result<()> {
		let opts = &self.session()?.opts;
		let (app, app_package, no_sign) = (opts.app.clone(), opts.app_package.clone(), opts.no_sign);
		let app_on_device = caps::app_on_device(opts);

		if let Some(app) = app {
			let request = ResolveRequest {
				app: &app,
				app_package: app_package.as_deref(),
				no_sign,
			};
			let resolved = resolver.resolve(request, device).await?;
			debug!(
				target = "spresso.session",
				path = %resolved.path.display(),
				from_cache = resolved.from_cache,
				"app resolved"
			);
			self.session_mut()?.opts.app = Some(resolved.path.display().to_string());
		} else if app_on_device {
			let package = app_package.unwrap_or_default();
			info!(
				target = "spresso.session",
				package = %package,
				"App file was not listed, running the installed package directly on the device"
			);
			self.session_mut()?.app_on_device = true;
			if !device.is_app_installed(&package).await? {
				return Err(SessionError::not_created(format!(
					"Could not find the package '{package}' installed on the device"
				)));
			}
		}
		Ok(())
	}

	/// Hidden API policy, launch info, device init and animations.
	async fn bootstrap_device(&mut self, device: &dyn DeviceControl) -> Result<LaunchInfo> {
		let api_level = device.api_level().await?;
		self.session_mut()?.api_level = Some(api_level);
		if api_level >= HIDDEN_API_POLICY_MIN_API {
			warn!(target = "spresso.session", api_level, "Relaxing hidden api policy");
			let ignore = self.session()?.opts.ignore_hidden_api_policy_error;
			device.set_hidden_api_policy("1", ignore).await?;
		}

		let launch_info = device.launch_info(&self.session()?.opts).await?;
		let app_info = {
			let opts = &mut self.session_mut()?.opts;
			match launch_info {
				Some(info) => {
					merge_launch_info(opts, &info);
					info
				}
				None => LaunchInfo {
					app_package: opts.app_package.clone(),
					app_activity: opts.app_activity.clone(),
					app_wait_package: opts.app_wait_package.clone(),
					app_wait_activity: opts.app_wait_activity.clone(),
				},
			}
		};

		let outcome = device.init_device(&self.session()?.opts).await?;
		self.session_mut()?.default_ime = outcome.default_ime;

		if device.is_animation_on().await? {
			match device.set_animation_state(false).await {
				Ok(()) => self.session_mut()?.animations_disabled = true,
				Err(err) => warn!(target = "spresso.session", error = %err, "Unable to turn off animations"),
			}
		}
		Ok(app_info)
	}

	/// Cleans other packages, installs the app under test and the server.
	async fn init_aut(&mut self, device: &dyn DeviceControl, server: &dyn TestServer) -> Result<()> {
		let opts = self.session()?.opts.clone();

		if let Some(list) = &opts.uninstall_other_packages {
			for package in list.packages() {
				if package == SETTINGS_HELPER_PKG_ID || package == TEST_APK_PKG {
					continue;
				}
				debug!(target = "spresso.session", package = %package, "uninstalling other package");
				device.uninstall_apk(&package).await?;
			}
		}

		match &opts.app {
			None => {
				if opts.full_reset() {
					return Err(SessionError::CapabilityValidation(
						"Full reset requires an app capability, use fastReset if app is not provided".to_string(),
					));
				}
				debug!(target = "spresso.session", "No app capability. Assuming it is already on the device");
				if opts.fast_reset {
					let package = opts.app_package.as_deref().ok_or_else(|| {
						SessionError::CapabilityValidation("'appPackage' option is required for fastReset".to_string())
					})?;
					device.reset_app(package).await?;
				}
			}
			Some(app) => {
				match opts.app_package.as_deref() {
					Some(package) if !opts.skip_uninstall => {
						device.uninstall_apk(package).await?;
					}
					_ => {}
				}
				device
					.install_apk(&PathBuf::from(app), opts.install_timeout_ms())
					.await?;
			}
		}

		if opts.skip_server_installation {
			debug!(target = "spresso.session", "skipServerInstallation capability is set. Not installing the server");
			return Ok(());
		}
		server.install_test_apk().await?;
		if let Err(err) = device
			.add_to_device_idle_whitelist(&[SETTINGS_HELPER_PKG_ID, TEST_APK_PKG])
			.await
		{
			warn!(target = "spresso.session", error = %err, "Cannot add server packages to the Doze whitelist");
		}
		Ok(())
	}

	/// Writes the final package/activity names into the capabilities.
	fn finalize_launch_caps(&mut self, app_info: &LaunchInfo) -> Result<()> {
		let target = &mut self.session_mut()?.caps;

		if caps::string_value(target, "appPackage").is_none() {
			if let Some(package) = &app_info.app_package {
				target.set("appPackage", package.clone());
			}
		}
		let app_package = caps::string_value(target, "appPackage");

		if caps::string_value(target, "appWaitPackage").is_none() {
			if let Some(package) = app_info
				.app_wait_package
				.clone()
				.or_else(|| app_info.app_package.clone())
				.or_else(|| app_package.clone())
			{
				target.set("appWaitPackage", package);
			}
		}
		let app_wait_package = caps::string_value(target, "appWaitPackage");

		let activity = caps::string_value(target, "appActivity").or_else(|| app_info.app_activity.clone());
		if let Some(activity) = activity {
			target.set(
				"appActivity",
				caps::qualify_activity_name(&activity, app_package.as_deref()),
			);
		}
		let app_activity = caps::string_value(target, "appActivity");

		let wait_activity = caps::string_value(target, "appWaitActivity")
			.or_else(|| app_info.app_wait_activity.clone())
			.or_else(|| app_info.app_activity.clone())
			.or(app_activity);
		if let Some(activity) = wait_activity {
			target.set(
				"appWaitActivity",
				caps::qualify_activity_name(&activity, app_wait_package.as_deref()),
			);
		}
		Ok(())
	}

	/// Switches to the default web view, retrying until the timeout.
	async fn init_webview(&mut self) -> Result<()> {
		let name = self.default_webview_name()?;
		let timeout_ms = self.session()?.opts.auto_webview_timeout_ms();
		let attempts = (timeout_ms / AUTO_WEBVIEW_RETRY_INTERVAL.as_millis() as u64).max(1);
		info!(target = "spresso.session", context = %name, timeout_ms, "Setting webview context");

		let mut attempt = 1;
		loop {
			match self.set_context(&name).await {
				Ok(()) => return Ok(()),
				Err(err) if attempt >= attempts => return Err(err),
				Err(err) => debug!(target = "spresso.session", attempt, error = %err, "web view not ready"),
			}
			attempt += 1;
			tokio::time::sleep(AUTO_WEBVIEW_RETRY_INTERVAL).await;
		}
	}

	async fn add_device_info_to_caps(&mut self) -> Result<()> {
		let info = self.mobile_get_device_info().await?;
		let caps = &mut self.session_mut()?.caps;
		if let Ok(level) = info.api_version.trim().parse::<u32>() {
			caps.set("deviceApiLevel", level);
		}
		caps.set("platformVersion", info.platform_version);
		caps.set("deviceScreenSize", info.real_display_size);
		caps.set("deviceScreenDensity", info.display_density);
		caps.set("deviceModel", info.model);
		caps.set("deviceManufacturer", info.manufacturer);
		Ok(())
	}
}

fn merge_launch_info(opts: &mut SessionOptions, info: &LaunchInfo) {
	let fields = [
		(&mut opts.app_package, &info.app_package),
		(&mut opts.app_activity, &info.app_activity),
		(&mut opts.app_wait_package, &info.app_wait_package),
		(&mut opts.app_wait_activity, &info.app_wait_activity),
	];
	for (target, value) in fields {
		if value.is_some() {
			target.clone_from(value);
		}
	}
}

fn server_config(opts: &SessionOptions) -> ServerConfig {
	let keystore = opts
		.use_keystore
		.then(|| opts.keystore_path.as_ref())
		.flatten()
		.map(|path| KeystoreConfig {
			path: PathBuf::from(path),
			password: opts.keystore_password.clone(),
			alias: opts.key_alias.clone(),
			key_password: opts.key_password.clone(),
		});
	ServerConfig {
		host: opts.server_host().to_string(),
		system_port: opts.system_port.unwrap_or_default(),
		device_port: DEVICE_PORT,
		apk: opts.app.as_ref().map(PathBuf::from),
		tmp_dir: opts.tmp_dir.as_ref().map(PathBuf::from),
		app_package: opts.app_package.clone(),
		app_activity: opts.app_activity.clone(),
		force_rebuild: opts.force_espresso_rebuild,
		build_config: opts.espresso_build_config.clone(),
		show_gradle_log: opts.show_gradle_log,
		launch_timeout_ms: opts.server_launch_timeout_ms(),
		install_timeout_ms: opts.install_timeout_ms(),
		skip_server_installation: opts.skip_server_installation,
		keystore,
		disable_suppress_accessibility_service: opts.disable_suppress_accessibility_service,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn launch_info_only_overrides_known_fields() {
		let mut opts: SessionOptions =
			serde_json::from_value(json!({"appPackage": "com.given", "appWaitActivity": ".Wait"})).unwrap();
		merge_launch_info(
			&mut opts,
			&LaunchInfo {
				app_package: None,
				app_activity: Some("com.manifest.Main".into()),
				app_wait_package: None,
				app_wait_activity: None,
			},
		);
		assert_eq!(opts.app_package.as_deref(), Some("com.given"));
		assert_eq!(opts.app_activity.as_deref(), Some("com.manifest.Main"));
		assert_eq!(opts.app_wait_activity.as_deref(), Some(".Wait"));
	}

	#[test]
	fn server_host_and_keystore_follow_options() {
		let opts: SessionOptions = serde_json::from_value(json!({
			"remoteAdbHost": "10.0.0.2",
			"host": "ignored",
			"systemPort": 8301,
			"useKeystore": true,
			"keystorePath": "/keys/release.jks",
			"keyAlias": "release",
		}))
		.unwrap();
		let config = server_config(&opts);
		assert_eq!(config.base_url(), "http://10.0.0.2:8301");
		let keystore = config.keystore.unwrap();
		assert_eq!(keystore.path, PathBuf::from("/keys/release.jks"));
		assert_eq!(keystore.alias.as_deref(), Some("release"));

		let opts: SessionOptions = serde_json::from_value(json!({"keystorePath": "/k.jks"})).unwrap();
		assert!(server_config(&opts).keystore.is_none());
		assert_eq!(server_config(&opts).host, "127.0.0.1");
	}
}
