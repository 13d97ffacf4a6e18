//! Device selection and emulator boot.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use spresso_protocol::SessionOptions;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Adb, AdbServer, ConnectedDevice, DEFAULT_ADB_EXEC_TIMEOUT_MS, Sdk, Tool, exec_tool};
use crate::device::{DeviceConnector, DeviceControl, DeviceTarget};
use crate::error::{Error, Result};
use crate::server::KeystoreConfig;

/// How long a freshly launched emulator may take to show up and boot.
pub const AVD_LAUNCH_TIMEOUT_MS: u64 = 120_000;

/// How long `emu kill` may take until the device disappears.
pub const AVD_KILL_TIMEOUT_MS: u64 = 60_000;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// [`DeviceConnector`] using the adb server and the SDK emulator.
#[derive(Debug, Clone, Default)]
pub struct AdbConnector {
	sdk: Sdk,
	/// Explicit adb binary; located through the SDK when unset.
	adb: Option<PathBuf>,
}

impl AdbConnector {
	pub fn new(sdk: Sdk, adb: Option<PathBuf>) -> Self {
		Self { sdk, adb }
	}

	fn server(&self, opts: &SessionOptions) -> Result<AdbServer> {
		let executable = match &self.adb {
			Some(path) => path.clone(),
			None => self.sdk.locate(Tool::Adb)?,
		};
		Ok(AdbServer {
			executable,
			host: opts.remote_adb_host.clone(),
			port: opts.adb_port(),
		})
	}

	async fn online_devices(&self, server: &AdbServer) -> Result<Vec<ConnectedDevice>> {
		Ok(server
			.devices()
			.await?
			.into_iter()
			.filter(ConnectedDevice::is_online)
			.collect())
	}

	async fn running_avd(&self, server: &AdbServer, avd: &str) -> Result<Option<ConnectedDevice>> {
		for device in self.online_devices(server).await? {
			if device.emulator_port().is_none() {
				continue;
			}
			let args = server.command(Some(&device.udid), &["emu", "avd", "name"]);
			let Ok(output) = exec_tool(&server.executable, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS).await else {
				continue;
			};
			if output.lines().next().map(str::trim) == Some(avd) {
				return Ok(Some(device));
			}
		}
		Ok(None)
	}

	async fn launch_avd(&self, server: &AdbServer, avd: &str, opts: &SessionOptions) -> Result<ConnectedDevice> {
		let emulator = self.sdk.locate(Tool::Emulator)?;
		let mut args = vec!["-avd".to_string(), avd.to_string()];
		if let Some(port) = opts.emulator_port {
			args.push("-port".to_string());
			args.push(port.to_string());
		}
		if let Some(extra) = opts.avd_args.as_deref() {
			args.extend(extra.split_whitespace().map(str::to_string));
		}
		info!(target = "spresso.adb", avd, args = %args.join(" "), "launching emulator");
		Command::new(&emulator)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn()?;

		let deadline = Instant::now() + Duration::from_millis(AVD_LAUNCH_TIMEOUT_MS);
		let device = loop {
			if let Some(device) = self.running_avd(server, avd).await? {
				break device;
			}
			if Instant::now() >= deadline {
				return Err(Error::DeviceUnavailable(format!(
					"emulator '{avd}' was not detected within {AVD_LAUNCH_TIMEOUT_MS}ms"
				)));
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		};

		let boot_args = server.command(Some(&device.udid), &["shell", "getprop", "sys.boot_completed"]);
		loop {
			let booted = exec_tool(&server.executable, &boot_args, DEFAULT_ADB_EXEC_TIMEOUT_MS)
				.await
				.map(|out| out.trim() == "1")
				.unwrap_or(false);
			if booted {
				info!(target = "spresso.adb", avd, udid = %device.udid, "emulator booted");
				return Ok(device);
			}
			if Instant::now() >= deadline {
				return Err(Error::DeviceUnavailable(format!(
					"emulator '{avd}' did not finish booting within {AVD_LAUNCH_TIMEOUT_MS}ms"
				)));
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	async fn matches_platform_version(&self, server: &AdbServer, udid: &str, version: &str) -> bool {
		let args = server.command(Some(udid), &["shell", "getprop", "ro.build.version.release"]);
		exec_tool(&server.executable, &args, DEFAULT_ADB_EXEC_TIMEOUT_MS)
			.await
			.map(|release| release.trim().starts_with(version))
			.unwrap_or(false)
	}
}

#[async_trait]
impl DeviceConnector for AdbConnector {
	async fn resolve(&self, opts: &SessionOptions) -> Result<DeviceTarget> {
		let server = self.server(opts)?;

		if let Some(avd) = opts.avd.as_deref() {
			let avd = avd.trim_start_matches('@');
			if let Some(device) = self.running_avd(&server, avd).await? {
				debug!(target = "spresso.adb", avd, udid = %device.udid, "reusing running emulator");
				return Ok(DeviceTarget {
					emulator_port: device.emulator_port(),
					udid: device.udid,
					booted_avd: None,
				});
			}
			let device = self.launch_avd(&server, avd, opts).await?;
			return Ok(DeviceTarget {
				emulator_port: device.emulator_port(),
				udid: device.udid,
				booted_avd: Some(avd.to_string()),
			});
		}

		let devices = self.online_devices(&server).await?;
		if let Some(udid) = opts.udid.as_deref() {
			return devices
				.into_iter()
				.find(|device| device.udid == udid)
				.map(|device| DeviceTarget {
					emulator_port: device.emulator_port().or(opts.emulator_port),
					udid: device.udid,
					booted_avd: None,
				})
				.ok_or_else(|| Error::DeviceUnavailable(format!("Device {udid} was not in the list of connected devices")));
		}

		for device in devices {
			if let Some(version) = opts.platform_version.as_deref() {
				if !self.matches_platform_version(&server, &device.udid, version).await {
					continue;
				}
			}
			return Ok(DeviceTarget {
				emulator_port: device.emulator_port(),
				udid: device.udid,
				booted_avd: None,
			});
		}
		Err(Error::DeviceUnavailable(
			"Could not find a connected Android device".to_string(),
		))
	}

	async fn connect(&self, target: &DeviceTarget, opts: &SessionOptions) -> Result<Arc<dyn DeviceControl>> {
		let server = self.server(opts)?;
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
		let adb = Adb::new(server, target.udid.clone())
			.with_sdk(self.sdk.clone())
			.with_keystore(keystore);
		Ok(Arc::new(adb))
	}
}
