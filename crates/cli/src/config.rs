//! Server settings: config file merged with command-line flags.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spresso_protocol::Capabilities;

use crate::cli::Cli;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4723;

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub server_apk: Option<PathBuf>,
	pub adb: Option<PathBuf>,
	/// Android SDK root, used before `ANDROID_HOME`/`ANDROID_SDK_ROOT`.
	pub android_home: Option<PathBuf>,
	/// Applied under every new session's capabilities.
	pub default_capabilities: Map<String, Value>,
}

impl Config {
	/// `$XDG_CONFIG_HOME/spresso/config.json`.
	pub fn default_path() -> Option<PathBuf> {
		dirs::config_dir().map(|dir| dir.join("spresso").join("config.json"))
	}

	/// Loads `explicit`, or the default path when it exists.
	///
	/// A missing default file yields an empty config; a missing explicit
	/// file is an error.
	pub fn load(explicit: Option<&Path>) -> Result<Self> {
		let path = match explicit {
			Some(path) => path.to_path_buf(),
			None => match Self::default_path() {
				Some(path) if path.is_file() => path,
				_ => return Ok(Self::default()),
			},
		};
		let content =
			fs::read_to_string(&path).with_context(|| format!("Failed to read config {}", path.display()))?;
		serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
	}
}

/// Effective settings after flags override the config file.
#[derive(Debug, Clone)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub server_apk: PathBuf,
	pub adb: Option<PathBuf>,
	pub android_home: Option<PathBuf>,
	pub default_capabilities: Capabilities,
}

impl Settings {
	pub fn resolve(cli: &Cli, config: Config) -> Result<Self> {
		let Some(server_apk) = cli.server_apk.clone().or(config.server_apk) else {
			bail!("No Espresso server APK configured; pass --server-apk or set serverApk in the config file");
		};
		Ok(Self {
			host: cli
				.host
				.clone()
				.or(config.host)
				.unwrap_or_else(|| DEFAULT_HOST.to_string()),
			port: cli.port.or(config.port).unwrap_or(DEFAULT_PORT),
			server_apk,
			adb: cli.adb.clone().or(config.adb),
			android_home: config.android_home,
			default_capabilities: Capabilities::from_map(config.default_capabilities),
		})
	}
}
