//! Android SDK tool lookup.
//!
//! Tools are located in the following order:
//! 1. `ANDROID_HOME` / `ANDROID_SDK_ROOT` subdirectories (newest build-tools first)
//! 2. `PATH`

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variables naming the SDK root, in priority order.
pub const SDK_ROOT_ENV: &[&str] = &["ANDROID_HOME", "ANDROID_SDK_ROOT"];

/// Host tools used by the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
	Adb,
	Emulator,
	Apksigner,
	Aapt,
	Bundletool,
}

impl Tool {
	pub fn binary_name(self) -> &'static str {
		match self {
			Tool::Adb => "adb",
			Tool::Emulator => "emulator",
			Tool::Apksigner => "apksigner",
			Tool::Aapt => "aapt",
			Tool::Bundletool => "bundletool",
		}
	}

	/// SDK subdirectories searched for this tool.
	fn sdk_dirs(self, root: &Path) -> Vec<PathBuf> {
		match self {
			Tool::Adb => vec![root.join("platform-tools")],
			Tool::Emulator => vec![root.join("emulator"), root.join("tools")],
			Tool::Apksigner | Tool::Aapt => build_tools_dirs(root),
			Tool::Bundletool => vec![root.join("cmdline-tools").join("latest").join("bin")],
		}
	}
}

/// Located SDK root, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sdk {
	root: Option<PathBuf>,
}

impl Sdk {
	/// Reads the SDK root from the environment.
	pub fn from_env() -> Self {
		let root = SDK_ROOT_ENV
			.iter()
			.filter_map(|name| std::env::var_os(name))
			.map(PathBuf::from)
			.find(|path| path.is_dir());
		Self { root }
	}

	pub fn with_root(root: impl Into<PathBuf>) -> Self {
		Self {
			root: Some(root.into()),
		}
	}

	pub fn root(&self) -> Option<&Path> {
		self.root.as_deref()
	}

	/// Returns the path of `tool`.
	///
	/// # Errors
	///
	/// Returns [`Error::ToolNotFound`] when neither the SDK nor `PATH` has it.
	pub fn locate(&self, tool: Tool) -> Result<PathBuf> {
		if let Some(path) = self.locate_in_sdk(tool) {
			debug!(target = "spresso.sdk", tool = tool.binary_name(), path = %path.display(), "found tool in sdk");
			return Ok(path);
		}

		which::which(tool.binary_name()).map_err(|_| Error::ToolNotFound(tool.binary_name().to_string()))
	}

	fn locate_in_sdk(&self, tool: Tool) -> Option<PathBuf> {
		let root = self.root.as_deref()?;
		tool.sdk_dirs(root)
			.into_iter()
			.flat_map(|dir| executable_candidates(&dir, tool.binary_name()))
			.find(|candidate| candidate.is_file())
	}
}

fn executable_candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
	if cfg!(windows) {
		vec![
			dir.join(format!("{name}.exe")),
			dir.join(format!("{name}.bat")),
		]
	} else {
		vec![dir.join(name)]
	}
}

/// `build-tools/<version>` directories, newest version first.
fn build_tools_dirs(root: &Path) -> Vec<PathBuf> {
	let Ok(entries) = std::fs::read_dir(root.join("build-tools")) else {
		return Vec::new();
	};
	let mut dirs: Vec<PathBuf> = entries
		.filter_map(|entry| entry.ok())
		.map(|entry| entry.path())
		.filter(|path| path.is_dir())
		.collect();
	dirs.sort_by_cached_key(|path| std::cmp::Reverse(version_key(path)));
	dirs
}

fn version_key(path: &Path) -> Vec<u32> {
	path.file_name()
		.and_then(|name| name.to_str())
		.unwrap_or_default()
		.split(['.', '-'])
		.map(|part| part.parse().unwrap_or(0))
		.collect()
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::TempDir;

	use super::*;

	fn touch(path: &Path) {
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, "#!/bin/sh\n").unwrap();
	}

	#[cfg(unix)]
	#[test]
	fn picks_newest_build_tools() {
		let temp = TempDir::new().unwrap();
		touch(&temp.path().join("build-tools/9.0.0/apksigner"));
		touch(&temp.path().join("build-tools/30.0.3/apksigner"));
		touch(&temp.path().join("build-tools/28.0.1/apksigner"));

		let sdk = Sdk::with_root(temp.path());
		let found = sdk.locate(Tool::Apksigner).unwrap();
		assert_eq!(found, temp.path().join("build-tools/30.0.3/apksigner"));
	}

	#[cfg(unix)]
	#[test]
	fn adb_comes_from_platform_tools() {
		let temp = TempDir::new().unwrap();
		touch(&temp.path().join("platform-tools/adb"));

		let sdk = Sdk::with_root(temp.path());
		assert_eq!(
			sdk.locate(Tool::Adb).unwrap(),
			temp.path().join("platform-tools/adb")
		);
	}

	#[test]
	fn missing_build_tools_dir_is_empty() {
		let temp = TempDir::new().unwrap();
		assert!(build_tools_dirs(temp.path()).is_empty());
		assert!(Sdk::with_root(temp.path()).locate_in_sdk(Tool::Aapt).is_none());
	}

	#[test]
	fn version_key_orders_numerically() {
		assert!(version_key(Path::new("30.0.3")) > version_key(Path::new("9.0.0")));
		assert!(version_key(Path::new("34.0.0-rc1")) > version_key(Path::new("33.0.2")));
	}
}
