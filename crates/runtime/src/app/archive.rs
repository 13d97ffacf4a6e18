//! Unpacking of app containers.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Environment variable that makes extraction prefer the platform `unzip` tool.
pub const PREFER_SYSTEM_UNZIP_ENV: &str = "SPRESSO_PREFER_SYSTEM_UNZIP";

/// Interprets the value of [`PREFER_SYSTEM_UNZIP_ENV`].
///
/// Absent, empty, `0` and `false` (any case) disable the preference.
pub fn prefer_system_unzip(value: Option<&str>) -> bool {
	match value.map(str::trim) {
		None | Some("") => false,
		Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false"),
	}
}

/// Reads [`PREFER_SYSTEM_UNZIP_ENV`] from the process environment.
pub fn prefer_system_unzip_from_env() -> bool {
	prefer_system_unzip(std::env::var(PREFER_SYSTEM_UNZIP_ENV).ok().as_deref())
}

/// Extracts `archive` into a fresh temporary directory.
pub async fn extract_to_temp(archive: &Path, use_system_unzip: bool) -> Result<TempDir> {
	let dir = tempfile::Builder::new().prefix("spresso-app-").tempdir()?;

	if use_system_unzip {
		match which::which("unzip") {
			Ok(unzip) => {
				let output = Command::new(&unzip)
					.arg("-q")
					.arg("-o")
					.arg(archive)
					.arg("-d")
					.arg(dir.path())
					.output()
					.await?;
				if output.status.success() {
					return Ok(dir);
				}
				warn!(
					target = "spresso.app",
					archive = %archive.display(),
					stderr = %String::from_utf8_lossy(&output.stderr).trim(),
					"system unzip failed; falling back to bundled extractor"
				);
			}
			Err(_) => {
				debug!(target = "spresso.app", "unzip not on PATH; using bundled extractor");
			}
		}
	}

	let archive = archive.to_path_buf();
	let target = dir.path().to_path_buf();
	tokio::task::spawn_blocking(move || -> Result<()> {
		let file = std::fs::File::open(&archive)?;
		let mut zip = zip::ZipArchive::new(file)?;
		zip.extract(&target)?;
		Ok(())
	})
	.await
	.map_err(|e| Error::Io(std::io::Error::other(e)))??;

	Ok(dir)
}

/// Finds installable packages under `root`, shallowest first.
///
/// Ties on depth are broken by path so the choice is deterministic.
pub fn find_packages(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
	let mut found: Vec<(usize, PathBuf)> = WalkDir::new(root)
		.into_iter()
		.filter_map(|entry| entry.ok())
		.filter(|entry| entry.file_type().is_file())
		.filter(|entry| has_extension(entry.path(), extensions))
		.map(|entry| {
			let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
			(relative.components().count(), entry.into_path())
		})
		.collect();
	found.sort();
	found.into_iter().map(|(_, path)| path).collect()
}

/// Case-insensitive extension check; `extensions` include the leading dot.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
	let lower = path.to_string_lossy().to_lowercase();
	extensions.iter().any(|ext| lower.ends_with(ext))
}
