//! Application artifact resolution.
//!
//! Turns the `app` capability (local file, URL, archive or bundle) into one
//! installable `.apk` on the host:
//!
//! - local `.apk` files are used in place and never cached
//! - downloaded files and anything unpacked or converted are cached by content hash
//! - packages are signed unless signing is disabled
//! - downloaded containers and intermediate `.aab` files are removed afterwards

mod archive;
mod cache;

use std::path::{Path, PathBuf};

use tempfile::{TempDir, TempPath};
use tracing::{debug, info};

pub use archive::{
	PREFER_SYSTEM_UNZIP_ENV, extract_to_temp, find_packages, has_extension, prefer_system_unzip,
	prefer_system_unzip_from_env,
};
pub use cache::{AppCache, CacheEntry, ResolutionGuard, hash_file};

use crate::device::PackageTools;
use crate::error::{Error, Result};

pub const APK_EXT: &str = ".apk";
pub const AAB_EXT: &str = ".aab";
pub const SUPPORTED_EXTENSIONS: &[&str] = &[APK_EXT, AAB_EXT];

/// Input of [`AppResolver::resolve`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
	/// Path or `http(s)` URL exactly as the client sent it.
	pub app: &'a str,
	/// Package the signing certificate is checked against.
	pub app_package: Option<&'a str>,
	pub no_sign: bool,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApp {
	/// Package to install.
	pub path: PathBuf,
	/// Served from a previous resolution without touching the package.
	pub from_cache: bool,
	/// Whether `path` is tracked by the cache (false for local in-place `.apk` files).
	pub cached: bool,
}

/// Resolves app references, sharing one [`AppCache`] across sessions.
pub struct AppResolver {
	cache: AppCache,
	http: reqwest::Client,
	prefer_system_unzip: bool,
}

impl Default for AppResolver {
	fn default() -> Self {
		Self::new()
	}
}

impl AppResolver {
	/// Creates a resolver honoring [`PREFER_SYSTEM_UNZIP_ENV`].
	pub fn new() -> Self {
		Self::with_unzip_preference(prefer_system_unzip_from_env())
	}

	pub fn with_unzip_preference(prefer_system_unzip: bool) -> Self {
		Self {
			cache: AppCache::new(),
			http: reqwest::Client::new(),
			prefer_system_unzip,
		}
	}

	pub fn cache(&self) -> &AppCache {
		&self.cache
	}

	/// Resolves `request.app` into an installable package path.
	///
	/// # Errors
	///
	/// - [`Error::NoSupportedPackageFound`] when an archive holds no `.apk`/`.aab`
	/// - [`Error::SigningFailed`] when the package cannot be verified or signed
	/// - [`Error::InvalidApp`] / [`Error::Download`] when the reference is unusable
	pub async fn resolve<T>(&self, request: ResolveRequest<'_>, tools: &T) -> Result<ResolvedApp>
	where
		T: PackageTools + ?Sized,
	{
		let _guard = self.cache.lock(request.app).await;

		let is_url = is_remote(request.app);
		let source = if is_url {
			Source::Downloaded(self.download(request.app).await?)
		} else {
			let path = PathBuf::from(request.app);
			if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
				return Err(Error::InvalidApp {
					app: request.app.to_string(),
					reason: "file does not exist".to_string(),
				});
			}
			Source::Local(path)
		};
		let app_path = source.path().to_path_buf();

		let is_apk = has_extension(&app_path, &[APK_EXT]);
		// Only local .apk files that are available in-place are not cached
		let should_cache = !is_apk || is_url;

		let cached_entry = self.cache.get(request.app);
		let source_hash = if should_cache || cached_entry.is_some() {
			Some(hash_file(&app_path).await?)
		} else {
			None
		};

		if let (Some(entry), Some(hash)) = (&cached_entry, &source_hash) {
			if entry.is_valid_for(hash).await {
				info!(
					target = "spresso.app",
					cached = %entry.full_path.display(),
					app = request.app,
					"using cached package"
				);
				return Ok(ResolvedApp {
					path: entry.full_path.clone(),
					from_cache: true,
					cached: true,
				});
			}
			debug!(target = "spresso.app", app = request.app, "cached package is stale");
		}

		if !should_cache {
			// It is probably not the best idea to modify the provided app in-place,
			// but local packages have always been signed where they are
			presign(tools, &app_path, request).await?;
			return Ok(ResolvedApp {
				path: app_path,
				from_cache: false,
				cached: false,
			});
		}

		let unpacked = self.unpack(&app_path, is_apk, source, tools).await?;
		presign(tools, &unpacked.path, request).await?;
		let (path_in_cache, storage_root) = unpacked.keep()?;

		if let Some(hash) = source_hash {
			let replaced = self.cache.insert(
				request.app,
				CacheEntry {
					package_hash: hash,
					full_path: path_in_cache.clone(),
					storage_root,
				},
			);
			if let Some(old) = replaced.filter(|old| old.full_path != path_in_cache) {
				old.discard().await;
			}
		}

		Ok(ResolvedApp {
			path: path_in_cache,
			from_cache: false,
			cached: true,
		})
	}

	/// Produces the final `.apk` for a cacheable source.
	///
	/// Downloaded containers and unpacked `.aab` files are dropped on every
	/// exit path. The package itself stays temporary until [`Unpacked::keep`].
	async fn unpack<T>(&self, app_path: &Path, is_apk: bool, source: Source, tools: &T) -> Result<Unpacked>
	where
		T: PackageTools + ?Sized,
	{
		if is_apk {
			// downloaded .apk: the download itself is the package
			return Ok(match source {
				Source::Local(path) => Unpacked::in_place(path),
				Source::Downloaded(temp) => Unpacked {
					path: temp.to_path_buf(),
					storage: Storage::File(temp),
				},
			});
		}

		if has_extension(app_path, &[AAB_EXT]) {
			let apk = tools.extract_universal_apk(app_path).await?;
			drop(source);
			return Ok(Unpacked::converted(apk));
		}

		let unzipped_dir = extract_to_temp(app_path, self.prefer_system_unzip).await?;
		drop(source);

		let unzipped = find_packages(unzipped_dir.path(), SUPPORTED_EXTENSIONS)
			.into_iter()
			.next()
			.ok_or_else(|| Error::NoSupportedPackageFound {
				app: app_path.display().to_string(),
				extensions: SUPPORTED_EXTENSIONS.join(", "),
			})?;
		debug!(
			target = "spresso.app",
			unzipped = %unzipped.display(),
			archive = %app_path.display(),
			"found package in archive"
		);

		if has_extension(&unzipped, &[APK_EXT]) {
			return Ok(Unpacked {
				path: unzipped,
				storage: Storage::Dir(unzipped_dir),
			});
		}

		// .aab: the universal apk is written next to the bundle by the tools
		let apk = tools.extract_universal_apk(&unzipped).await?;
		if apk.starts_with(unzipped_dir.path()) {
			let _ = tokio::fs::remove_file(&unzipped).await;
			return Ok(Unpacked {
				path: apk,
				storage: Storage::Dir(unzipped_dir),
			});
		}
		Ok(Unpacked::converted(apk))
	}

	async fn download(&self, url: &str) -> Result<TempPath> {
		info!(target = "spresso.app", url, "downloading app");
		let response = self.http.get(url).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(Error::Download {
				url: url.to_string(),
				status: status.as_u16(),
			});
		}
		let bytes = response.bytes().await?;

		let suffix = remote_extension(url);
		let temp = tempfile::Builder::new()
			.prefix("spresso-download-")
			.suffix(&suffix)
			.tempfile()?
			.into_temp_path();
		tokio::fs::write(&temp, &bytes).await?;
		debug!(
			target = "spresso.app",
			path = %temp.display(),
			bytes = bytes.len(),
			"download finished"
		);
		Ok(temp)
	}
}

/// Where the source package lives. Downloads are removed on drop unless kept.
enum Source {
	Local(PathBuf),
	Downloaded(TempPath),
}

impl Source {
	fn path(&self) -> &Path {
		match self {
			Source::Local(path) => path,
			Source::Downloaded(temp) => &**temp,
		}
	}
}

/// A package that is deleted on drop unless kept.
struct Unpacked {
	path: PathBuf,
	storage: Storage,
}

enum Storage {
	/// Not ours to delete.
	Borrowed,
	File(TempPath),
	Dir(TempDir),
}

impl Unpacked {
	fn in_place(path: PathBuf) -> Self {
		Self {
			path,
			storage: Storage::Borrowed,
		}
	}

	/// A universal apk produced by the bundle tools.
	fn converted(apk: PathBuf) -> Self {
		Self {
			storage: Storage::File(TempPath::from_path(apk.clone())),
			path: apk,
		}
	}

	/// Makes the package permanent; returns it with the directory that owns it.
	fn keep(self) -> Result<(PathBuf, Option<PathBuf>)> {
		match self.storage {
			Storage::Borrowed => Ok((self.path, None)),
			Storage::File(temp) => {
				temp.keep().map_err(|e| Error::Io(e.error))?;
				Ok((self.path, None))
			}
			Storage::Dir(dir) => Ok((self.path, Some(dir.keep()))),
		}
	}
}

async fn presign<T>(tools: &T, apk: &Path, request: ResolveRequest<'_>) -> Result<()>
where
	T: PackageTools + ?Sized,
{
	if request.no_sign {
		info!(
			target = "spresso.app",
			"Skipping application signing because noSign capability is set to true. \
			 Having the application under test with improper signature/non-signed will cause \
			 Espresso automation startup failure."
		);
		return Ok(());
	}

	let signed = tools
		.check_apk_cert(apk, request.app_package)
		.await
		.map_err(|e| signing_failed(apk, e))?;
	if !signed {
		debug!(target = "spresso.app", apk = %apk.display(), "signing package");
		tools
			.sign(apk, request.app_package)
			.await
			.map_err(|e| signing_failed(apk, e))?;
	}
	Ok(())
}

fn signing_failed(apk: &Path, err: Error) -> Error {
	match err {
		Error::SigningFailed { .. } => err,
		other => Error::SigningFailed {
			path: apk.to_path_buf(),
			reason: other.to_string(),
		},
	}
}

fn is_remote(app: &str) -> bool {
	let lower = app.to_ascii_lowercase();
	lower.starts_with("http://") || lower.starts_with("https://")
}

/// Extension of the last URL path segment, `.zip` when there is none.
fn remote_extension(url: &str) -> String {
	let path = url.split(['?', '#']).next().unwrap_or(url);
	let last = path.rsplit('/').next().unwrap_or_default();
	match last.rfind('.') {
		Some(idx) if idx > 0 => last[idx..].to_ascii_lowercase(),
		_ => ".zip".to_string(),
	}
}
