//! Cache of resolved application packages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::Result;

/// A previously resolved package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
	/// Content hash of the source the entry was derived from.
	pub package_hash: String,
	/// Resolved package on the host.
	pub full_path: PathBuf,
	/// Temporary directory created to hold the package, removed together with it.
	pub storage_root: Option<PathBuf>,
}

impl CacheEntry {
	/// An entry is usable only when the source is unchanged and the package is still on disk.
	pub async fn is_valid_for(&self, source_hash: &str) -> bool {
		self.package_hash == source_hash && tokio::fs::try_exists(&self.full_path).await.unwrap_or(false)
	}

	/// Deletes the package, or its whole storage directory when it has one.
	pub async fn discard(&self) {
		let removed = match &self.storage_root {
			Some(root) => tokio::fs::remove_dir_all(root).await,
			None => tokio::fs::remove_file(&self.full_path).await,
		};
		match removed {
			Ok(()) => debug!(target = "spresso.app", path = %self.full_path.display(), "removed replaced package"),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => warn!(
				target = "spresso.app",
				path = %self.full_path.display(),
				error = %err,
				"failed to remove replaced package"
			),
		}
	}
}

/// Held while one app reference is being resolved.
///
/// Dropping it releases the reference and forgets its lock once no other
/// resolution is waiting for it.
pub struct ResolutionGuard<'a> {
	cache: &'a AppCache,
	key: String,
	guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ResolutionGuard<'_> {
	fn drop(&mut self) {
		drop(self.guard.take());
		self.cache
			.locks
			.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
	}
}

/// Shared cache keyed by the app reference the client sent.
///
/// Resolutions of the same reference are serialized through [`AppCache::lock`]
/// so the hash check, processing and update happen as one step.
#[derive(Default)]
pub struct AppCache {
	entries: Mutex<HashMap<String, CacheEntry>>,
	locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &str) -> Option<CacheEntry> {
		self.entries.lock().get(key).cloned()
	}

	/// Stores `entry` and returns the one it replaced.
	pub fn insert(&self, key: impl Into<String>, entry: CacheEntry) -> Option<CacheEntry> {
		self.entries.lock().insert(key.into(), entry)
	}

	pub fn remove(&self, key: &str) -> Option<CacheEntry> {
		self.entries.lock().remove(key)
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Acquires the per-reference resolution lock.
	pub async fn lock(&self, key: &str) -> ResolutionGuard<'_> {
		let mutex = self
			.locks
			.entry(key.to_string())
			.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
			.clone();
		ResolutionGuard {
			cache: self,
			key: key.to_string(),
			guard: Some(mutex.lock_owned().await),
		}
	}

	/// References with a live or pending resolution.
	pub fn active_resolutions(&self) -> usize {
		self.locks.len()
	}
}

/// SHA-256 of a file's content, hex encoded.
pub async fn hash_file(path: &Path) -> Result<String> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		let read = file.read(&mut buf).await?;
		if read == 0 {
			break;
		}
		hasher.update(&buf[..read]);
	}
	Ok(format!("{:x}", hasher.finalize()))
}
