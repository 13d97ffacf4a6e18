//! spresso command-line front end.
//!
//! Parses flags and the config file, wires the `adb` device layer and the
//! Espresso server client into a [`spresso::SessionOrchestrator`] and serves
//! it over the WebDriver HTTP protocol.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;

use std::sync::Arc;

use spresso::{Collaborators, SessionOrchestrator};
use spresso_runtime::{AdbConnector, AppResolver, EspressoServerFactory, Sdk};

use crate::config::Settings;

/// Builds the orchestrator backed by real devices.
pub fn orchestrator(settings: &Settings) -> SessionOrchestrator {
	let sdk = match &settings.android_home {
		Some(root) => Sdk::with_root(root),
		None => Sdk::from_env(),
	};
	let collaborators = Collaborators::new(
		Arc::new(AdbConnector::new(sdk, settings.adb.clone())),
		Arc::new(EspressoServerFactory::new(settings.server_apk.clone())),
		Arc::new(AppResolver::new()),
	);
	SessionOrchestrator::new(collaborators)
}
