//! Host-side plumbing for spresso sessions.
//!
//! - [`device`]: the device-control seam and [`adb`], its `adb`-backed implementation
//! - [`server`]: the on-device test server seam and [`espresso`], its HTTP client
//! - [`app`]: app artifact resolution with a content-hash cache
//! - [`port`]: host port allocation
//! - [`webview`]: the seam for engines attached to web views

pub mod adb;
pub mod app;
pub mod device;
pub mod error;
pub mod espresso;
pub mod port;
pub mod server;
pub mod webview;

pub use adb::{Adb, AdbConnector, AdbServer, Sdk, Tool};
pub use app::{AppCache, AppResolver, CacheEntry, ResolveRequest, ResolvedApp};
pub use device::{
	DEFAULT_RECORDING_TIME_LIMIT_SECS, DEFAULT_STREAMING_PORT, DeviceConnector, DeviceControl, DeviceTarget,
	InitOutcome, MAX_RECORDING_TIME_LIMIT_SECS, PackageTools, RecordingOptions, StreamOptions,
};
pub use error::{Error, Result};
pub use espresso::{EspressoServer, EspressoServerFactory};
pub use port::{SYSTEM_PORT_RANGE_END, SYSTEM_PORT_RANGE_START, find_port_not_in_use, find_system_port};
pub use server::{
	DEVICE_PORT, KeystoreConfig, SETTINGS_HELPER_PKG_ID, ServerConfig, TEST_APK_PKG, TestServer,
	TestServerFactory,
};
pub use webview::{NATIVE_CONTEXT, WEBVIEW_CONTEXT_PREFIX, WebviewConnector, WebviewDriver};
