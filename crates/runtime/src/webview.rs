//! Secondary browser-engine seam used inside web views.

use std::sync::Arc;

use async_trait::async_trait;
use spresso_protocol::{ProxyRequest, ProxyResponse, SessionOptions};

use crate::device::DeviceControl;
use crate::error::Result;

/// Name of the native context.
pub const NATIVE_CONTEXT: &str = "NATIVE_APP";

/// Prefix shared by all web view context names.
pub const WEBVIEW_CONTEXT_PREFIX: &str = "WEBVIEW_";

/// A running engine attached to one web view.
#[async_trait]
pub trait WebviewDriver: Send + Sync {
	fn context_name(&self) -> &str;

	async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse>;

	async fn stop(&self) -> Result<()>;
}

/// Discovers web views and attaches engines to them.
#[async_trait]
pub trait WebviewConnector: Send + Sync {
	async fn webview_contexts(&self, device: &dyn DeviceControl) -> Result<Vec<String>>;

	async fn attach(
		&self,
		device: Arc<dyn DeviceControl>,
		context: &str,
		opts: &SessionOptions,
	) -> Result<Arc<dyn WebviewDriver>>;
}
