//! Session teardown.
//!
//! Teardown never fails: every step logs its error and moves on so that a
//! broken device or server cannot leave the orchestrator stuck.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use spresso_runtime::DeviceControl;
use tracing::{debug, info, warn};

use super::create::HIDDEN_API_POLICY_MIN_API;
use super::{RecordingState, SessionContext, SessionOrchestrator, SessionState};

type Cleanup<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

impl SessionOrchestrator {
	/// Releases everything the current session holds and returns to idle.
	pub async fn delete(&mut self) {
		let Some(mut ctx) = self.session.take() else {
			self.state = SessionState::Idle;
			return;
		};
		self.state = SessionState::Deleting;
		let was_active = std::mem::replace(&mut ctx.proxy_active, false);
		info!(target = "spresso.session", session_id = %ctx.session_id, was_active, "deleting session");

		if let Some(handlers) = &self.collaborators.handlers {
			if let Err(err) = handlers.remove_all(&ctx.session_id).await {
				warn!(target = "spresso.session", error = %err, "Unable to remove session handlers");
			}
		}

		if let Some(server) = ctx.server.take() {
			if was_active {
				if let Err(err) = server.delete_session().await {
					warn!(target = "spresso.session", error = %err, "Unable to close the server session");
				}
			}
		}

		if let Some(webview) = ctx.webview.take() {
			if let Err(err) = webview.stop().await {
				warn!(target = "spresso.session", error = %err, "Unable to stop the web view driver");
			}
		}

		if let Some(device) = ctx.device.clone() {
			release_device(&ctx, device).await;
		}

		self.state = SessionState::Idle;
		info!(target = "spresso.session", session_id = %ctx.session_id, "session deleted");
	}
}

async fn release_device(ctx: &SessionContext, device: Arc<dyn DeviceControl>) {
	stop_recordings(&*device, ctx.recording).await;

	if ctx.animations_disabled {
		if let Err(err) = device.set_animation_state(true).await {
			warn!(target = "spresso.session", error = %err, "Unable to reset animation");
		}
	}

	let opts = &ctx.opts;
	if opts.unicode_keyboard && opts.reset_keyboard {
		if let Some(ime) = &ctx.default_ime {
			debug!(target = "spresso.session", ime = %ime, "Resetting IME");
			if let Err(err) = device.set_ime(ime).await {
				warn!(target = "spresso.session", error = %err, "Unable to reset IME");
			}
		}
	}

	match opts.app_package.as_deref() {
		Some(package) if !ctx.is_browser_session() && !opts.dont_stop_app_on_reset => {
			if let Err(err) = device.force_stop(package).await {
				warn!(target = "spresso.session", package = %package, error = %err, "Unable to stop the app");
			}
		}
		_ => {}
	}

	if opts.full_reset() && !opts.skip_uninstall && !ctx.app_on_device {
		if let Some(package) = opts.app_package.as_deref() {
			debug!(target = "spresso.session", package = %package, "Uninstalling app under test for full reset");
			if let Err(err) = device.uninstall_apk(package).await {
				warn!(target = "spresso.session", package = %package, error = %err, "Unable to uninstall the app");
			}
		}
	}

	if let Err(err) = device.stop_logcat().await {
		warn!(target = "spresso.session", error = %err, "Unable to stop logcat");
	}

	if let Some(avd) = emulator_to_kill(ctx) {
		debug!(target = "spresso.session", avd = %avd, "Killing emulator");
		if let Err(err) = device.kill_emulator(&avd).await {
			warn!(target = "spresso.session", avd = %avd, error = %err, "Unable to kill the emulator");
		}
	}

	if ctx.api_level.is_some_and(|level| level >= HIDDEN_API_POLICY_MIN_API) {
		if let Err(err) = device
			.set_default_hidden_api_policy(opts.ignore_hidden_api_policy_error)
			.await
		{
			warn!(target = "spresso.session", error = %err, "Unable to restore hidden api policy");
		}
	}

	if let Some(port) = ctx.system_port {
		if let Err(err) = device.remove_port_forward(port).await {
			warn!(target = "spresso.session", port, error = %err, "Unable to remove port forward");
		}
	}
}

/// Stops every capture concurrently; failures are only logged.
async fn stop_recordings(device: &dyn DeviceControl, recording: RecordingState) {
	let mut cleanups: Vec<Cleanup<'_>> = Vec::new();

	if recording.screen_recording {
		cleanups.push(Box::pin(async move {
			if let Err(err) = device.stop_screen_recording().await {
				warn!(target = "spresso.session", error = %err, "Unable to stop screen recording");
			}
		}));
	}

	cleanups.push(Box::pin(async move {
		match device.is_media_projection_recording_running().await {
			Ok(true) => {
				if let Err(err) = device.stop_media_projection_recording().await {
					warn!(target = "spresso.session", error = %err, "Unable to stop media projection recording");
				}
			}
			Ok(false) => {}
			Err(err) => warn!(target = "spresso.session", error = %err, "Unable to query media projection recording"),
		}
	}));

	if recording.screen_streaming {
		cleanups.push(Box::pin(async move {
			if let Err(err) = device.stop_screen_streaming().await {
				warn!(target = "spresso.session", error = %err, "Unable to stop screen streaming");
			}
		}));
	}

	join_all(cleanups).await;
}

/// AVD to shut down: the one booted for this session, or the rebooted one.
fn emulator_to_kill(ctx: &SessionContext) -> Option<String> {
	if let Some(avd) = &ctx.booted_avd {
		return Some(avd.clone());
	}
	let opts = &ctx.opts;
	opts.reboot
		.then(|| opts.avd.as_deref())
		.flatten()
		.map(|avd| avd.trim_start_matches('@').to_string())
}
