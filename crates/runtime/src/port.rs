//! Host port selection for device-to-host forwarding.

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Error, Result};

/// First port of the range forwarded to the on-device server.
pub const SYSTEM_PORT_RANGE_START: u16 = 8300;
/// Last port (inclusive) of the range forwarded to the on-device server.
pub const SYSTEM_PORT_RANGE_END: u16 = 8399;

/// Returns the first port in `low..=high` that can currently be bound on the loopback interface.
///
/// The temporary listener is dropped right away, so a later bind by another
/// process can still win the port.
pub async fn find_port_not_in_use(low: u16, high: u16) -> Result<u16> {
	for port in low..=high {
		if port_available(port).await {
			debug!(target = "spresso.port", port, "found free port");
			return Ok(port);
		}
	}
	Err(Error::PortUnavailable { low, high })
}

/// Convenience wrapper over [`find_port_not_in_use`] for the system port range.
pub async fn find_system_port() -> Result<u16> {
	find_port_not_in_use(SYSTEM_PORT_RANGE_START, SYSTEM_PORT_RANGE_END).await
}

async fn port_available(port: u16) -> bool {
	TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn skips_bound_port() {
		let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let taken = held.local_addr().unwrap().port();

		let single = find_port_not_in_use(taken, taken).await;
		assert!(matches!(
			single,
			Err(Error::PortUnavailable { low, high }) if low == taken && high == taken
		));

		let high = taken.saturating_add(8);
		match find_port_not_in_use(taken, high).await {
			Ok(port) => {
				assert_ne!(port, taken);
				assert!((taken..=high).contains(&port));
			}
			Err(Error::PortUnavailable { .. }) => {}
			Err(e) => panic!("Unexpected error: {e:?}"),
		}
	}

	#[tokio::test]
	async fn empty_range_is_unavailable() {
		let result = find_port_not_in_use(9000, 8999).await;
		assert!(matches!(result, Err(Error::PortUnavailable { .. })));
	}
}
