//! Wire types for the spresso WebDriver bridge.
//!
//! This crate contains the serde-serializable shapes that cross a process
//! boundary: the capability map negotiated with the client, the typed session
//! options derived from it, W3C response envelopes and the device metadata
//! reported back to the client.
//!
//! Types in this crate are:
//! - **Pure data**: no I/O, no device or server access
//! - **Wire-shaped**: field names match the camelCase keys clients send
//!
//! Session behavior is built on top of these types in `spresso`.

pub mod caps;
pub mod device;
pub mod options;
pub mod wire;

pub use caps::*;
pub use device::*;
pub use options::*;
pub use wire::*;
