//! Interface to the externally supplied Bluetooth protocol stack
//!
//! The stack itself is an external collaborator; this module defines the
//! capability set the controller consumes from it (requests in, events
//! out) and a BlueZ-backed implementation of that interface.

pub mod bluez;
mod traits;

pub use bluez::{BluezStack, StackConfig, DEFAULT_RFCOMM_CHANNEL};
pub use traits::{ConnHandle, LinkEvent, LinkStatus, RequestStatus, SppStack};
