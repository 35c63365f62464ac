//! Connection management for the multi-peer SPP workflow
//!
//! This module handles:
//! - The workflow phase machine and its transition-legality table
//! - The fixed-size slot table that owns live connection handles
//! - The manager event loop reacting to the user trigger and the
//!   protocol stack's asynchronous events

mod manager;
mod phase;
mod slots;

pub use manager::{ConnectionManager, ControllerHandle};
pub use phase::Phase;
pub use slots::{SlotTable, MAX_PEERS};
