//! Core library for the lift simulation.
//!
//! Everything the five processes share lives here: the floor label model,
//! the length-prefixed wire protocol spoken between cars, call clients and
//! the controller, the per-cab shared-memory record with its cross-process
//! mutex and condition variable, and the cooperative shutdown flag.

pub mod floor;
pub mod proto;
pub mod shm;
pub mod signal;

/// Default controller listen address.
pub const CONTROLLER_ADDR: &str = "127.0.0.1:3000";
