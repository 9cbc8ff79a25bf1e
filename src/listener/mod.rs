//! # Command Listener
//!
//! Optional companion of the fleet. It subscribes to a handful of control
//! topics and answers one exact trigger payload with one fixed response.
//!
//! ```text
//! control topic ──"GET_FLAG"──► CommandListener ──response──► response topic
//!                 anything else ─► ignored
//! ```
//!
//! The listener is started before any device. If its connection drops
//! mid-run it does not come back; the fleet treats that as the end of the
//! whole simulation.

pub mod command;
pub mod rule;

pub use command::{CommandListener, ListenOutcome, ListenerReport};
pub use rule::{ListenerSpec, TriggerRule};

#[cfg(test)]
mod tests;
