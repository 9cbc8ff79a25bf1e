//! # Fleet Orchestrator
//!
//! Owns the lifecycle of the whole simulation: bring the command listener
//! up, start the devices one by one, watch them, and tear everything down
//! within a bounded time.
//!
//! ```text
//! FleetOrchestrator::start
//!   ├── CommandListener ── must reach Running within the grace period
//!   ├── DevicePublisher #1
//!   ├── (stagger)
//!   └── DevicePublisher #n
//!
//! FleetHandle::wait  → Interrupted | ListenerLost | Drained
//! FleetHandle::stop  → ShutdownReport (one shared deadline)
//! ```
//!
//! Every worker gets a child of the interrupt token, so one cancellation
//! reaches the whole fleet. Workers report their lifecycle through a
//! `watch` channel that the monitor polls.

pub mod orchestrator;
pub mod shutdown;
pub mod worker;

pub use orchestrator::{FleetExit, FleetHandle, FleetOrchestrator};
pub use shutdown::{stop_workers, ShutdownReport};
pub use worker::{ComponentState, Worker, WorkerKind, WorkerReport};

#[cfg(test)]
mod tests;
