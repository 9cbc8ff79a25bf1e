//! # Device Publisher
//!
//! A simulated device: one topic, one set of generators, one broker
//! session and a publish loop. Devices are the unit of concurrency of the
//! fleet; each one runs in its own task and never touches another
//! device's state.
//!
//! ```text
//! Created → Connecting → Running → Draining → Stopped
//!               │           │          ▲
//!               └──────→ Failed ───────┘
//! ```
//!
//! - **Connecting**: one session per device, retried only when the retry
//!   policy asks for it
//! - **Running**: compose payload, publish, sleep; the sleep is cut short by
//!   the stop token
//! - **Draining**: entered on stop, on "nothing left to publish" and after a
//!   failure; releases the session best-effort

pub mod publisher;
pub mod topic;

pub use publisher::{DevicePublisher, DeviceReport, PublisherStats, RunOutcome};
pub use topic::{ComposedPayload, DeviceTopic};
