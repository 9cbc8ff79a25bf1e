//! # Broker Wiring
//!
//! Everything a worker needs to talk to a message broker. Workers only see
//! the [`Connector`] / [`BrokerLink`] pair; which broker sits behind it is
//! decided once in `main`.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - endpoint, protocol revision, QoS
//! ├── link.rs             - Connector and BrokerLink traits
//! ├── message_manager.rs  - inbound and published message records
//! ├── mqtt_handler.rs     - rumqttc sessions (3.1.1 and 5) with a network pump
//! └── loopback.rs         - in-process broker for dry runs and tests
//! ```
//!
//! Each worker owns its session exclusively. Sessions never reconnect on
//! their own; a dropped connection is reported through `is_alive` and the
//! owning worker decides what happens next.

pub mod config;
pub mod link;
pub mod loopback;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{BrokerEndpoint, ProtocolVersion, QualityOfService};
pub use link::{BrokerLink, Connector, SessionRequest};
pub use loopback::LoopbackBroker;
pub use message_manager::{InboundMessage, PublishedMessage};
pub use mqtt_handler::MqttConnector;
