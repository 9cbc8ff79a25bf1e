//! MQTT telemetry fleet simulator
//!
//! ```text
//! fleetsim/
//! ├── config/      - TOML model, delivery layering, topic expansion
//! ├── generators/  - numeric walks, toggles, playlists, expressions
//! ├── mqtt/        - broker seam, rumqttc sessions, loopback broker
//! ├── device/      - one publisher per topic
//! ├── listener/    - trigger/response command listener
//! └── fleet/       - start-up, monitoring, bounded shutdown
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod generators;
pub mod listener;
pub mod mqtt;

pub use config::FleetConfig;
pub use error::{ConfigError, ConnectError, FleetError, GeneratorError, TransportError};
pub use fleet::{FleetExit, FleetHandle, FleetOrchestrator, ShutdownReport};
