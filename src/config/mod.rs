//! # Fleet Configuration
//!
//! Turns a TOML document into an immutable [`FleetConfig`]. Loading is
//! lenient at item level: a malformed topic, generator or listener section
//! is logged and skipped while the rest of the file still loads. Only an
//! unreadable file or invalid TOML fails the whole load.
//!
//! ```text
//! config/
//! ├── delivery.rs  - delivery settings and their override layers
//! ├── runtime.rs   - engine timing, seed, retry policy
//! └── topics.rs    - topic specifications and their expansion
//! ```
//!
//! Delivery settings resolve topic > `[defaults]` > built-in.

pub mod delivery;
pub mod runtime;
pub mod topics;

pub use delivery::{DeliveryOverrides, DeliverySettings};
pub use runtime::{RetryPolicy, RuntimeSettings};
pub use topics::{TopicKind, TopicSpec};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::device::DeviceTopic;
use crate::error::ConfigError;
use crate::listener::ListenerSpec;
use crate::mqtt::BrokerEndpoint;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    broker: BrokerEndpoint,
    #[serde(default)]
    defaults: DeliveryOverrides,
    #[serde(default)]
    runtime: RuntimeSettings,
    #[serde(default)]
    listener: Option<toml::Value>,
    #[serde(default)]
    topics: Vec<toml::Value>,
}

/// Resolved configuration of a whole fleet
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub broker: Arc<BrokerEndpoint>,
    pub runtime: RuntimeSettings,
    pub devices: Vec<DeviceTopic>,
    pub listener: Option<ListenerSpec>,
}

impl FleetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading fleet configuration from {}", path.display());

        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(source)?;
        let defaults = raw
            .defaults
            .resolve(&DeliverySettings::default())
            .map_err(ConfigError::InvalidDefaults)?;
        debug!("Fleet delivery defaults: {:?}", defaults);

        let listener = match raw.listener.as_ref().map(ListenerSpec::from_value) {
            Some(Ok(spec)) => Some(spec),
            Some(Err(e)) => {
                warn!("Skipping listener: {}", e);
                None
            }
            None => None,
        };

        let mut rng = match raw.runtime.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut devices = Vec::new();
        for (index, value) in raw.topics.iter().enumerate() {
            match TopicSpec::parse(index, value, &defaults, raw.runtime.expression_functions) {
                Ok(spec) => devices.extend(spec.build_devices(&mut rng)),
                Err(e) => warn!("Skipping topic: {}", e),
            }
        }

        if devices.is_empty() {
            warn!("No valid topics were loaded from the configuration");
        } else {
            info!(
                "Prepared {} device topic(s) from {} topic specification(s)",
                devices.len(),
                raw.topics.len()
            );
        }

        Ok(Self {
            broker: Arc::new(raw.broker),
            runtime: raw.runtime,
            devices,
            listener,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{ProtocolVersion, QualityOfService};
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [broker]
        host = "broker.local"
        protocol = "5"

        [defaults]
        retain = true
        interval_secs = 3

        [runtime]
        seed = 42

        [listener]
        topics = ["prison/control"]
        trigger = "GET_FLAG"
        response = "FLAG{x}"
        response_topic = "prison/system/flag_channel"

        [[topics]]
        kind = "range"
        prefix = "prison/cell"
        end = 2
        qos = 0
        [[topics.data]]
        name = "temperature"
        type = "float"
        min = 18
        max = 24
        max_step = 0.5

        [[topics]]
        kind = "single"
        prefix = "prison/gate"
        payload = { gate = "main" }
        interval_secs = 1

        [[topics]]
        kind = "range"
        prefix = "broken"
        start = 4
        end = 1

        [[topics]]
        prefix = "no-kind"
    "#;

    #[test]
    fn sample_configuration_resolves() {
        let config = FleetConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.protocol, ProtocolVersion::V5);

        let urls: Vec<&str> = config.devices.iter().map(|d| d.url()).collect();
        assert_eq!(urls, vec!["prison/cell/1", "prison/cell/2", "prison/gate"]);

        let cell = config.devices[0].delivery();
        assert_eq!(cell.qos, QualityOfService::AtMostOnce);
        assert!(cell.retain);
        assert_eq!(cell.interval, Duration::from_secs(3));
        assert_eq!(config.devices[2].delivery().interval, Duration::from_secs(1));

        let listener = config.listener.unwrap();
        assert_eq!(listener.trigger, "GET_FLAG");
    }

    #[test]
    fn malformed_listener_is_skipped() {
        let config = FleetConfig::from_toml_str(
            "[listener]\ntopics = []\ntrigger = 'x'\nresponse = 'y'\nresponse_topic = 'z'\n[[topics]]\nkind = 'single'\nprefix = 'p'\npayload = { a = 1 }",
        )
        .unwrap();
        assert!(config.listener.is_none());
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn invalid_toml_fails_the_load() {
        assert!(matches!(
            FleetConfig::from_toml_str("[broker\nhost = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            FleetConfig::from_toml_str("[defaults]\ninterval_secs = -2"),
            Err(ConfigError::InvalidDefaults(_))
        ));
    }

    #[test]
    fn empty_configuration_has_no_devices() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.listener.is_none());
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn topic_with_oversized_interval_is_skipped() {
        let config = FleetConfig::from_toml_str(
            "[[topics]]\nkind = 'single'\nprefix = 'a'\ninterval_secs = 1e30\npayload = { k = 1 }\n\
             [[topics]]\nkind = 'single'\nprefix = 'b'\npayload = { k = 2 }",
        )
        .unwrap();
        let urls: Vec<&str> = config.devices.iter().map(|d| d.url()).collect();
        assert_eq!(urls, vec!["b"]);
    }
}
