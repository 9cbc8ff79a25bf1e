use serde::{Deserialize, Deserializer};
use std::fmt;
use tracing::warn;

/// MQTT protocol revision requested for every session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    V31,
    #[default]
    V311,
    V5,
}

impl ProtocolVersion {
    /// Lenient parse: unknown revisions fall back to 3.1.1
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "3.1" | "31" | "MQTTv31" => ProtocolVersion::V31,
            "3.1.1" | "311" | "MQTTv311" => ProtocolVersion::V311,
            "5" | "5.0" | "MQTTv5" => ProtocolVersion::V5,
            other => {
                warn!("Unknown MQTT protocol '{}', falling back to 3.1.1", other);
                ProtocolVersion::V311
            }
        }
    }

    /// Whether the legacy clean-session flag belongs in CONNECT
    pub fn supports_clean_session(self) -> bool {
        !matches!(self, ProtocolVersion::V5)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProtocolVersion::V31 => "3.1",
            ProtocolVersion::V311 => "3.1.1",
            ProtocolVersion::V5 => "5",
        };
        write!(f, "{}", name)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => ProtocolVersion::parse(&text),
            Raw::Number(n) if n == 5.0 => ProtocolVersion::V5,
            Raw::Number(n) if n == 3.1 => ProtocolVersion::V31,
            Raw::Number(n) => ProtocolVersion::parse(&n.to_string()),
        })
    }
}

/// Delivery guarantee tier for publish and subscribe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QualityOfService {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            2 => Ok(QualityOfService::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl QualityOfService {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<QualityOfService> for rumqttc::v5::mqttbytes::QoS {
    fn from(qos: QualityOfService) -> Self {
        use rumqttc::v5::mqttbytes::QoS;
        match qos {
            QualityOfService::AtMostOnce => QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

/// Broker address, protocol and credentials
///
/// Resolved once and shared read-only by every worker.
#[derive(Clone, PartialEq, Deserialize)]
pub struct BrokerEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: ProtocolVersion,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub allow_anonymous: Option<bool>,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: ProtocolVersion::default(),
            username: None,
            password: None,
            allow_anonymous: None,
        }
    }
}

impl BrokerEndpoint {
    /// Username/password pair, if a username is configured
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username
            .as_ref()
            .map(|user| (user.clone(), self.password.clone().unwrap_or_default()))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keeps passwords out of logs
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        broker: BrokerEndpoint,
    }

    #[test]
    fn endpoint_defaults_and_protocol_spellings() {
        let parsed: Wrapper = toml::from_str("[broker]\nprotocol = '5'").unwrap();
        assert_eq!(parsed.broker.host, "localhost");
        assert_eq!(parsed.broker.port, 1883);
        assert_eq!(parsed.broker.protocol, ProtocolVersion::V5);

        assert_eq!(ProtocolVersion::parse("3.1"), ProtocolVersion::V31);
        assert_eq!(ProtocolVersion::parse("MQTTv311"), ProtocolVersion::V311);
        assert_eq!(ProtocolVersion::parse("7"), ProtocolVersion::V311);
        assert!(!ProtocolVersion::V5.supports_clean_session());
    }

    #[test]
    fn qos_outside_range_is_rejected() {
        assert_eq!(QualityOfService::try_from(2), Ok(QualityOfService::ExactlyOnce));
        assert!(QualityOfService::try_from(3).is_err());
        assert_eq!(QualityOfService::AtLeastOnce.level(), 1);
    }

    #[test]
    fn debug_output_hides_password() {
        let endpoint = BrokerEndpoint {
            username: Some("sim".into()),
            password: Some("hunter2".into()),
            ..BrokerEndpoint::default()
        };
        let rendered = format!("{:?}", endpoint);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(endpoint.credentials(), Some(("sim".into(), "hunter2".into())));
    }
}
