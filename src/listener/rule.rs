use serde::Deserialize;

use crate::error::ConfigError;

fn default_listener_id() -> String {
    "simulator-listener".to_string()
}

/// `[listener]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerSpec {
    #[serde(default = "default_listener_id")]
    pub id: String,
    pub topics: Vec<String>,
    pub trigger: String,
    pub response: String,
    pub response_topic: String,
}

impl ListenerSpec {
    pub fn from_value(value: &toml::Value) -> Result<Self, ConfigError> {
        let spec: ListenerSpec = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::InvalidListener(e.message().to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidListener("id is empty".to_string()));
        }
        if self.id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidListener(format!(
                "id '{}' starts with whitespace",
                self.id
            )));
        }
        if self.topics.is_empty() {
            return Err(ConfigError::InvalidListener("no control topics".to_string()));
        }
        if self.response_topic.trim().is_empty() {
            return Err(ConfigError::InvalidListener("response_topic is empty".to_string()));
        }
        // exact matching only
        if let Some(topic) = self
            .topics
            .iter()
            .chain(std::iter::once(&self.response_topic))
            .find(|t| t.is_empty() || t.contains('#') || t.contains('+'))
        {
            return Err(ConfigError::InvalidListener(format!(
                "topic '{}' is empty or contains a wildcard",
                topic
            )));
        }
        Ok(())
    }

    pub fn rule(&self) -> TriggerRule {
        TriggerRule {
            topics: self.topics.clone(),
            trigger: self.trigger.clone(),
        }
    }
}

/// Exact, case-sensitive topic and payload match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    topics: Vec<String>,
    trigger: String,
}

impl TriggerRule {
    pub fn new(topics: Vec<String>, trigger: impl Into<String>) -> Self {
        Self {
            topics,
            trigger: trigger.into(),
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn matches(&self, topic: &str, payload: &str) -> bool {
        payload == self.trigger && self.topics.iter().any(|t| t == topic)
    }
}
