use chrono::NaiveDateTime;
use std::fmt;
use std::str::Utf8Error;

use super::config::QualityOfService;

/// Message delivered to a subscribed worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
    timestamp: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.payload).chars().take(32).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Record of one publish accepted by the loopback broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
    pub retain: bool,
    pub timestamp: NaiveDateTime,
}

impl PublishedMessage {
    /// Payload decoded as JSON, if it is JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {} [qos {}{}]\n{}",
            self.timestamp,
            self.topic,
            self.qos.level(),
            if self.retain { ", retained" } else { "" },
            String::from_utf8_lossy(&self.payload)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_utf8_payload_is_reported_not_panicking() {
        let message = InboundMessage::from_topic("a/b", vec![0xff, 0xfe, 0x00]);
        assert!(message.text().is_err());
        // Display stays usable for logging
        assert!(message.to_string().contains("a/b"));
    }

    #[test]
    fn short_payload_preview() {
        let message = InboundMessage::from_topic("t", "ok");
        assert_eq!(message.text(), Ok("ok"));
        assert!(message.to_string().ends_with("t: ok"));
    }
}
