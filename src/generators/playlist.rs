use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    pub values: Vec<Value>,
    #[serde(default)]
    pub restart_on_end: bool,
    #[serde(default)]
    pub value_default: Option<Map<String, Value>>,
}

/// Ordered list of literal values replayed one per evaluation
///
/// Map-shaped entries are layered on top of `value_default`, entry keys
/// winning. Without `restart_on_end` the playlist is exhausted after the
/// last entry and stays exhausted.
#[derive(Debug, Clone)]
pub struct ValuePlaylist {
    values: Vec<Value>,
    cursor: usize,
    restart_on_end: bool,
    default: Option<Map<String, Value>>,
}

impl ValuePlaylist {
    pub fn new(config: &PlaylistConfig) -> Result<Self, String> {
        if config.values.is_empty() {
            return Err("values list is empty".to_string());
        }
        Ok(Self {
            values: config.values.clone(),
            cursor: 0,
            restart_on_end: config.restart_on_end,
            default: config.value_default.clone(),
        })
    }

    /// Returns `None` once exhausted
    pub fn next(&mut self) -> Option<Value> {
        if self.cursor >= self.values.len() {
            if self.restart_on_end && !self.values.is_empty() {
                self.cursor = 0;
            } else {
                return None;
            }
        }

        let value = match (&self.values[self.cursor], &self.default) {
            (Value::Object(entry), Some(default)) => {
                let mut merged = default.clone();
                merged.extend(entry.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(merged)
            }
            (value, _) => value.clone(),
        };
        self.cursor += 1;
        Some(value)
    }
}
