use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::delivery::{DeliveryOverrides, DeliverySettings};
use crate::device::DeviceTopic;
use crate::error::ConfigError;
use crate::generators::{FunctionSet, GeneratorSpec};

/// How one `[[topics]]` entry expands into concrete topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Single,
    #[serde(alias = "multiple")]
    Range,
    List,
}

#[derive(Debug, Deserialize)]
struct RawTopic {
    #[serde(alias = "type")]
    kind: TopicKind,
    prefix: String,
    #[serde(default = "default_start")]
    start: i64,
    #[serde(default)]
    end: Option<i64>,
    #[serde(default)]
    items: Vec<toml::Value>,
    #[serde(default, alias = "payload_root")]
    payload: Map<String, Value>,
    #[serde(default)]
    data: Vec<toml::Value>,
}

fn default_start() -> i64 {
    1
}

/// Validated topic specification, before expansion
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub kind: TopicKind,
    pub prefix: String,
    pub start: i64,
    pub end: Option<i64>,
    pub items: Vec<String>,
    pub fragment: Map<String, Value>,
    pub delivery: DeliverySettings,
    pub generators: Vec<GeneratorSpec>,
}

impl TopicSpec {
    /// Parses entry `index`; broken generators are skipped, not fatal
    pub fn parse(
        index: usize,
        value: &toml::Value,
        defaults: &DeliverySettings,
        functions: FunctionSet,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTopic { index, reason };

        let raw: RawTopic = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| invalid(e.message().to_string()))?;
        if raw.prefix.trim().is_empty() {
            return Err(invalid("prefix is empty".to_string()));
        }

        let overrides: DeliveryOverrides = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| invalid(e.message().to_string()))?;
        let delivery = overrides.resolve(defaults).map_err(invalid)?;

        let mut generators = Vec::with_capacity(raw.data.len());
        for entry in &raw.data {
            match GeneratorSpec::from_value(entry, functions) {
                Ok(spec) => generators.push(spec),
                Err(e) => warn!("Topic '{}': skipping generator: {}", raw.prefix, e),
            }
        }

        let items = raw
            .items
            .iter()
            .filter_map(|item| match item {
                toml::Value::String(s) => Some(s.clone()),
                toml::Value::Integer(n) => Some(n.to_string()),
                toml::Value::Float(f) => Some(f.to_string()),
                toml::Value::Boolean(b) => Some(b.to_string()),
                other => {
                    warn!("Topic '{}': skipping list item {}", raw.prefix, other);
                    None
                }
            })
            .collect();

        Ok(Self {
            kind: raw.kind,
            prefix: raw.prefix,
            start: raw.start,
            end: raw.end,
            items,
            fragment: raw.payload,
            delivery,
            generators,
        })
    }

    /// Concrete topic URLs in declaration order
    pub fn expand(&self) -> Vec<String> {
        match self.kind {
            TopicKind::Single => vec![self.prefix.clone()],
            TopicKind::Range => match self.end {
                None => {
                    warn!("Range topic '{}' has no end, no topics produced", self.prefix);
                    Vec::new()
                }
                Some(end) if end < self.start => {
                    warn!(
                        "Invalid range for topic '{}' (start={}, end={}), no topics produced",
                        self.prefix, self.start, end
                    );
                    Vec::new()
                }
                Some(end) => (self.start..=end)
                    .map(|n| format!("{}/{}", self.prefix, n))
                    .collect(),
            },
            TopicKind::List => {
                if self.items.is_empty() {
                    warn!("List topic '{}' has no items, no topics produced", self.prefix);
                }
                self.items
                    .iter()
                    .map(|item| format!("{}/{}", self.prefix, item))
                    .collect()
            }
        }
    }

    /// Expands and gives every device its own generator state
    pub fn build_devices<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<DeviceTopic> {
        let devices: Vec<DeviceTopic> = self
            .expand()
            .into_iter()
            .map(|url| {
                let generators = self.generators.iter().map(|g| g.instantiate(rng)).collect();
                DeviceTopic::new(url, generators, self.fragment.clone(), self.delivery.clone())
            })
            .collect();

        debug!(
            "Topic spec '{}' expanded into {} device(s) with {} generator(s) each",
            self.prefix,
            devices.len(),
            self.generators.len()
        );
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QualityOfService;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn parse(source: &str) -> Result<TopicSpec, ConfigError> {
        let value: toml::Value = toml::from_str(source).unwrap();
        TopicSpec::parse(0, &value, &DeliverySettings::default(), FunctionSet::Basic)
    }

    #[test]
    fn range_expands_in_ascending_order() {
        let spec = parse("kind = 'range'\nprefix = 'dev'\nstart = 1\nend = 3").unwrap();
        assert_eq!(spec.expand(), vec!["dev/1", "dev/2", "dev/3"]);
    }

    #[test]
    fn inverted_range_yields_nothing() {
        let spec = parse("kind = 'multiple'\nprefix = 'dev'\nstart = 5\nend = 2").unwrap();
        assert!(spec.expand().is_empty());
    }

    #[test]
    fn list_and_single_expansion() {
        let spec = parse("kind = 'list'\nprefix = 'cell'\nitems = ['a', 7]").unwrap();
        assert_eq!(spec.expand(), vec!["cell/a", "cell/7"]);

        let spec = parse("type = 'single'\nprefix = 'prison/door'").unwrap();
        assert_eq!(spec.expand(), vec!["prison/door"]);

        let spec = parse("kind = 'list'\nprefix = 'cell'").unwrap();
        assert!(spec.expand().is_empty());
    }

    #[test]
    fn bad_generators_are_skipped_bad_topics_rejected() {
        let spec = parse(
            r#"
            kind = 'single'
            prefix = 'p'
            qos = 2
            [[data]]
            name = 'ok'
            type = 'bool'
            [[data]]
            name = 'broken'
            type = 'nope'
            "#,
        )
        .unwrap();
        assert_eq!(spec.generators.len(), 1);
        assert_eq!(spec.delivery.qos, QualityOfService::ExactlyOnce);

        assert!(parse("kind = 'single'").is_err());
        assert!(parse("kind = 'spiral'\nprefix = 'p'").is_err());
        assert!(parse("kind = 'single'\nprefix = 'p'\nqos = 3").is_err());
        assert!(parse("kind = 'single'\nprefix = 'p'\ninterval_secs = 0").is_err());
    }

    #[test]
    fn every_device_owns_its_generators() {
        let spec = parse(
            "kind = 'range'\nprefix = 'd'\nend = 2\npayload = { site = 'north' }\n[[data]]\nname = 'v'\ntype = 'raw_values'\nvalues = [1, 2]",
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut devices = spec.build_devices(&mut rng);
        assert_eq!(devices.len(), 2);

        let first = devices[0].compose(&mut rng).unwrap();
        let second = devices[1].compose(&mut rng).unwrap();
        assert_eq!(first.fields["v"], serde_json::json!(1));
        assert_eq!(second.fields["v"], serde_json::json!(1));
        assert_eq!(first.fields["site"], serde_json::json!("north"));
    }
}
