use rand::Rng;
use serde_json::{Map, Value};

use crate::config::DeliverySettings;
use crate::generators::Generator;

/// One message worth of generated data
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPayload {
    pub fields: Map<String, Value>,
    pub retain: bool,
}

impl ComposedPayload {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.fields)
    }
}

/// A resolved topic with the generators feeding it
#[derive(Debug, Clone)]
pub struct DeviceTopic {
    url: String,
    generators: Vec<Generator>,
    fragment: Map<String, Value>,
    delivery: DeliverySettings,
}

impl DeviceTopic {
    pub fn new(
        url: impl Into<String>,
        generators: Vec<Generator>,
        fragment: Map<String, Value>,
        delivery: DeliverySettings,
    ) -> Self {
        Self {
            url: url.into(),
            generators,
            fragment,
            delivery,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn delivery(&self) -> &DeliverySettings {
        &self.delivery
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn active_generators(&self) -> usize {
        self.generators.iter().filter(|g| g.is_active()).count()
    }

    /// `simulator-<topic>`; ephemeral sessions get a random suffix
    pub fn client_id<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let base = format!("simulator-{}", self.url.replace('/', "_"));
        match self.delivery.clean_session {
            Some(false) => base,
            _ => format!("{}-{}", base, rng.gen_range(1000..=9999)),
        }
    }

    /// Advances every active generator and builds the next payload
    ///
    /// Returns `None` once there is nothing left to say: no generator
    /// contributed a value and the static fragment is empty.
    pub fn compose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<ComposedPayload> {
        let mut fields = self.fragment.clone();
        let mut contributed = false;

        for generator in self.generators.iter_mut() {
            if let Some(value) = generator.next_value(rng, &self.url) {
                fields.insert(generator.name().to_string(), value);
                contributed = true;
            }
        }

        if !contributed && self.fragment.is_empty() {
            return None;
        }

        let retain =
            self.delivery.retain || self.generators.iter().any(|g| g.wants_retain(rng));

        Some(ComposedPayload { fields, retain })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{BooleanToggle, GeneratorKind, PlaylistConfig, ValuePlaylist};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn playlist(name: &str, values: Vec<Value>) -> Generator {
        let config = PlaylistConfig {
            values,
            restart_on_end: false,
            value_default: None,
        };
        Generator::new(
            name,
            0.0,
            GeneratorKind::Playlist(ValuePlaylist::new(&config).unwrap()),
        )
    }

    fn fragment(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn fragment_and_generated_fields_are_merged() {
        let mut topic = DeviceTopic::new(
            "site/door",
            vec![playlist("state", vec![json!("open")])],
            fragment(json!({"unit": "door", "state": "unknown"})),
            DeliverySettings::default(),
        );
        let mut rng = StdRng::seed_from_u64(1);

        let first = topic.compose(&mut rng).unwrap();
        assert_eq!(first.fields, fragment(json!({"unit": "door", "state": "open"})));
        assert!(!first.retain);

        // exhausted generator, fragment keeps the device publishing
        let second = topic.compose(&mut rng).unwrap();
        assert_eq!(second.fields, fragment(json!({"unit": "door", "state": "unknown"})));
    }

    #[test]
    fn nothing_left_to_publish() {
        let mut topic = DeviceTopic::new(
            "a",
            vec![playlist("v", vec![json!(1), json!(2), json!(3)])],
            Map::new(),
            DeliverySettings::default(),
        );
        let mut rng = StdRng::seed_from_u64(1);

        for expected in 1..=3 {
            let payload = topic.compose(&mut rng).unwrap();
            assert_eq!(payload.fields["v"], json!(expected));
        }
        assert!(topic.compose(&mut rng).is_none());
        assert_eq!(topic.active_generators(), 0);
    }

    #[test]
    fn retain_default_applies_to_every_message() {
        let settings = DeliverySettings {
            retain: true,
            ..DeliverySettings::default()
        };
        let toggle = Generator::new("on", 0.0, GeneratorKind::Toggle(BooleanToggle::new(false)));
        let mut topic = DeviceTopic::new("t", vec![toggle], Map::new(), settings);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(topic.compose(&mut rng).unwrap().retain);
    }

    #[test]
    fn client_identity_depends_on_session_kind() {
        let mut rng = StdRng::seed_from_u64(9);
        let ephemeral = DeviceTopic::new("plant/a/1", Vec::new(), Map::new(), DeliverySettings::default());
        let id = ephemeral.client_id(&mut rng);
        assert!(id.starts_with("simulator-plant_a_1-"));
        assert_eq!(id.len(), "simulator-plant_a_1-".len() + 4);

        let persistent = DeviceTopic::new(
            "plant/a/1",
            Vec::new(),
            Map::new(),
            DeliverySettings {
                clean_session: Some(false),
                ..DeliverySettings::default()
            },
        );
        assert_eq!(persistent.client_id(&mut rng), "simulator-plant_a_1");
    }
}
