//! # Value Generators
//!
//! Pure state machines producing one payload field each. A generator is
//! selected once at load time from its `type` string and never changes
//! variant afterwards.
//!
//! ```text
//! generators/
//! ├── numeric.rs     - bounded random walk (int / float)
//! ├── toggle.rs      - boolean flipping every evaluation
//! ├── playlist.rs    - replay of literal values, optionally looping
//! ├── expression.rs  - expression over a wrapping `x`
//! └── expr.rs        - sandboxed expression language
//! ```
//!
//! A generator that is exhausted or fails to evaluate becomes terminal:
//! it stops contributing to the payload while the rest of the device
//! keeps running.

pub mod expr;
pub mod expression;
pub mod numeric;
pub mod playlist;
pub mod toggle;

pub use expr::{Expression, FunctionSet};
pub use expression::{ExpressionConfig, ExpressionWalk};
pub use numeric::{NumericConfig, NumericType, NumericWalk};
pub use playlist::{PlaylistConfig, ValuePlaylist};
pub use toggle::BooleanToggle;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::error::ConfigError;
use numeric::check_probability;

/// Rounds to four decimal places
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Evolution state of one generator
#[derive(Debug, Clone)]
pub enum GeneratorKind {
    Numeric(NumericWalk),
    Toggle(BooleanToggle),
    Playlist(ValuePlaylist),
    Expression(ExpressionWalk),
}

/// One payload field with its evolution state
#[derive(Debug, Clone)]
pub struct Generator {
    name: String,
    retain_probability: f64,
    active: bool,
    kind: GeneratorKind,
}

impl Generator {
    pub fn new(name: impl Into<String>, retain_probability: f64, kind: GeneratorKind) -> Self {
        Self {
            name: name.into(),
            retain_probability,
            active: true,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Produces the next value, or `None` once terminal
    ///
    /// `owner` is the identity of the device holding this generator and is
    /// only used for logging.
    pub fn next_value<R: Rng + ?Sized>(&mut self, rng: &mut R, owner: &str) -> Option<Value> {
        if !self.active {
            return None;
        }

        let outcome = match &mut self.kind {
            GeneratorKind::Numeric(walk) => Ok(Some(walk.next(rng))),
            GeneratorKind::Toggle(toggle) => Ok(Some(Value::Bool(toggle.next()))),
            GeneratorKind::Playlist(playlist) => Ok(playlist.next()),
            GeneratorKind::Expression(walk) => walk.next(rng).map(Some),
        };

        match outcome {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                info!(
                    "{}: generator '{}' reached the end of its values, deactivating",
                    owner, self.name
                );
                self.active = false;
                None
            }
            Err(e) => {
                error!("{}: generator '{}' failed: {}, deactivating", owner, self.name, e);
                self.active = false;
                None
            }
        }
    }

    /// Opportunistic retain draw; terminal generators never ask
    pub fn wants_retain<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.active && self.retain_probability > 0.0 && rng.gen_bool(self.retain_probability)
    }
}

fn parse_fields<T: DeserializeOwned>(value: &toml::Value, name: &str) -> Result<T, ConfigError> {
    value
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::InvalidGenerator {
            name: name.to_string(),
            reason: e.message().to_string(),
        })
}

#[derive(Debug, Deserialize)]
struct GeneratorHeader {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    retain_probability: f64,
}

#[derive(Debug, Deserialize)]
struct ToggleConfig {
    #[serde(default)]
    initial: Option<bool>,
}

/// Validated generator description, instantiated once per device
///
/// Holds a prototype built at load time; each device gets its own copy so
/// no evolution state is ever shared.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    name: String,
    retain_probability: f64,
    prototype: GeneratorKind,
    random_initial: bool,
}

impl GeneratorSpec {
    /// Parses and validates one `[[topics.data]]` entry
    ///
    /// Expressions are compiled here so that a broken expression is
    /// rejected once at load instead of failing on every device.
    pub fn from_value(value: &toml::Value, functions: FunctionSet) -> Result<Self, ConfigError> {
        let header: GeneratorHeader =
            value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::InvalidGenerator {
                    name: value
                        .get("name")
                        .and_then(toml::Value::as_str)
                        .unwrap_or("<unnamed>")
                        .to_string(),
                    reason: e.message().to_string(),
                })?;

        let invalid = |reason: String| ConfigError::InvalidGenerator {
            name: header.name.clone(),
            reason,
        };
        check_probability("retain_probability", header.retain_probability).map_err(invalid)?;

        let mut random_initial = false;
        let prototype = match header.kind.to_lowercase().as_str() {
            "int" | "float" => {
                let output = if header.kind.eq_ignore_ascii_case("int") {
                    NumericType::Int
                } else {
                    NumericType::Float
                };
                let config: NumericConfig = parse_fields(value, &header.name)?;
                GeneratorKind::Numeric(NumericWalk::new(&config, output).map_err(invalid)?)
            }
            "bool" => {
                let config: ToggleConfig = parse_fields(value, &header.name)?;
                random_initial = config.initial.is_none();
                GeneratorKind::Toggle(BooleanToggle::new(config.initial.unwrap_or_default()))
            }
            "raw_values" => {
                let config: PlaylistConfig = parse_fields(value, &header.name)?;
                GeneratorKind::Playlist(ValuePlaylist::new(&config).map_err(invalid)?)
            }
            "math_expression" => {
                let config: ExpressionConfig = parse_fields(value, &header.name)?;
                let expression = Expression::compile(&config.expression, functions).map_err(|e| {
                    invalid(format!("expression '{}' rejected: {}", config.expression, e))
                })?;
                GeneratorKind::Expression(ExpressionWalk::new(&config, expression).map_err(invalid)?)
            }
            _ => {
                return Err(ConfigError::UnknownGeneratorType {
                    name: header.name,
                    kind: header.kind,
                })
            }
        };

        Ok(Self {
            name: header.name,
            retain_probability: header.retain_probability,
            prototype,
            random_initial,
        })
    }

    /// Builds fresh evolution state; toggles without `initial` start random
    pub fn instantiate<R: Rng + ?Sized>(&self, rng: &mut R) -> Generator {
        let kind = match &self.prototype {
            GeneratorKind::Toggle(_) if self.random_initial => {
                GeneratorKind::Toggle(BooleanToggle::new(rng.gen_bool(0.5)))
            }
            prototype => prototype.clone(),
        };
        Generator::new(self.name.clone(), self.retain_probability, kind)
    }
}
