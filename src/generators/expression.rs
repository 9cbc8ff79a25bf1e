use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use super::expr::{Expression, Scalar};
use super::round4;
use crate::error::GeneratorError;

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionConfig {
    #[serde(default = "default_expression")]
    pub expression: String,
    #[serde(default)]
    pub interval_start: f64,
    #[serde(default = "default_interval_end")]
    pub interval_end: f64,
    #[serde(default = "default_delta")]
    pub min_delta: f64,
    #[serde(default = "default_delta")]
    pub max_delta: f64,
}

fn default_expression() -> String {
    "x".to_string()
}

fn default_interval_end() -> f64 {
    1.0
}

fn default_delta() -> f64 {
    0.1
}

/// Evaluates an expression at an `x` that advances by a random delta
/// and wraps around inside `[x_start, x_end]`.
#[derive(Debug, Clone)]
pub struct ExpressionWalk {
    expression: Expression,
    x: f64,
    x_start: f64,
    x_end: f64,
    min_delta: f64,
    max_delta: f64,
}

impl ExpressionWalk {
    pub fn new(config: &ExpressionConfig, expression: Expression) -> Result<Self, String> {
        if !config.interval_start.is_finite()
            || !config.interval_end.is_finite()
            || config.interval_end < config.interval_start
        {
            return Err(format!(
                "interval [{}, {}] is invalid",
                config.interval_start, config.interval_end
            ));
        }
        if config.min_delta < 0.0 || config.min_delta > config.max_delta || !config.max_delta.is_finite() {
            return Err(format!(
                "delta range [{}, {}] is invalid",
                config.min_delta, config.max_delta
            ));
        }

        Ok(Self {
            expression,
            x: config.interval_start,
            x_start: config.interval_start,
            x_end: config.interval_end,
            min_delta: config.min_delta,
            max_delta: config.max_delta,
        })
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Value, GeneratorError> {
        let delta = if self.min_delta < self.max_delta {
            rng.gen_range(self.min_delta..=self.max_delta)
        } else {
            self.min_delta
        };
        self.advance(delta);

        match self.expression.evaluate(self.x) {
            Ok(Scalar::Number(value)) if value.is_finite() => Ok(Value::from(round4(value))),
            Ok(_) => Err(GeneratorError::NonNumeric { x: self.x }),
            Err(reason) => Err(GeneratorError::Evaluation { x: self.x, reason }),
        }
    }

    fn advance(&mut self, delta: f64) {
        self.x += delta;
        if self.x > self.x_end {
            let width = self.x_end - self.x_start;
            self.x = if width > 0.0 {
                self.x_start + (self.x - self.x_end).rem_euclid(width)
            } else {
                self.x_start
            };
        }
    }
}
