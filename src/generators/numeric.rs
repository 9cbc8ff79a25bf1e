use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use super::round4;

/// Output representation of a numeric walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericType {
    Int,
    Float,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumericConfig {
    pub min: f64,
    pub max: f64,
    pub max_step: f64,
    #[serde(default)]
    pub initial: Option<f64>,
    #[serde(default = "default_increase_probability")]
    pub increase_probability: f64,
    #[serde(default)]
    pub reset_probability: f64,
    #[serde(default)]
    pub restart_on_boundaries: bool,
}

fn default_increase_probability() -> f64 {
    0.5
}

/// Bounded random walk
///
/// The current value never leaves `[min, max]`; every emitted value is
/// the current value rounded to the output type and re-clamped.
#[derive(Debug, Clone)]
pub struct NumericWalk {
    min: f64,
    max: f64,
    step_max: f64,
    increase_probability: f64,
    reset_probability: f64,
    restart_on_boundary: bool,
    initial: Option<f64>,
    current: f64,
    output: NumericType,
}

impl NumericWalk {
    pub fn new(config: &NumericConfig, output: NumericType) -> Result<Self, String> {
        if !config.min.is_finite() || !config.max.is_finite() || config.min > config.max {
            return Err(format!("bounds [{}, {}] are invalid", config.min, config.max));
        }
        if !config.max_step.is_finite() || config.max_step < 0.0 {
            return Err(format!("max_step {} must be >= 0", config.max_step));
        }
        check_probability("increase_probability", config.increase_probability)?;
        check_probability("reset_probability", config.reset_probability)?;
        if output == NumericType::Int && config.min.ceil() > config.max.floor() {
            return Err(format!(
                "no integer lies within [{}, {}]",
                config.min, config.max
            ));
        }

        let current = config
            .initial
            .unwrap_or(config.min)
            .clamp(config.min, config.max);

        Ok(Self {
            min: config.min,
            max: config.max,
            step_max: config.max_step,
            increase_probability: config.increase_probability,
            reset_probability: config.reset_probability,
            restart_on_boundary: config.restart_on_boundaries,
            initial: config.initial,
            current,
            output,
        })
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Value {
        let reset_to = self
            .initial
            .filter(|_| self.reset_probability > 0.0 && rng.gen_bool(self.reset_probability));

        match reset_to {
            Some(initial) => self.current = initial.clamp(self.min, self.max),
            None => {
                let step = rng.gen_range(0.0..=self.step_max);
                let increase = rng.gen_bool(self.increase_probability);
                let next = if increase {
                    self.current + step
                } else {
                    self.current - step
                };

                let overflowed = next > self.max || next < self.min;
                let landed = match self.initial.filter(|_| overflowed && self.restart_on_boundary) {
                    Some(initial) => initial,
                    None => next,
                };
                self.current = landed.clamp(self.min, self.max);
            }
        }

        self.emit()
    }

    fn emit(&self) -> Value {
        match self.output {
            NumericType::Int => {
                // half to even
                let rounded = self
                    .current
                    .round_ties_even()
                    .clamp(self.min.ceil(), self.max.floor());
                Value::from(rounded as i64)
            }
            NumericType::Float => Value::from(round4(self.current).clamp(self.min, self.max)),
        }
    }
}

pub(crate) fn check_probability(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be within [0, 1], got {}", field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(min: f64, max: f64, max_step: f64) -> NumericConfig {
        NumericConfig {
            min,
            max,
            max_step,
            initial: None,
            increase_probability: 0.5,
            reset_probability: 0.0,
            restart_on_boundaries: false,
        }
    }

    #[test]
    fn rejects_inverted_bounds_and_bad_probabilities() {
        assert!(NumericWalk::new(&config(10.0, 0.0, 1.0), NumericType::Float).is_err());

        let mut cfg = config(0.0, 10.0, 1.0);
        cfg.increase_probability = 1.5;
        assert!(NumericWalk::new(&cfg, NumericType::Float).is_err());

        assert!(NumericWalk::new(&config(0.2, 0.8, 0.1), NumericType::Int).is_err());
    }

    #[test]
    fn initial_value_is_clamped() {
        let mut cfg = config(0.0, 10.0, 1.0);
        cfg.initial = Some(42.0);
        let walk = NumericWalk::new(&cfg, NumericType::Float).unwrap();
        assert_eq!(walk.current(), 10.0);
    }

    #[test]
    fn restart_on_boundary_snaps_to_initial() {
        let mut cfg = config(0.0, 10.0, 100.0);
        cfg.initial = Some(5.0);
        cfg.increase_probability = 1.0;
        cfg.restart_on_boundaries = true;
        let mut walk = NumericWalk::new(&cfg, NumericType::Float).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        // Any step larger than 5 overshoots and snaps back
        for _ in 0..50 {
            let before = walk.current();
            walk.next(&mut rng);
            let after = walk.current();
            assert!(after == 5.0 || after > before);
        }
    }

    #[test]
    fn certain_reset_always_returns_initial() {
        let mut cfg = config(0.0, 100.0, 10.0);
        cfg.initial = Some(20.0);
        cfg.reset_probability = 1.0;
        let mut walk = NumericWalk::new(&cfg, NumericType::Int).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(walk.next(&mut rng), Value::from(20));
        }
    }

    #[test]
    fn integer_output_rounds_half_to_even() {
        let mut rng = StdRng::seed_from_u64(1);
        for (initial, expected) in [(2.5, 2), (3.5, 4), (-0.5, 0)] {
            let mut cfg = config(-5.0, 5.0, 1.0);
            cfg.initial = Some(initial);
            cfg.reset_probability = 1.0;
            let mut walk = NumericWalk::new(&cfg, NumericType::Int).unwrap();
            assert_eq!(walk.next(&mut rng), Value::from(expected));
        }
    }

    #[test]
    fn float_output_has_four_decimals() {
        let mut walk = NumericWalk::new(&config(0.0, 1.0, 0.123456), NumericType::Float).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let value = walk.next(&mut rng).as_f64().unwrap();
            assert!(((value * 10_000.0).round() - value * 10_000.0).abs() < 1e-6);
        }
    }

    proptest! {
        #[test]
        fn values_stay_within_bounds(
            seed in any::<u64>(),
            min in -1_000.0f64..1_000.0,
            span in 0.0f64..500.0,
            step in 0.0f64..2_000.0,
            increase in 0.0f64..=1.0,
            steps in 1usize..300,
            int_output in any::<bool>(),
        ) {
            let max = min + span;
            let output = if int_output { NumericType::Int } else { NumericType::Float };
            let cfg = NumericConfig { increase_probability: increase, ..config(min, max, step) };
            prop_assume!(output == NumericType::Float || min.ceil() <= max.floor());

            let mut walk = NumericWalk::new(&cfg, output).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..steps {
                let value = walk.next(&mut rng).as_f64().unwrap();
                prop_assert!(value >= min && value <= max, "{} outside [{}, {}]", value, min, max);
            }
        }
    }
}
