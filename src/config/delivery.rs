use serde::Deserialize;
use std::time::Duration;

use crate::mqtt::QualityOfService;

/// Per-device publish behaviour after all overrides are applied
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// `None` defers to the protocol default
    pub clean_session: Option<bool>,
    pub retain: bool,
    pub qos: QualityOfService,
    pub interval: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            clean_session: None,
            retain: false,
            qos: QualityOfService::AtLeastOnce,
            interval: Duration::from_secs(10),
        }
    }
}

/// One layer of optional delivery settings (`[defaults]` or a topic)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeliveryOverrides {
    #[serde(default, alias = "clean_session")]
    pub clean: Option<bool>,
    #[serde(default)]
    pub retain: Option<bool>,
    #[serde(default)]
    pub qos: Option<QualityOfService>,
    #[serde(default, alias = "interval")]
    pub interval_secs: Option<f64>,
}

impl DeliveryOverrides {
    /// Layers `self` on top of `base`; set fields win
    pub fn resolve(&self, base: &DeliverySettings) -> Result<DeliverySettings, String> {
        let interval = match self.interval_secs {
            Some(secs) if !secs.is_finite() || secs <= 0.0 => {
                return Err(format!("interval_secs must be positive, got {}", secs))
            }
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("interval_secs {} is out of range: {}", secs, e))?,
            None => base.interval,
        };

        Ok(DeliverySettings {
            clean_session: self.clean.or(base.clean_session),
            retain: self.retain.unwrap_or(base.retain),
            qos: self.qos.unwrap_or(base.qos),
            interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_overrides_beat_fleet_defaults_beat_builtins() {
        let builtin = DeliverySettings::default();
        let fleet = DeliveryOverrides {
            retain: Some(true),
            interval_secs: Some(2.0),
            ..Default::default()
        }
        .resolve(&builtin)
        .unwrap();
        let topic = DeliveryOverrides {
            qos: Some(QualityOfService::ExactlyOnce),
            interval_secs: Some(0.5),
            ..Default::default()
        }
        .resolve(&fleet)
        .unwrap();

        assert_eq!(topic.clean_session, None);
        assert!(topic.retain);
        assert_eq!(topic.qos, QualityOfService::ExactlyOnce);
        assert_eq!(topic.interval, Duration::from_millis(500));
    }

    #[test]
    fn builtin_defaults() {
        let settings = DeliverySettings::default();
        assert_eq!(settings.qos, QualityOfService::AtLeastOnce);
        assert!(!settings.retain);
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.clean_session, None);
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let layer = DeliveryOverrides {
            interval_secs: Some(-1.0),
            ..Default::default()
        };
        assert!(layer.resolve(&DeliverySettings::default()).is_err());
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let layer = DeliveryOverrides {
            interval_secs: Some(1e30),
            ..Default::default()
        };
        let reason = layer.resolve(&DeliverySettings::default()).unwrap_err();
        assert!(reason.contains("out of range"));
    }
}
