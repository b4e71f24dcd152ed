use serde::{Deserialize, Serialize};

use crate::config::SensorConfig;

/// One sample from a climate or power probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorReading {
    Climate {
        temperature: f32,
        #[serde(default)]
        humidity: Option<f32>,
    },
    Power {
        voltage: f32,
        current: f32,
        power: f32,
    },
}

/// Source of periodic readings for a sensor or thermostat accessory.
/// `None` is a failed read.
pub trait SensorProbe: Send {
    fn read(&mut self) -> Option<SensorReading>;
}

/// Poll schedule and consecutive failure tracking for one group.
#[derive(Debug, Clone)]
pub struct SensorPoll {
    pub period_ms: u64,
    pub temperature_offset: f32,
    pub humidity_offset: f32,
    error_threshold: u8,
    errors: u8,
}

impl SensorPoll {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            period_ms: u64::from(config.poll_period_s) * 1_000,
            temperature_offset: config.temperature_offset,
            humidity_offset: config.humidity_offset,
            error_threshold: config.error_threshold.max(1),
            errors: 0,
        }
    }

    pub fn errors(&self) -> u8 {
        self.errors
    }

    /// Returns true exactly once, on the failure that reaches the threshold.
    pub fn record_failure(&mut self) -> bool {
        if self.errors >= self.error_threshold {
            return false;
        }
        self.errors += 1;
        self.errors == self.error_threshold
    }

    pub fn record_success(&mut self) {
        self.errors = 0;
    }

    /// Applies configured offsets to a climate reading.
    pub fn adjust(&self, reading: SensorReading) -> SensorReading {
        match reading {
            SensorReading::Climate {
                temperature,
                humidity,
            } => SensorReading::Climate {
                temperature: temperature + self.temperature_offset,
                humidity: humidity.map(|value| (value + self.humidity_offset).clamp(0.0, 100.0)),
            },
            power => power,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn threshold_reported_once() {
        let mut poll = SensorPoll::new(&SensorConfig {
            error_threshold: 3,
            ..SensorConfig::default()
        });

        assert!(!poll.record_failure());
        assert!(!poll.record_failure());
        assert!(poll.record_failure());
        assert!(!poll.record_failure());
        assert_eq!(poll.errors(), 3);

        poll.record_success();
        assert_eq!(poll.errors(), 0);
    }

    #[test]
    fn offsets_apply_to_climate_only() {
        let poll = SensorPoll::new(&SensorConfig {
            temperature_offset: -1.5,
            humidity_offset: 10.0,
            ..SensorConfig::default()
        });

        assert_eq!(
            poll.adjust(SensorReading::Climate {
                temperature: 21.5,
                humidity: Some(95.0),
            }),
            SensorReading::Climate {
                temperature: 20.0,
                humidity: Some(100.0),
            }
        );

        let power = SensorReading::Power {
            voltage: 230.0,
            current: 1.0,
            power: 230.0,
        };
        assert_eq!(poll.adjust(power), power);
    }

    #[test]
    fn readings_parse_from_json() {
        let reading: SensorReading =
            serde_json::from_str(r#"{"temperature": 21.0, "humidity": 40.0}"#).unwrap();
        assert_eq!(
            reading,
            SensorReading::Climate {
                temperature: 21.0,
                humidity: Some(40.0),
            }
        );

        let reading: SensorReading = serde_json::from_str(r#"{"temperature": 19.0}"#).unwrap();
        assert_eq!(
            reading,
            SensorReading::Climate {
                temperature: 19.0,
                humidity: None,
            }
        );
    }
}
