//! Simulate a fleet of sensors reporting to a gateway over a lossy network.
//!
//! Each sensor is a repeating scheduler event that samples a noisy reading around its
//! baseline and sends it to the gateway. Halfway through (or at a configured instant) the
//! gateway broadcasts a command to every sensor over the reliable control channel.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin sensors -- --config demos/sensors/config.yaml --log-level debug
//! ```
//!
//! At exit, delivery statistics are logged and the metrics registry is printed in the
//! Prometheus text format.

use iotsim_engine::{
    network::{Conditions, Protocol},
    Error,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a sensor fleet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Seed for every random decision. Drawn from system entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_time_step_ms")]
    pub time_step_ms: u64,
    /// Virtual time to simulate.
    pub duration_ms: u64,
    #[serde(default)]
    pub link: Link,
    pub gateway: String,
    #[serde(default)]
    pub command: Option<Command>,
    pub sensors: Vec<Sensor>,
}

/// Impairment applied to sensor readings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Link {
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(default)]
    pub delay_min_ms: u64,
    #[serde(default)]
    pub delay_max_ms: u64,
}

/// Command broadcast by the gateway.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Command {
    /// Virtual time of the broadcast. Defaults to half of the run.
    #[serde(default)]
    pub at_ms: Option<u64>,
    pub payload: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Sensor {
    pub id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub interval_ms: u64,
    pub baseline: f64,
    /// Readings are drawn uniformly from `baseline ± noise`.
    #[serde(default)]
    pub noise: f64,
}

fn default_speed() -> f64 {
    1.0
}

fn default_time_step_ms() -> u64 {
    10
}

fn default_protocol() -> String {
    Protocol::default().to_string()
}

impl Config {
    pub fn time_step(&self) -> Duration {
        Duration::from_millis(self.time_step_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn conditions(&self) -> Conditions {
        Conditions {
            packet_loss: self.link.packet_loss,
            delay_min: Duration::from_millis(self.link.delay_min_ms),
            delay_max: Duration::from_millis(self.link.delay_max_ms),
        }
    }

    /// Virtual time at which the configured command is broadcast, if any.
    pub fn command_at(&self) -> Option<Duration> {
        let command = self.command.as_ref()?;
        let at = command.at_ms.unwrap_or(self.duration_ms / 2);
        Some(Duration::from_millis(at))
    }
}

impl Sensor {
    pub fn protocol(&self) -> Result<Protocol, Error> {
        self.protocol.parse()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Sample a reading around the baseline.
    pub fn read(&self, rng: &mut impl Rng) -> f64 {
        if self.noise <= 0.0 {
            return self.baseline;
        }
        self.baseline + rng.gen_range(-self.noise..=self.noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const SAMPLE: &str = include_str!("../config.yaml");

    #[test]
    fn test_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.gateway, "GATEWAY_01");
        assert_eq!(config.sensors.len(), 4);
        assert_eq!(config.command_at(), Some(Duration::from_millis(2500)));
        assert_eq!(config.conditions().delay_max, Duration::from_millis(5));

        let protocols: Vec<_> = config
            .sensors
            .iter()
            .map(|sensor| sensor.protocol().unwrap())
            .collect();
        assert_eq!(
            protocols,
            vec![
                Protocol::Zigbee,
                Protocol::Thread,
                Protocol::Lora,
                Protocol::BluetoothLe
            ]
        );
        assert_eq!(config.sensors[3].noise, 0.0);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str(
            "duration_ms: 1000\ngateway: gw\ncommand:\n  payload: PING\nsensors:\n  - id: s\n    interval_ms: 100\n    baseline: 1.0\n",
        )
        .unwrap();
        assert_eq!(config.seed, None);
        assert_eq!(config.speed, 1.0);
        assert_eq!(config.time_step(), Duration::from_millis(10));
        assert_eq!(config.conditions(), Conditions::default());
        assert_eq!(config.command_at(), Some(Duration::from_millis(500)));
        assert_eq!(config.sensors[0].protocol().unwrap(), Protocol::Custom);
    }

    #[test]
    fn test_unknown_protocol() {
        let sensor = Sensor {
            id: "s".into(),
            protocol: "smoke-signal".into(),
            interval_ms: 100,
            baseline: 0.0,
            noise: 0.0,
        };
        assert!(matches!(sensor.protocol(), Err(Error::UnknownProtocol(_))));
    }

    #[test]
    fn test_read_within_noise() {
        let sensor = Sensor {
            id: "TEMP_001".into(),
            protocol: "zigbee".into(),
            interval_ms: 100,
            baseline: 22.5,
            noise: 5.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1000 {
            let reading = sensor.read(&mut rng);
            assert!((17.5..=27.5).contains(&reading));
        }
    }
}
