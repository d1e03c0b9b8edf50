//! Descriptive profiles of common IoT link protocols.
//!
//! Profiles are metadata attached to endpoints. They do not influence how the
//! [super::Network] delays or drops messages.

use crate::Error;
use std::{fmt, str::FromStr};

/// Link protocol an endpoint is tagged with.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Protocol {
    Mqtt,
    Coap,
    Http,
    #[default]
    Custom,
    Lora,
    Zigbee,
    BluetoothLe,
    Thread,
    Zwave,
    NbIot,
    Sigfox,
}

/// Typical characteristics of a [Protocol].
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub name: &'static str,
    /// Maximum communication range in kilometers.
    pub range_km: f64,
    /// Typical data rate in kilobits per second.
    pub data_rate_kbps: f64,
    /// Power draw relative to a baseline of `1.0`.
    pub relative_power: f64,
    /// Typical latency in milliseconds.
    pub latency_ms: f64,
    pub max_payload_bytes: usize,
    pub mesh: bool,
    pub encryption: bool,
    pub typical_packet_loss: f64,
    pub max_devices: u32,
    pub use_case: &'static str,
}

const LORA: Profile = Profile {
    name: "LoRa",
    range_km: 15.0,
    data_rate_kbps: 0.3,
    relative_power: 0.1,
    latency_ms: 1000.0,
    max_payload_bytes: 256,
    mesh: false,
    encryption: true,
    typical_packet_loss: 0.02,
    max_devices: 1_000,
    use_case: "Long-range sensors",
};

const ZIGBEE: Profile = Profile {
    name: "ZigBee",
    range_km: 0.1,
    data_rate_kbps: 250.0,
    relative_power: 0.3,
    latency_ms: 30.0,
    max_payload_bytes: 100,
    mesh: true,
    encryption: true,
    typical_packet_loss: 0.01,
    max_devices: 65_000,
    use_case: "Home automation",
};

const BLUETOOTH_LE: Profile = Profile {
    name: "Bluetooth LE",
    range_km: 0.05,
    data_rate_kbps: 1000.0,
    relative_power: 0.2,
    latency_ms: 10.0,
    max_payload_bytes: 255,
    mesh: false,
    encryption: true,
    typical_packet_loss: 0.05,
    max_devices: 20,
    use_case: "Wearable devices",
};

const THREAD: Profile = Profile {
    name: "Thread",
    range_km: 0.05,
    data_rate_kbps: 250.0,
    relative_power: 0.4,
    latency_ms: 20.0,
    max_payload_bytes: 1280,
    mesh: true,
    encryption: true,
    typical_packet_loss: 0.01,
    max_devices: 250,
    use_case: "Smart home",
};

const ZWAVE: Profile = Profile {
    name: "Z-Wave",
    range_km: 0.05,
    data_rate_kbps: 100.0,
    relative_power: 0.3,
    latency_ms: 50.0,
    max_payload_bytes: 64,
    mesh: true,
    encryption: true,
    typical_packet_loss: 0.01,
    max_devices: 232,
    use_case: "Home security",
};

const NB_IOT: Profile = Profile {
    name: "NB-IoT",
    range_km: 10.0,
    data_rate_kbps: 250.0,
    relative_power: 0.15,
    latency_ms: 2000.0,
    max_payload_bytes: 1600,
    mesh: false,
    encryption: true,
    typical_packet_loss: 0.03,
    max_devices: 50_000,
    use_case: "Smart metering",
};

const SIGFOX: Profile = Profile {
    name: "Sigfox",
    range_km: 50.0,
    data_rate_kbps: 0.01,
    relative_power: 0.05,
    latency_ms: 5000.0,
    max_payload_bytes: 12,
    mesh: false,
    encryption: true,
    typical_packet_loss: 0.05,
    max_devices: 1_000_000,
    use_case: "Low-power sensors",
};

const MQTT: Profile = Profile {
    name: "MQTT",
    range_km: 0.01,
    data_rate_kbps: 10_000.0,
    relative_power: 1.0,
    latency_ms: 5.0,
    max_payload_bytes: 268_435_456,
    mesh: false,
    encryption: false,
    typical_packet_loss: 0.001,
    max_devices: 1_000_000,
    use_case: "Enterprise IoT",
};

const COAP: Profile = Profile {
    name: "CoAP",
    range_km: 0.01,
    data_rate_kbps: 1000.0,
    relative_power: 0.8,
    latency_ms: 100.0,
    max_payload_bytes: 1024,
    mesh: false,
    encryption: false,
    typical_packet_loss: 0.005,
    max_devices: 10_000,
    use_case: "Constrained devices",
};

const HTTP: Profile = Profile {
    name: "HTTP",
    range_km: 0.01,
    data_rate_kbps: 10_000.0,
    relative_power: 1.0,
    latency_ms: 50.0,
    max_payload_bytes: 268_435_456,
    mesh: false,
    encryption: false,
    typical_packet_loss: 0.001,
    max_devices: 1_000_000,
    use_case: "Web services",
};

const CUSTOM: Profile = Profile {
    name: "Custom",
    range_km: 1.0,
    data_rate_kbps: 1000.0,
    relative_power: 1.0,
    latency_ms: 100.0,
    max_payload_bytes: 1024,
    mesh: false,
    encryption: false,
    typical_packet_loss: 0.01,
    max_devices: 1_000,
    use_case: "General purpose",
};

impl Protocol {
    /// All known protocols.
    pub const ALL: [Protocol; 11] = [
        Protocol::Mqtt,
        Protocol::Coap,
        Protocol::Http,
        Protocol::Custom,
        Protocol::Lora,
        Protocol::Zigbee,
        Protocol::BluetoothLe,
        Protocol::Thread,
        Protocol::Zwave,
        Protocol::NbIot,
        Protocol::Sigfox,
    ];

    /// Returns the static profile describing this protocol.
    pub fn profile(self) -> &'static Profile {
        match self {
            Protocol::Mqtt => &MQTT,
            Protocol::Coap => &COAP,
            Protocol::Http => &HTTP,
            Protocol::Custom => &CUSTOM,
            Protocol::Lora => &LORA,
            Protocol::Zigbee => &ZIGBEE,
            Protocol::BluetoothLe => &BLUETOOTH_LE,
            Protocol::Thread => &THREAD,
            Protocol::Zwave => &ZWAVE,
            Protocol::NbIot => &NB_IOT,
            Protocol::Sigfox => &SIGFOX,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().name)
    }
}

impl FromStr for Protocol {
    type Err = Error;

    /// Parses a protocol name, ignoring case and separators (`"nb-iot"`, `"NB_IOT"` and
    /// `"nbiot"` are all accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        Protocol::ALL
            .into_iter()
            .find(|protocol| normalize(protocol.profile().name) == wanted)
            .ok_or_else(|| Error::UnknownProtocol(s.to_string()))
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("lora", Protocol::Lora)]
    #[test_case("ZigBee", Protocol::Zigbee)]
    #[test_case("bluetooth_le", Protocol::BluetoothLe)]
    #[test_case("Z-Wave", Protocol::Zwave)]
    #[test_case("NB_IOT", Protocol::NbIot)]
    #[test_case("mqtt", Protocol::Mqtt)]
    fn test_parse(input: &str, expected: Protocol) {
        assert_eq!(input.parse::<Protocol>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown() {
        let result = "carrier-pigeon".parse::<Protocol>();
        assert!(matches!(result, Err(Error::UnknownProtocol(name)) if name == "carrier-pigeon"));
    }

    #[test]
    fn test_display_round_trips() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
    }

    #[test]
    fn test_profiles() {
        assert_eq!(Protocol::default(), Protocol::Custom);

        let lora = Protocol::Lora.profile();
        assert_eq!(lora.name, "LoRa");
        assert_eq!(lora.max_payload_bytes, 256);
        assert!(!lora.mesh);

        let mesh: Vec<_> = Protocol::ALL
            .into_iter()
            .filter(|protocol| protocol.profile().mesh)
            .collect();
        assert_eq!(mesh, vec![Protocol::Zigbee, Protocol::Thread, Protocol::Zwave]);
    }
}
