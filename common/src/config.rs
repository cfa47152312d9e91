use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    #[default]
    Blink,
    LocalCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCycleTiming {
    pub red_s: u16,
    pub yellow_s: u16,
    pub green_s: u16,
}

impl Default for LocalCycleTiming {
    fn default() -> Self {
        Self {
            red_s: 39,
            yellow_s: 3,
            green_s: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub connectivity_check_interval_ms: u64,
    pub offline_blink_ms: u64,
    pub fault_blink_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub override_hold_ms: u64,
    pub loop_interval_ms: u64,
    pub max_payload_bytes: usize,
    pub offline_policy: OfflinePolicy,
    pub local_cycle: LocalCycleTiming,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            connectivity_check_interval_ms: 5_000,
            offline_blink_ms: 300,
            fault_blink_ms: 500,
            heartbeat_interval_ms: 10_000,
            override_hold_ms: 3_000,
            loop_interval_ms: 10,
            max_payload_bytes: 512,
            offline_policy: OfflinePolicy::Blink,
            local_cycle: LocalCycleTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub team_id: String,
    pub light_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            team_id: "10".to_string(),
            light_id: "10".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub red: i32,
    pub yellow: i32,
    pub green: i32,
    pub display_clk: i32,
    pub display_dio: i32,
    pub button: i32,
    pub display_brightness: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            red: 0,
            yellow: 4,
            green: 2,
            display_clk: 22,
            display_dio: 21,
            button: 15,
            display_brightness: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub signal: SignalConfig,
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            signal: SignalConfig::default(),
            device: DeviceConfig::default(),
            network: NetworkConfig::default(),
            pins: PinConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.signal.sanitize();
        self.device.sanitize();
        self.network.sanitize();
        self.pins.sanitize();
    }
}

impl SignalConfig {
    pub fn sanitize(&mut self) {
        self.connectivity_check_interval_ms =
            self.connectivity_check_interval_ms.clamp(500, 60_000);
        self.offline_blink_ms = self.offline_blink_ms.clamp(50, 5_000);
        self.fault_blink_ms = self.fault_blink_ms.clamp(50, 5_000);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(1_000, 600_000);
        self.override_hold_ms = self.override_hold_ms.clamp(500, 30_000);
        self.loop_interval_ms = self.loop_interval_ms.clamp(1, 100);
        self.max_payload_bytes = self.max_payload_bytes.clamp(64, 4_096);
        self.local_cycle.sanitize();
    }
}

impl LocalCycleTiming {
    pub fn sanitize(&mut self) {
        self.red_s = self.red_s.clamp(1, 9_999);
        self.yellow_s = self.yellow_s.clamp(1, 9_999);
        self.green_s = self.green_s.clamp(1, 9_999);
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.team_id = self.team_id.trim().to_string();
        if self.team_id.is_empty() || self.team_id.contains(['/', '#', '+']) {
            self.team_id = defaults.team_id;
        }

        self.light_id = self.light_id.trim().to_string();
        if self.light_id.is_empty() || self.light_id.contains(['/', '#', '+']) {
            self.light_id = defaults.light_id;
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.wifi_ssid = ascii_ssid(&self.wifi_ssid);
        self.mqtt_host = self.mqtt_host.trim().to_string();
        if self.mqtt_host.is_empty() {
            self.mqtt_host = Self::default().mqtt_host;
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = Self::default().mqtt_port;
        }
    }
}

// Typographic quotes become ASCII, other non-ASCII is dropped.
fn ascii_ssid(raw: &str) -> String {
    let clean: String = raw
        .chars()
        .filter_map(|c| match c {
            '\u{2018}' | '\u{2019}' => Some('\''),
            '\u{201C}' | '\u{201D}' => Some('"'),
            ' '..='~' => Some(c),
            c if c.is_ascii() => Some(' '),
            _ => None,
        })
        .collect();
    clean.trim().to_string()
}

impl PinConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (pin, fallback) in [
            (&mut self.red, defaults.red),
            (&mut self.yellow, defaults.yellow),
            (&mut self.green, defaults.green),
            (&mut self.display_clk, defaults.display_clk),
            (&mut self.display_dio, defaults.display_dio),
            (&mut self.button, defaults.button),
        ] {
            if *pin < 0 {
                *pin = fallback;
            }
        }

        self.display_brightness = self.display_brightness.min(7);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_clamps_timings() {
        let mut config = SignalConfig {
            connectivity_check_interval_ms: 0,
            offline_blink_ms: 1,
            fault_blink_ms: 60_000,
            local_cycle: LocalCycleTiming {
                red_s: 0,
                yellow_s: 3,
                green_s: 10,
            },
            ..SignalConfig::default()
        };
        config.sanitize();

        assert_eq!(config.connectivity_check_interval_ms, 500);
        assert_eq!(config.offline_blink_ms, 50);
        assert_eq!(config.fault_blink_ms, 5_000);
        assert_eq!(config.local_cycle.red_s, 1);
    }

    #[test]
    fn sanitize_rejects_topic_wildcards_in_ids() {
        let mut device = DeviceConfig {
            team_id: " 7 ".to_string(),
            light_id: "a/#".to_string(),
        };
        device.sanitize();

        assert_eq!(
            device,
            DeviceConfig {
                team_id: "7".to_string(),
                light_id: "10".to_string(),
            }
        );
    }

    #[test]
    fn sanitize_flattens_typographic_quotes_in_ssid() {
        let mut network = NetworkConfig {
            wifi_ssid: " Bob\u{2019}s \u{201C}Fast\u{201D}\tiPhone\u{1F4F6} ".to_string(),
            mqtt_host: "  ".to_string(),
            mqtt_port: 0,
            ..NetworkConfig::default()
        };
        network.sanitize();

        assert_eq!(network.wifi_ssid, "Bob's \"Fast\" iPhone");
        assert_eq!(network.mqtt_host, "192.168.1.100");
        assert_eq!(network.mqtt_port, 1883);
    }

    #[test]
    fn partial_runtime_json_fills_defaults() {
        let raw = r#"{
            "device": {"team_id": "3", "light_id": "12"},
            "network": {
                "wifi_ssid": "street", "wifi_pass": "", "mqtt_host": "10.0.0.2",
                "mqtt_port": 1883, "mqtt_user": "", "mqtt_pass": ""
            },
            "signal": {"offline_policy": "local_cycle"}
        }"#;

        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(runtime.signal.offline_policy, OfflinePolicy::LocalCycle);
        assert_eq!(runtime.signal.fault_blink_ms, 500);
        assert_eq!(runtime.pins, PinConfig::default());
        assert_eq!(runtime.device.light_id, "12");
    }
}
