use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use signal_common::{HeadStatus, HeadTopics, InboundEvent, OfflinePolicy, RuntimeConfig};

// Epochs before this mean SNTP has not set the clock yet.
const CLOCK_SYNCED_EPOCH: i64 = 1_600_000_000;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigView {
    #[serde(rename = "teamId")]
    pub team_id: String,
    #[serde(rename = "lightId")]
    pub light_id: String,
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    pub mqtt_pass_set: bool,
    #[serde(rename = "offlinePolicy")]
    pub offline_policy: OfflinePolicy,
}

impl ConfigView {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            team_id: runtime.device.team_id.clone(),
            light_id: runtime.device.light_id.clone(),
            wifi_ssid: runtime.network.wifi_ssid.clone(),
            wifi_pass_set: !runtime.network.wifi_pass.is_empty(),
            mqtt_host: runtime.network.mqtt_host.clone(),
            mqtt_port: runtime.network.mqtt_port,
            mqtt_user: runtime.network.mqtt_user.clone(),
            mqtt_pass_set: !runtime.network.mqtt_pass.is_empty(),
            offline_policy: runtime.signal.offline_policy,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "teamId", default)]
    pub team_id: Option<String>,
    #[serde(rename = "lightId", default)]
    pub light_id: Option<String>,
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(rename = "mqttHost", default)]
    pub mqtt_host: Option<String>,
    #[serde(rename = "mqttPort", default)]
    pub mqtt_port: Option<u16>,
    #[serde(rename = "mqttUser", default)]
    pub mqtt_user: Option<String>,
    #[serde(rename = "mqttPass", default)]
    pub mqtt_pass: Option<String>,
    #[serde(rename = "offlinePolicy", default)]
    pub offline_policy: Option<OfflinePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigUpdateError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} cannot contain '/', '#' or '+'")]
    InvalidTopicSegment(&'static str),
    #[error("mqttPort must be between 1 and 65535")]
    InvalidPort,
}

#[derive(Debug, Serialize)]
pub struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub config: ConfigView,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset: bool,
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
}

impl ConfigUpdate {
    pub fn validate(&self) -> Result<(), ConfigUpdateError> {
        for (name, value) in [("teamId", &self.team_id), ("lightId", &self.light_id)] {
            let Some(value) = value else {
                continue;
            };
            if value.trim().is_empty() {
                return Err(ConfigUpdateError::Empty(name));
            }
            if value.contains(['/', '#', '+']) {
                return Err(ConfigUpdateError::InvalidTopicSegment(name));
            }
        }

        if matches!(&self.wifi_ssid, Some(ssid) if ssid.trim().is_empty()) {
            return Err(ConfigUpdateError::Empty("wifiSsid"));
        }
        if matches!(&self.mqtt_host, Some(host) if host.trim().is_empty()) {
            return Err(ConfigUpdateError::Empty("mqttHost"));
        }
        if self.mqtt_port == Some(0) {
            return Err(ConfigUpdateError::InvalidPort);
        }

        Ok(())
    }

    pub fn apply(self, runtime: &mut RuntimeConfig) -> Result<ConfigUpdateResponse, ConfigUpdateError> {
        self.validate()?;
        let previous = runtime.clone();

        if let Some(team_id) = self.team_id {
            runtime.device.team_id = team_id;
        }
        if let Some(light_id) = self.light_id {
            runtime.device.light_id = light_id;
        }
        if let Some(ssid) = self.wifi_ssid {
            runtime.network.wifi_ssid = ssid.trim().to_string();
        }
        if let Some(pass) = self.wifi_pass {
            runtime.network.wifi_pass = pass;
        }
        if let Some(host) = self.mqtt_host {
            runtime.network.mqtt_host = host.trim().to_string();
        }
        if let Some(port) = self.mqtt_port {
            runtime.network.mqtt_port = port;
        }
        if let Some(user) = self.mqtt_user {
            runtime.network.mqtt_user = user;
        }
        if let Some(pass) = self.mqtt_pass {
            runtime.network.mqtt_pass = pass;
        }
        if let Some(policy) = self.offline_policy {
            runtime.signal.offline_policy = policy;
        }
        runtime.sanitize();

        Ok(ConfigUpdateResponse {
            restart_required: *runtime != previous,
            config: ConfigView::from_runtime(runtime),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DroppedMessage {
    #[error("oversized payload ({0} bytes)")]
    Oversized(usize),
    #[error("topic is outside this head's tree")]
    ForeignTopic,
    #[error("payload is not utf8")]
    NotUtf8,
}

pub fn inbound_field_event(
    topics: &HeadTopics,
    topic: &str,
    payload: &[u8],
    max_payload_bytes: usize,
) -> Result<InboundEvent, DroppedMessage> {
    if payload.len() > max_payload_bytes {
        return Err(DroppedMessage::Oversized(payload.len()));
    }
    let path = topics
        .relative_path(topic)
        .ok_or(DroppedMessage::ForeignTopic)?;
    let payload = std::str::from_utf8(payload).map_err(|_| DroppedMessage::NotUtf8)?;

    Ok(InboundEvent::Field {
        path: path.to_string(),
        payload: payload.to_string(),
    })
}

// Heartbeat slots are only consumed while the link is up, so the first
// beat after a reconnect goes out immediately.
#[cfg_attr(not(feature = "esp32"), allow(dead_code))]
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval_ms: u64,
    last_ms: Option<u64>,
}

#[cfg_attr(not(feature = "esp32"), allow(dead_code))]
impl HeartbeatSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    pub fn due(&mut self, now_ms: u64, reachable: bool) -> bool {
        if !reachable {
            self.last_ms = None;
            return false;
        }
        let due = self
            .last_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.interval_ms);
        if due {
            self.last_ms = Some(now_ms);
        }
        due
    }
}

// Heartbeat body published to `{base}/telemetry`.
#[derive(Debug, Serialize)]
pub struct TelemetryPayload {
    #[serde(flatten)]
    pub status: HeadStatus,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    pub timestamp: Option<i64>,
}

impl TelemetryPayload {
    pub fn new(status: HeadStatus, uptime_ms: u64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            status,
            uptime_ms,
            timestamp: (now >= CLOCK_SYNCED_EPOCH).then_some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use signal_common::{SignalConfig, SignalEngine};

    use super::*;

    fn stored() -> RuntimeConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.network.wifi_ssid = "street".to_string();
        runtime.network.wifi_pass = "secret".to_string();
        runtime.network.mqtt_pass = "broker".to_string();
        runtime
    }

    #[test]
    fn view_hides_secrets() {
        let view = ConfigView::from_runtime(&stored());

        assert!(view.wifi_pass_set);
        assert!(view.mqtt_pass_set);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("broker"));
    }

    #[test]
    fn absent_passwords_are_kept() {
        let mut runtime = stored();
        let update = ConfigUpdate {
            light_id: Some("12".to_string()),
            ..ConfigUpdate::default()
        };

        let response = update.apply(&mut runtime).unwrap();

        assert!(response.restart_required);
        assert_eq!(runtime.device.light_id, "12");
        assert_eq!(runtime.network.wifi_pass, "secret");
        assert_eq!(runtime.network.mqtt_pass, "broker");
    }

    #[test]
    fn hotspot_ssid_is_stored_as_ascii() {
        let mut runtime = stored();
        let update = ConfigUpdate {
            wifi_ssid: Some("Bob\u{2019}s iPhone".to_string()),
            ..ConfigUpdate::default()
        };

        let response = update.apply(&mut runtime).unwrap();

        assert_eq!(runtime.network.wifi_ssid, "Bob's iPhone");
        assert_eq!(response.config.wifi_ssid, "Bob's iPhone");
    }

    #[test]
    fn unchanged_update_needs_no_restart() {
        let mut runtime = stored();
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"mqttHost": "192.168.1.100", "offlinePolicy": "blink"}"#)
                .unwrap();

        let response = update.apply(&mut runtime).unwrap();

        assert!(!response.restart_required);
    }

    #[test]
    fn rejects_bad_updates_without_touching_config() {
        let cases = [
            (
                ConfigUpdate {
                    team_id: Some("10/#".to_string()),
                    ..ConfigUpdate::default()
                },
                ConfigUpdateError::InvalidTopicSegment("teamId"),
            ),
            (
                ConfigUpdate {
                    mqtt_host: Some("  ".to_string()),
                    ..ConfigUpdate::default()
                },
                ConfigUpdateError::Empty("mqttHost"),
            ),
            (
                ConfigUpdate {
                    mqtt_port: Some(0),
                    ..ConfigUpdate::default()
                },
                ConfigUpdateError::InvalidPort,
            ),
        ];

        for (update, expected) in cases {
            let mut runtime = stored();
            assert_eq!(update.apply(&mut runtime).unwrap_err(), expected);
            assert_eq!(runtime, stored());
        }
    }

    #[test]
    fn broker_messages_become_field_events() {
        let topics = HeadTopics::new("10", "10");

        assert_eq!(
            inbound_field_event(&topics, "traffic/teams/10/traffic_lights/10/status", b"1", 512),
            Ok(InboundEvent::Field {
                path: "/status".to_string(),
                payload: "1".to_string(),
            })
        );
        assert_eq!(
            inbound_field_event(&topics, "traffic/teams/10/traffic_lights/10", &[b' '; 600], 512),
            Err(DroppedMessage::Oversized(600))
        );
        assert_eq!(
            inbound_field_event(&topics, "traffic/teams/9/traffic_lights/10/color", b"1", 512),
            Err(DroppedMessage::ForeignTopic)
        );
        assert_eq!(
            inbound_field_event(&topics, "traffic/teams/10/traffic_lights/10/color", &[0xff], 512),
            Err(DroppedMessage::NotUtf8)
        );
    }

    #[test]
    fn heartbeat_waits_for_link_and_interval() {
        let mut heartbeat = HeartbeatSchedule::new(10_000);

        assert!(!heartbeat.due(0, false));
        assert!(heartbeat.due(500, true));
        assert!(!heartbeat.due(5_000, true));
        assert!(heartbeat.due(10_500, true));
        assert!(!heartbeat.due(11_000, false));
        assert!(heartbeat.due(12_000, true));
    }

    #[test]
    fn telemetry_flattens_head_status() {
        let engine = SignalEngine::new(SignalConfig::default());
        let payload = TelemetryPayload::new(engine.snapshot(), 1_234);

        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["color"], "OFF");
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["uptimeMs"], 1_234);
        assert_eq!(json["online"], true);
    }
}
