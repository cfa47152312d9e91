use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    state::{RemoteState, MAX_REMAINING_TIME_S},
    types::{OperationalStatus, SignalColor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Color,
    RemainingTime,
    YellowDuration,
    Status,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Color,
        Field::RemainingTime,
        Field::YellowDuration,
        Field::Status,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::RemainingTime => "remaintime",
            Self::YellowDuration => "yellow_duration",
            Self::Status => "status",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "color" => Some(Self::Color),
            "remaintime" | "remaining_time" | "remaining-time" | "remainingTime" => {
                Some(Self::RemainingTime)
            }
            "yellow_duration" | "yellow-phase-duration" | "yellowDuration" => {
                Some(Self::YellowDuration)
            }
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath {
    Field(Field),
    Root,
}

impl FieldPath {
    // Only the last segment matters, so `/color` and
    // `/teams/10/traffic_lights/10/color` both name the color field.
    pub fn parse(path: &str) -> Option<Self> {
        let trimmed = path.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Some(Self::Root);
        }
        let leaf = trimmed.rsplit('/').next().unwrap_or(trimmed);
        Field::from_key(leaf).map(Self::Field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload `{0}` is not an integer")]
    NotAnInteger(String),
    #[error("color code {0} is outside 1..=3")]
    ColorOutOfRange(i64),
    #[error("remaining time {0} is outside 0..=9999")]
    RemainingTimeOutOfRange(i64),
    #[error("yellow duration {0} is out of range")]
    YellowDurationOutOfRange(i64),
    #[error("status code {0} is outside 0..=2")]
    StatusOutOfRange(i64),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("snapshot is not a JSON object")]
    SnapshotNotObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    Color(SignalColor),
    RemainingTime(u16),
    YellowDuration(u32),
    Status(OperationalStatus),
}

impl FieldUpdate {
    pub fn validate(field: Field, value: i64) -> Result<Self, ValidationError> {
        match field {
            Field::Color => SignalColor::from_code(value)
                .map(Self::Color)
                .ok_or(ValidationError::ColorOutOfRange(value)),
            Field::RemainingTime => u16::try_from(value)
                .ok()
                .filter(|seconds| *seconds <= MAX_REMAINING_TIME_S)
                .map(Self::RemainingTime)
                .ok_or(ValidationError::RemainingTimeOutOfRange(value)),
            Field::YellowDuration => u32::try_from(value)
                .map(Self::YellowDuration)
                .map_err(|_| ValidationError::YellowDurationOutOfRange(value)),
            Field::Status => OperationalStatus::from_code(value)
                .map(Self::Status)
                .ok_or(ValidationError::StatusOutOfRange(value)),
        }
    }

    pub fn field(self) -> Field {
        match self {
            Self::Color(_) => Field::Color,
            Self::RemainingTime(_) => Field::RemainingTime,
            Self::YellowDuration(_) => Field::YellowDuration,
            Self::Status(_) => Field::Status,
        }
    }

    pub fn apply(self, state: &mut RemoteState) -> bool {
        match self {
            Self::Color(color) => state.set_color(color),
            Self::RemainingTime(seconds) => state.set_remaining_time(seconds),
            Self::YellowDuration(seconds) => state.set_yellow_duration(seconds),
            Self::Status(status) => state.set_status(status),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub changed: Vec<Field>,
    pub rejected: Vec<(FieldPath, ValidationError)>,
}

impl ReconcileReport {
    pub fn render_needed(&self) -> bool {
        !self.changed.is_empty()
    }
}

pub fn reconcile(state: &mut RemoteState, path: FieldPath, payload: &str) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    match path {
        FieldPath::Field(field) => {
            match parse_integer(payload).and_then(|value| FieldUpdate::validate(field, value)) {
                Ok(update) => apply_update(state, update, &mut report),
                Err(err) => report.rejected.push((path, err)),
            }
        }
        FieldPath::Root => match parse_snapshot(payload) {
            Ok(entries) => {
                for (field, value) in entries {
                    match integer_from_value(&value)
                        .and_then(|value| FieldUpdate::validate(field, value))
                    {
                        Ok(update) => apply_update(state, update, &mut report),
                        Err(err) => report.rejected.push((FieldPath::Field(field), err)),
                    }
                }
            }
            Err(err) => report.rejected.push((path, err)),
        },
    }

    for (path, err) in &report.rejected {
        warn!("dropping {path:?} update: {err}");
    }

    report
}

fn apply_update(state: &mut RemoteState, update: FieldUpdate, report: &mut ReconcileReport) {
    if !update.apply(state) {
        debug!("ignoring unchanged {:?}", update.field());
        return;
    }

    match update {
        FieldUpdate::Color(color) => info!("light changed: {}", color.as_str()),
        FieldUpdate::RemainingTime(seconds) => {
            // The countdown ticks every second; keep the log readable.
            if seconds % 5 == 0 || seconds <= 5 {
                info!(
                    "time: {seconds}s (display: {}s)",
                    state.display_value()
                );
            } else {
                debug!("time: {seconds}s");
            }
        }
        FieldUpdate::YellowDuration(seconds) => info!("yellow duration: {seconds}s"),
        FieldUpdate::Status(status) => info!("status changed: {}", status.as_str()),
    }

    report.changed.push(update.field());
}

fn parse_snapshot(payload: &str) -> Result<Vec<(Field, Value)>, ValidationError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| ValidationError::MalformedSnapshot(err.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ValidationError::SnapshotNotObject);
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| Field::from_key(&key).map(|field| (field, value)))
        .collect())
}

fn parse_integer(payload: &str) -> Result<i64, ValidationError> {
    let trimmed = payload.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => integer_from_value(&value),
        Err(_) => trimmed
            .parse::<i64>()
            .map_err(|_| ValidationError::NotAnInteger(trimmed.to_string())),
    }
}

fn integer_from_value(value: &Value) -> Result<i64, ValidationError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                    .map(|float| float as i64)
            })
            .ok_or_else(|| ValidationError::NotAnInteger(number.to_string())),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| ValidationError::NotAnInteger(text.clone())),
        other => Err(ValidationError::NotAnInteger(other.to_string())),
    }
}
