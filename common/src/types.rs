use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalColor {
    Red,
    Yellow,
    Green,
    #[default]
    Off,
}

impl SignalColor {
    // Off has no wire code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Red),
            2 => Some(Self::Yellow),
            3 => Some(Self::Green),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Red => 1,
            Self::Yellow => 2,
            Self::Green => 3,
            Self::Off => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "RED",
            Self::Yellow => "YELLOW",
            Self::Green => "GREEN",
            Self::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationalStatus {
    #[default]
    Active,
    Broken,
    Fixing,
}

impl OperationalStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Broken),
            2 => Some(Self::Fixing),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Broken => 1,
            Self::Fixing => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Broken => "BROKEN",
            Self::Fixing => "FIXING",
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(self, Self::Broken | Self::Fixing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresentationMode {
    Offline,
    FaultBlink,
    Normal,
}

impl PresentationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::FaultBlink => "FAULT_BLINK",
            Self::Normal => "NORMAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeadStatus {
    pub color: &'static str,
    #[serde(rename = "colorCode")]
    pub color_code: u8,
    #[serde(rename = "displayValue")]
    pub display_value: u16,
    pub status: &'static str,
    #[serde(rename = "statusCode")]
    pub status_code: u8,
    pub online: bool,
    pub mode: &'static str,
    #[serde(rename = "remainingTime")]
    pub remaining_time_s: u16,
    #[serde(rename = "yellowDuration")]
    pub yellow_duration_s: u32,
    #[serde(rename = "rejectedEvents")]
    pub rejected_events: u64,
    #[serde(rename = "transportErrors")]
    pub transport_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_codes_only_cover_lit_colors() {
        assert_eq!(SignalColor::from_code(1), Some(SignalColor::Red));
        assert_eq!(SignalColor::from_code(2), Some(SignalColor::Yellow));
        assert_eq!(SignalColor::from_code(3), Some(SignalColor::Green));
        assert_eq!(SignalColor::from_code(0), None);
        assert_eq!(SignalColor::from_code(4), None);
        assert_eq!(SignalColor::Off.code(), 0);
    }

    #[test]
    fn broken_and_fixing_are_faults() {
        assert!(!OperationalStatus::Active.is_fault());
        assert!(OperationalStatus::Broken.is_fault());
        assert!(OperationalStatus::Fixing.is_fault());
        assert_eq!(OperationalStatus::from_code(3), None);
    }
}
