use crate::types::{OperationalStatus, SignalColor};

pub const MAX_REMAINING_TIME_S: u16 = 9_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteState {
    color: SignalColor,
    remaining_time_s: u16,
    yellow_duration_s: u32,
    status: OperationalStatus,
}

impl RemoteState {
    pub fn color(&self) -> SignalColor {
        self.color
    }

    pub fn remaining_time_s(&self) -> u16 {
        self.remaining_time_s
    }

    pub fn yellow_duration_s(&self) -> u32 {
        self.yellow_duration_s
    }

    pub fn status(&self) -> OperationalStatus {
        self.status
    }

    pub fn set_color(&mut self, color: SignalColor) -> bool {
        if self.color != color {
            self.color = color;
            true
        } else {
            false
        }
    }

    pub fn set_remaining_time(&mut self, seconds: u16) -> bool {
        let seconds = seconds.min(MAX_REMAINING_TIME_S);
        if self.remaining_time_s != seconds {
            self.remaining_time_s = seconds;
            true
        } else {
            false
        }
    }

    pub fn set_yellow_duration(&mut self, seconds: u32) -> bool {
        if self.yellow_duration_s != seconds {
            self.yellow_duration_s = seconds;
            true
        } else {
            false
        }
    }

    pub fn set_status(&mut self, status: OperationalStatus) -> bool {
        if self.status != status {
            self.status = status;
            true
        } else {
            false
        }
    }

    // While an active head is green the yellow phase is still part of the
    // remaining time, so it is taken off here.
    pub fn display_value(&self) -> u16 {
        if self.status == OperationalStatus::Active && self.color == SignalColor::Green {
            let yellow = u16::try_from(self.yellow_duration_s).unwrap_or(u16::MAX);
            self.remaining_time_s.saturating_sub(yellow)
        } else {
            self.remaining_time_s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(color: SignalColor, remaining: u16, yellow: u32) -> RemoteState {
        let mut state = RemoteState::default();
        state.set_color(color);
        state.set_remaining_time(remaining);
        state.set_yellow_duration(yellow);
        state
    }

    #[test]
    fn defaults_are_safe() {
        let state = RemoteState::default();
        assert_eq!(state.color(), SignalColor::Off);
        assert_eq!(state.remaining_time_s(), 0);
        assert_eq!(state.yellow_duration_s(), 0);
        assert_eq!(state.status(), OperationalStatus::Active);
    }

    #[test]
    fn green_display_excludes_yellow_phase() {
        assert_eq!(state(SignalColor::Green, 45, 5).display_value(), 40);
        assert_eq!(state(SignalColor::Red, 45, 5).display_value(), 45);
        assert_eq!(state(SignalColor::Yellow, 45, 5).display_value(), 45);
    }

    #[test]
    fn green_display_never_goes_negative() {
        assert_eq!(state(SignalColor::Green, 3, 5).display_value(), 0);
        assert_eq!(state(SignalColor::Green, 3, u32::MAX).display_value(), 0);
    }

    #[test]
    fn faulted_green_shows_raw_time() {
        let mut state = state(SignalColor::Green, 45, 5);
        state.set_status(OperationalStatus::Broken);
        assert_eq!(state.display_value(), 45);
    }

    #[test]
    fn setters_report_changes_only() {
        let mut state = RemoteState::default();
        assert!(state.set_color(SignalColor::Red));
        assert!(!state.set_color(SignalColor::Red));
        assert!(state.set_remaining_time(10));
        assert!(!state.set_remaining_time(10));
        assert!(!state.set_status(OperationalStatus::Active));
    }
}
