use crate::{
    config::{OfflinePolicy, SignalConfig},
    local_cycle::LocalCycle,
    output::Frame,
    state::RemoteState,
    types::PresentationMode,
};

#[derive(Debug, Clone)]
pub struct PresentationMachine {
    offline_blink_ms: u64,
    fault_blink_ms: u64,
    offline_policy: OfflinePolicy,
    mode: PresentationMode,
    blink_lit: bool,
    next_toggle_ms: u64,
    last_normal_frame: Option<Frame>,
    local_cycle: LocalCycle,
}

impl PresentationMachine {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            offline_blink_ms: config.offline_blink_ms,
            fault_blink_ms: config.fault_blink_ms,
            offline_policy: config.offline_policy,
            mode: PresentationMode::Normal,
            blink_lit: false,
            next_toggle_ms: 0,
            last_normal_frame: None,
            local_cycle: LocalCycle::new(config.local_cycle),
        }
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    pub fn desired_mode(online: bool, state: &RemoteState) -> PresentationMode {
        if !online {
            PresentationMode::Offline
        } else if state.status().is_fault() {
            PresentationMode::FaultBlink
        } else {
            PresentationMode::Normal
        }
    }

    pub fn update(&mut self, now_ms: u64, online: bool, state: &RemoteState) -> Option<Frame> {
        let desired = Self::desired_mode(online, state);
        if desired == self.mode {
            return None;
        }
        Some(self.enter(desired, now_ms, state))
    }

    pub fn reset(&mut self, now_ms: u64, online: bool, state: &RemoteState) -> Frame {
        self.enter(Self::desired_mode(online, state), now_ms, state)
    }

    // Only normal mode reflects remote fields.
    pub fn state_changed(&mut self, state: &RemoteState) -> Option<Frame> {
        if self.mode != PresentationMode::Normal {
            return None;
        }

        let frame = Frame::normal(state.color(), state.display_value());
        if self.last_normal_frame == Some(frame) {
            return None;
        }
        self.last_normal_frame = Some(frame);
        Some(frame)
    }

    pub fn step(&mut self, now_ms: u64) -> Option<Frame> {
        match (self.mode, self.offline_policy) {
            (PresentationMode::Normal, _) => None,
            (PresentationMode::FaultBlink, _) => {
                self.toggle(now_ms, self.fault_blink_ms, Frame::fault_lit())
            }
            (PresentationMode::Offline, OfflinePolicy::Blink) => {
                self.toggle(now_ms, self.offline_blink_ms, Frame::offline_lit())
            }
            (PresentationMode::Offline, OfflinePolicy::LocalCycle) => self.local_cycle.step(now_ms),
        }
    }

    fn enter(&mut self, mode: PresentationMode, now_ms: u64, state: &RemoteState) -> Frame {
        self.mode = mode;
        self.last_normal_frame = None;

        match (mode, self.offline_policy) {
            (PresentationMode::Normal, _) => {
                let frame = Frame::normal(state.color(), state.display_value());
                self.last_normal_frame = Some(frame);
                frame
            }
            (PresentationMode::FaultBlink, _) => {
                self.start_blink(now_ms, self.fault_blink_ms);
                Frame::fault_lit()
            }
            (PresentationMode::Offline, OfflinePolicy::Blink) => {
                self.start_blink(now_ms, self.offline_blink_ms);
                Frame::offline_lit()
            }
            (PresentationMode::Offline, OfflinePolicy::LocalCycle) => {
                self.local_cycle.start(now_ms)
            }
        }
    }

    fn start_blink(&mut self, now_ms: u64, interval_ms: u64) {
        self.blink_lit = true;
        self.next_toggle_ms = now_ms.saturating_add(interval_ms);
    }

    fn toggle(&mut self, now_ms: u64, interval_ms: u64, lit: Frame) -> Option<Frame> {
        if now_ms < self.next_toggle_ms {
            return None;
        }
        self.blink_lit = !self.blink_lit;
        self.next_toggle_ms = now_ms.saturating_add(interval_ms);

        Some(if self.blink_lit { lit } else { Frame::blank() })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::{OperationalStatus, SignalColor};

    fn red_ten() -> RemoteState {
        let mut state = RemoteState::default();
        state.set_color(SignalColor::Red);
        state.set_remaining_time(10);
        state
    }

    #[test]
    fn offline_outranks_fault() {
        let mut state = red_ten();
        state.set_status(OperationalStatus::Broken);

        assert_eq!(
            PresentationMachine::desired_mode(false, &state),
            PresentationMode::Offline
        );
        assert_eq!(
            PresentationMachine::desired_mode(true, &state),
            PresentationMode::FaultBlink
        );
        assert_eq!(
            PresentationMachine::desired_mode(true, &red_ten()),
            PresentationMode::Normal
        );
    }

    #[test]
    fn offline_blink_toggles_on_its_own_interval() {
        let mut machine = PresentationMachine::new(&SignalConfig::default());
        let state = red_ten();

        assert_eq!(machine.update(0, false, &state), Some(Frame::offline_lit()));
        assert_eq!(machine.step(299), None);
        assert_eq!(machine.step(300), Some(Frame::blank()));
        assert_eq!(machine.step(400), None);
        assert_eq!(machine.step(600), Some(Frame::offline_lit()));
    }

    #[test]
    fn fault_blink_uses_slower_interval() {
        let mut machine = PresentationMachine::new(&SignalConfig::default());
        let mut state = red_ten();
        state.set_status(OperationalStatus::Fixing);

        assert_eq!(machine.update(1_000, true, &state), Some(Frame::fault_lit()));
        assert_eq!(machine.step(1_300), None);
        assert_eq!(machine.step(1_500), Some(Frame::blank()));
        assert_eq!(machine.step(2_000), Some(Frame::fault_lit()));
    }

    #[test]
    fn normal_never_renders_on_timer() {
        let mut machine = PresentationMachine::new(&SignalConfig::default());
        machine.reset(0, true, &red_ten());

        for now in (0..10_000).step_by(100) {
            assert_eq!(machine.step(now), None);
        }
    }

    #[test]
    fn identical_normal_frame_is_suppressed() {
        let mut machine = PresentationMachine::new(&SignalConfig::default());
        let mut state = red_ten();
        machine.reset(0, true, &state);

        // Yellow duration does not affect a red countdown.
        state.set_yellow_duration(4);
        assert_eq!(machine.state_changed(&state), None);

        state.set_remaining_time(9);
        assert_eq!(
            machine.state_changed(&state),
            Some(Frame::normal(SignalColor::Red, 9))
        );
    }

    #[test]
    fn remote_changes_are_held_back_while_blinking() {
        let mut machine = PresentationMachine::new(&SignalConfig::default());
        let mut state = red_ten();
        machine.update(0, false, &state);

        state.set_color(SignalColor::Green);
        assert_eq!(machine.state_changed(&state), None);

        assert_eq!(
            machine.update(500, true, &state),
            Some(Frame::normal(SignalColor::Green, 10))
        );
    }

    #[test]
    fn local_cycle_policy_replaces_offline_blink() {
        let config = SignalConfig {
            offline_policy: OfflinePolicy::LocalCycle,
            ..SignalConfig::default()
        };
        let mut machine = PresentationMachine::new(&config);

        assert_eq!(
            machine.update(0, false, &red_ten()),
            Some(Frame::normal(SignalColor::Red, 39))
        );
        assert_eq!(machine.step(300), None);
        assert_eq!(machine.step(1_000), Some(Frame::normal(SignalColor::Red, 38)));
    }
}
