use log::{debug, info, warn};

use crate::{
    config::SignalConfig,
    connectivity::{ConnectivityMonitor, ConnectivityTransition, Reachability},
    output::{DisplayContent, Frame},
    presentation::PresentationMachine,
    reconciler::{reconcile, FieldPath},
    state::RemoteState,
    types::{HeadStatus, OperationalStatus, PresentationMode, SignalColor},
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Render(Frame),
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Field { path: String, payload: String },
    TransportError { message: String, code: i32 },
}

#[derive(Debug, Clone, Copy)]
struct RenderedSnapshot {
    color: SignalColor,
    display_value: u16,
    status: OperationalStatus,
}

#[derive(Debug, Clone)]
pub struct SignalEngine {
    pub config: SignalConfig,
    remote: RemoteState,
    monitor: ConnectivityMonitor,
    presentation: PresentationMachine,
    rendered: RenderedSnapshot,

    button_pressed_since_ms: Option<u64>,
    restart_requested: bool,

    rejected_events: u64,
    transport_errors: u64,
}

impl SignalEngine {
    pub fn new(mut config: SignalConfig) -> Self {
        config.sanitize();
        let remote = RemoteState::default();
        Self {
            monitor: ConnectivityMonitor::new(config.connectivity_check_interval_ms),
            presentation: PresentationMachine::new(&config),
            rendered: RenderedSnapshot {
                color: remote.color(),
                display_value: remote.display_value(),
                status: remote.status(),
            },
            config,
            remote,
            button_pressed_since_ms: None,
            restart_requested: false,
            rejected_events: 0,
            transport_errors: 0,
        }
    }

    pub fn remote_state(&self) -> &RemoteState {
        &self.remote
    }

    pub fn mode(&self) -> PresentationMode {
        self.presentation.mode()
    }

    pub fn start(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let frame = self
            .presentation
            .reset(now_ms, self.monitor.is_online(), &self.remote);
        let mut actions = Vec::new();
        self.render(frame, &mut actions);
        actions
    }

    pub fn run_iteration<I, R>(
        &mut self,
        now_ms: u64,
        events: I,
        link: &R,
        button_pressed: bool,
    ) -> Vec<EngineAction>
    where
        I: IntoIterator<Item = InboundEvent>,
        R: Reachability + ?Sized,
    {
        let mut actions = Vec::new();
        for event in events {
            actions.append(&mut self.handle_event(event, now_ms));
        }
        actions.append(&mut self.tick(now_ms, link));
        actions.append(&mut self.update_button(button_pressed, now_ms));
        actions
    }

    pub fn handle_event(&mut self, event: InboundEvent, now_ms: u64) -> Vec<EngineAction> {
        match event {
            InboundEvent::Field { path, payload } => {
                self.handle_field_event(&path, &payload, now_ms)
            }
            InboundEvent::TransportError { message, code } => {
                self.handle_transport_error(&message, code);
                Vec::new()
            }
        }
    }

    pub fn handle_field_event(
        &mut self,
        path: &str,
        payload: &str,
        now_ms: u64,
    ) -> Vec<EngineAction> {
        let Some(field_path) = FieldPath::parse(path) else {
            debug!("ignoring event for unknown path `{path}`");
            return Vec::new();
        };

        let report = reconcile(&mut self.remote, field_path, payload);
        self.rejected_events = self
            .rejected_events
            .saturating_add(report.rejected.len() as u64);

        let mut actions = Vec::new();
        if !report.render_needed() {
            return actions;
        }

        let frame = match self
            .presentation
            .update(now_ms, self.monitor.is_online(), &self.remote)
        {
            Some(frame) => {
                self.log_mode_entry();
                Some(frame)
            }
            None => self.presentation.state_changed(&self.remote),
        };

        if let Some(frame) = frame {
            self.render(frame, &mut actions);
        }
        actions
    }

    pub fn handle_transport_error(&mut self, message: &str, code: i32) {
        self.transport_errors = self.transport_errors.saturating_add(1);
        warn!("stream error: {message}, code: {code}");
    }

    pub fn tick<R: Reachability + ?Sized>(&mut self, now_ms: u64, link: &R) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        match self.monitor.poll(now_ms, link) {
            Some(ConnectivityTransition::EnteredOffline) => {
                warn!("coordinator unreachable; entering offline mode");
            }
            Some(ConnectivityTransition::EnteredOnline) => {
                info!("coordinator reachable again; restoring normal operation");
            }
            None => {}
        }

        let frame = match self
            .presentation
            .update(now_ms, self.monitor.is_online(), &self.remote)
        {
            Some(frame) => {
                self.log_mode_entry();
                Some(frame)
            }
            None => self.presentation.step(now_ms),
        };

        if let Some(frame) = frame {
            self.render(frame, &mut actions);
        }
        actions
    }

    // One restart per press once held for `override_hold_ms`.
    pub fn update_button(&mut self, pressed: bool, now_ms: u64) -> Vec<EngineAction> {
        if !pressed {
            self.button_pressed_since_ms = None;
            self.restart_requested = false;
            return Vec::new();
        }

        let Some(since) = self.button_pressed_since_ms else {
            self.button_pressed_since_ms = Some(now_ms);
            return Vec::new();
        };

        if self.restart_requested || now_ms.saturating_sub(since) < self.config.override_hold_ms {
            return Vec::new();
        }

        self.restart_requested = true;
        warn!("override button held; restarting");
        vec![EngineAction::Restart]
    }

    pub fn current_color(&self) -> SignalColor {
        self.rendered.color
    }

    pub fn current_display_value(&self) -> u16 {
        self.rendered.display_value
    }

    pub fn current_status(&self) -> OperationalStatus {
        self.rendered.status
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn snapshot(&self) -> HeadStatus {
        HeadStatus {
            color: self.rendered.color.as_str(),
            color_code: self.rendered.color.code(),
            display_value: self.rendered.display_value,
            status: self.rendered.status.as_str(),
            status_code: self.rendered.status.code(),
            online: self.is_online(),
            mode: self.mode().as_str(),
            remaining_time_s: self.remote.remaining_time_s(),
            yellow_duration_s: self.remote.yellow_duration_s(),
            rejected_events: self.rejected_events,
            transport_errors: self.transport_errors,
        }
    }

    fn render(&mut self, frame: Frame, actions: &mut Vec<EngineAction>) {
        self.rendered.status = self.remote.status();
        if self.mode() == PresentationMode::Normal {
            self.rendered.color = self.remote.color();
            if let DisplayContent::Number(value) = frame.display {
                self.rendered.display_value = value;
            }
        }
        actions.push(EngineAction::Render(frame));
    }

    fn log_mode_entry(&self) {
        match self.mode() {
            PresentationMode::Offline => info!("rendering offline fallback"),
            PresentationMode::FaultBlink => {
                info!("fault reported ({}); blinking red", self.remote.status().as_str())
            }
            PresentationMode::Normal => info!(
                "rendering {} with {}s",
                self.remote.color().as_str(),
                self.remote.display_value()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;

    fn field(path: &str, payload: &str) -> InboundEvent {
        InboundEvent::Field {
            path: path.to_string(),
            payload: payload.to_string(),
        }
    }

    fn renders(actions: &[EngineAction]) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Render(frame) => Some(*frame),
                EngineAction::Restart => None,
            })
            .collect()
    }

    fn red_ten(link: &Cell<bool>) -> SignalEngine {
        let mut engine = SignalEngine::new(SignalConfig::default());
        engine.start(0);
        engine.tick(0, link);
        engine.handle_field_event("/color", "1", 0);
        engine.handle_field_event("/remaintime", "10", 0);
        engine
    }

    #[test]
    fn start_paints_safe_defaults() {
        let mut engine = SignalEngine::new(SignalConfig::default());
        let actions = engine.start(0);

        assert_eq!(
            actions,
            vec![EngineAction::Render(Frame::normal(SignalColor::Off, 0))]
        );
        assert_eq!(engine.mode(), PresentationMode::Normal);
    }

    #[test]
    fn duplicate_push_renders_once() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        let first = engine.handle_field_event("/remaintime", "9", 10);
        let second = engine.handle_field_event("/remaintime", "9", 20);

        assert_eq!(renders(&first), vec![Frame::normal(SignalColor::Red, 9)]);
        assert!(second.is_empty());
    }

    #[test]
    fn invalid_push_keeps_state_and_output() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);
        let before = *engine.remote_state();

        for (path, payload) in [("/color", "0"), ("/remaintime", "10000"), ("/status", "5")] {
            assert!(engine.handle_field_event(path, payload, 10).is_empty());
        }

        assert_eq!(*engine.remote_state(), before);
        assert_eq!(engine.snapshot().rejected_events, 3);
    }

    #[test]
    fn snapshot_renders_once_for_many_fields() {
        let link = Cell::new(true);
        let mut engine = SignalEngine::new(SignalConfig::default());
        engine.start(0);
        engine.tick(0, &link);

        let actions = engine.handle_field_event(
            "/",
            r#"{"color":3,"remaintime":45,"yellow_duration":5,"status":0}"#,
            10,
        );

        assert_eq!(renders(&actions), vec![Frame::normal(SignalColor::Green, 40)]);
        assert_eq!(engine.current_display_value(), 40);
        assert_eq!(engine.current_color(), SignalColor::Green);
    }

    #[test]
    fn red_shows_full_remaining_time() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);
        engine.handle_field_event("/yellow_duration", "5", 10);
        engine.handle_field_event("/remaintime", "45", 20);

        assert_eq!(engine.current_display_value(), 45);
    }

    #[test]
    fn losing_link_overrides_normal_immediately() {
        let link = Cell::new(true);
        let mut engine = SignalEngine::new(SignalConfig::default());
        engine.start(0);
        engine.tick(0, &link);
        engine.handle_field_event("/", r#"{"color":3,"remaintime":20}"#, 0);

        link.set(false);
        let actions = engine.tick(5_000, &link);

        assert_eq!(renders(&actions), vec![Frame::offline_lit()]);
        assert_eq!(engine.mode(), PresentationMode::Offline);
        assert!(!engine.is_online());
    }

    #[test]
    fn regaining_link_repaints_without_field_changes() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        link.set(false);
        engine.tick(5_000, &link);
        engine.tick(5_300, &link);

        link.set(true);
        let actions = engine.tick(10_000, &link);

        assert_eq!(renders(&actions), vec![Frame::normal(SignalColor::Red, 10)]);
        assert!(engine.is_online());
    }

    #[test]
    fn changes_during_outage_are_shown_on_reconnect() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        link.set(false);
        engine.tick(5_000, &link);
        assert!(engine.handle_field_event("/color", "3", 6_000).is_empty());

        link.set(true);
        let actions = engine.tick(10_000, &link);

        assert_eq!(renders(&actions), vec![Frame::normal(SignalColor::Green, 10)]);
    }

    #[test]
    fn fault_round_trip_restores_previous_picture() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        let broken = engine.handle_field_event("/status", "1", 100);
        assert_eq!(renders(&broken), vec![Frame::fault_lit()]);
        assert_eq!(engine.mode(), PresentationMode::FaultBlink);
        assert_eq!(engine.current_status(), OperationalStatus::Broken);

        let blink = engine.tick(600, &link);
        assert_eq!(renders(&blink), vec![Frame::blank()]);

        let active = engine.handle_field_event("/status", "0", 700);
        assert_eq!(renders(&active), vec![Frame::normal(SignalColor::Red, 10)]);
        assert_eq!(engine.mode(), PresentationMode::Normal);
    }

    #[test]
    fn snapshot_with_only_status_marks_broken() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);
        engine.handle_field_event("/yellow_duration", "3", 0);

        engine.handle_field_event("", r#"{"status":1}"#, 100);

        let remote = engine.remote_state();
        assert_eq!(remote.status(), OperationalStatus::Broken);
        assert_eq!(remote.color(), SignalColor::Red);
        assert_eq!(remote.remaining_time_s(), 10);
        assert_eq!(remote.yellow_duration_s(), 3);
    }

    #[test]
    fn offline_outranks_fault_status() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);
        engine.handle_field_event("/status", "2", 0);

        link.set(false);
        let actions = engine.tick(5_000, &link);

        assert_eq!(renders(&actions), vec![Frame::offline_lit()]);
    }

    #[test]
    fn transport_errors_do_not_touch_state() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);
        let before = *engine.remote_state();

        let actions = engine.handle_event(
            InboundEvent::TransportError {
                message: "connection reset".to_string(),
                code: -1,
            },
            10,
        );

        assert!(actions.is_empty());
        assert_eq!(*engine.remote_state(), before);
        assert_eq!(engine.snapshot().transport_errors, 1);
    }

    #[test]
    fn unknown_paths_are_ignored() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        assert!(engine.handle_field_event("/online", "true", 10).is_empty());
        assert_eq!(engine.snapshot().rejected_events, 0);
    }

    #[test]
    fn held_button_requests_one_restart() {
        let mut engine = SignalEngine::new(SignalConfig::default());

        assert!(engine.update_button(true, 0).is_empty());
        assert!(engine.update_button(true, 2_999).is_empty());
        assert_eq!(engine.update_button(true, 3_000), vec![EngineAction::Restart]);
        assert!(engine.update_button(true, 5_000).is_empty());

        assert!(engine.update_button(false, 5_100).is_empty());
        assert!(engine.update_button(true, 5_200).is_empty());
        assert_eq!(engine.update_button(true, 8_200), vec![EngineAction::Restart]);
    }

    #[test]
    fn short_presses_are_ignored() {
        let mut engine = SignalEngine::new(SignalConfig::default());

        engine.update_button(true, 0);
        engine.update_button(false, 2_000);
        engine.update_button(true, 2_500);

        assert!(engine.update_button(true, 4_000).is_empty());
    }

    #[test]
    fn iteration_applies_events_in_arrival_order() {
        let link = Cell::new(true);
        let mut engine = red_ten(&link);

        let actions = engine.run_iteration(
            100,
            vec![
                field("/remaintime", "8"),
                field("/remaintime", "7"),
                field("/remaintime", "7"),
            ],
            &link,
            false,
        );

        assert_eq!(
            renders(&actions),
            vec![
                Frame::normal(SignalColor::Red, 8),
                Frame::normal(SignalColor::Red, 7),
            ]
        );
    }

    #[test]
    fn status_snapshot_reports_rendered_values() {
        let link = Cell::new(true);
        let engine = red_ten(&link);
        let status = engine.snapshot();

        assert_eq!(status.color, "RED");
        assert_eq!(status.color_code, 1);
        assert_eq!(status.display_value, 10);
        assert_eq!(status.status, "ACTIVE");
        assert!(status.online);
        assert_eq!(status.mode, "NORMAL");
    }
}
