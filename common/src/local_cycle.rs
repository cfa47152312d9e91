use crate::{config::LocalCycleTiming, output::Frame, types::SignalColor};

const STEP_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct LocalCycle {
    timing: LocalCycleTiming,
    color: SignalColor,
    before_yellow: SignalColor,
    remaining_s: u16,
    next_step_ms: u64,
}

impl LocalCycle {
    pub fn new(timing: LocalCycleTiming) -> Self {
        Self {
            timing,
            color: SignalColor::Red,
            before_yellow: SignalColor::Red,
            remaining_s: timing.red_s,
            next_step_ms: 0,
        }
    }

    pub fn color(&self) -> SignalColor {
        self.color
    }

    pub fn remaining_s(&self) -> u16 {
        self.remaining_s
    }

    pub fn start(&mut self, now_ms: u64) -> Frame {
        self.color = SignalColor::Red;
        self.before_yellow = SignalColor::Red;
        self.remaining_s = self.timing.red_s;
        self.next_step_ms = now_ms.saturating_add(STEP_MS);
        self.frame()
    }

    pub fn step(&mut self, now_ms: u64) -> Option<Frame> {
        if now_ms < self.next_step_ms {
            return None;
        }
        self.next_step_ms = now_ms.saturating_add(STEP_MS);

        self.remaining_s = self.remaining_s.saturating_sub(1);
        if self.remaining_s == 0 {
            self.advance_phase();
        }

        Some(self.frame())
    }

    fn advance_phase(&mut self) {
        let (color, duration) = match self.color {
            SignalColor::Red | SignalColor::Green => {
                self.before_yellow = self.color;
                (SignalColor::Yellow, self.timing.yellow_s)
            }
            SignalColor::Yellow if self.before_yellow == SignalColor::Red => {
                (SignalColor::Green, self.timing.green_s)
            }
            SignalColor::Yellow | SignalColor::Off => (SignalColor::Red, self.timing.red_s),
        };
        self.color = color;
        self.remaining_s = duration;
    }

    fn frame(&self) -> Frame {
        Frame::normal(self.color, self.remaining_s)
    }
}
