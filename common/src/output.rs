use serde::Serialize;

use crate::types::SignalColor;

pub const DISPLAY_DIGITS: usize = 4;
const DISPLAY_MAX: u16 = 9_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Lamps {
    pub red: bool,
    pub yellow: bool,
    pub green: bool,
}

impl Lamps {
    pub const OFF: Lamps = Lamps {
        red: false,
        yellow: false,
        green: false,
    };

    pub const ALL: Lamps = Lamps {
        red: true,
        yellow: true,
        green: true,
    };

    pub fn for_color(color: SignalColor) -> Self {
        Self {
            red: color == SignalColor::Red,
            yellow: color == SignalColor::Yellow,
            green: color == SignalColor::Green,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisplayContent {
    Number(u16),
    ZeroPadded(u16),
    Dashes,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glyph {
    Blank,
    Dash,
    Digit(u8),
}

impl DisplayContent {
    pub fn glyphs(self) -> [Glyph; DISPLAY_DIGITS] {
        match self {
            Self::Blank => [Glyph::Blank; DISPLAY_DIGITS],
            Self::Dashes => [Glyph::Dash; DISPLAY_DIGITS],
            Self::Number(value) => digits(value, false),
            Self::ZeroPadded(value) => digits(value, true),
        }
    }
}

fn digits(value: u16, leading_zeros: bool) -> [Glyph; DISPLAY_DIGITS] {
    let mut remaining = value.min(DISPLAY_MAX);
    let mut glyphs = [Glyph::Blank; DISPLAY_DIGITS];

    for (position, glyph) in glyphs.iter_mut().enumerate().rev() {
        let is_last = position == DISPLAY_DIGITS - 1;
        if remaining == 0 && !leading_zeros && !is_last {
            break;
        }
        *glyph = Glyph::Digit((remaining % 10) as u8);
        remaining /= 10;
    }

    glyphs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub lamps: Lamps,
    pub display: DisplayContent,
}

impl Frame {
    pub fn normal(color: SignalColor, display_value: u16) -> Self {
        Self {
            lamps: Lamps::for_color(color),
            display: DisplayContent::Number(display_value),
        }
    }

    pub fn blank() -> Self {
        Self {
            lamps: Lamps::OFF,
            display: DisplayContent::Blank,
        }
    }

    pub fn offline_lit() -> Self {
        Self {
            lamps: Lamps::ALL,
            display: DisplayContent::Dashes,
        }
    }

    pub fn fault_lit() -> Self {
        Self {
            lamps: Lamps::for_color(SignalColor::Red),
            display: DisplayContent::ZeroPadded(0),
        }
    }

    pub fn self_test() -> Self {
        Self {
            lamps: Lamps::OFF,
            display: DisplayContent::Number(8_888),
        }
    }
}

pub trait SignalOutput {
    fn show(&mut self, frame: &Frame);
}

impl<T: SignalOutput + ?Sized> SignalOutput for Box<T> {
    fn show(&mut self, frame: &Frame) {
        (**self).show(frame);
    }
}
