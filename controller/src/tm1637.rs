use anyhow::{anyhow, Context};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver},
};

use signal_common::{output::DISPLAY_DIGITS, Glyph};

const CMD_DATA_AUTO_INCREMENT: u8 = 0x40;
const CMD_ADDRESS_ZERO: u8 = 0xC0;
const CMD_DISPLAY_ON: u8 = 0x88;
const MAX_BRIGHTNESS: u8 = 7;
const BIT_DELAY_US: u32 = 5;

const DIGIT_SEGMENTS: [u8; 10] = [0x3F, 0x06, 0x5B, 0x4F, 0x66, 0x6D, 0x7D, 0x07, 0x7F, 0x6F];
const DASH_SEGMENTS: u8 = 0x40;

// DIO runs open-drain so the chip can pull it low to acknowledge.
pub struct Tm1637 {
    clk: PinDriver<'static, AnyOutputPin, Output>,
    dio: PinDriver<'static, AnyIOPin, InputOutput>,
    brightness: u8,
}

impl Tm1637 {
    pub fn new(clk_pin: i32, dio_pin: i32, brightness: u8) -> anyhow::Result<Self> {
        if clk_pin < 0 || dio_pin < 0 {
            return Err(anyhow!("invalid display pins clk={clk_pin} dio={dio_pin}"));
        }

        let clk = unsafe { PinDriver::output(AnyOutputPin::new(clk_pin)) }
            .with_context(|| format!("failed to claim display CLK on GPIO{clk_pin}"))?;
        let dio = unsafe { PinDriver::input_output_od(AnyIOPin::new(dio_pin)) }
            .with_context(|| format!("failed to claim display DIO on GPIO{dio_pin}"))?;

        let mut display = Self {
            clk,
            dio,
            brightness: brightness.min(MAX_BRIGHTNESS),
        };
        display.clk.set_high()?;
        display.dio.set_high()?;
        Ok(display)
    }

    pub fn show(&mut self, glyphs: &[Glyph; DISPLAY_DIGITS]) -> anyhow::Result<()> {
        self.command(&[CMD_DATA_AUTO_INCREMENT])?;

        let mut frame = [CMD_ADDRESS_ZERO; DISPLAY_DIGITS + 1];
        for (slot, glyph) in frame[1..].iter_mut().zip(glyphs) {
            *slot = segments(*glyph);
        }
        self.command(&frame)?;

        self.command(&[CMD_DISPLAY_ON | self.brightness])
    }

    fn command(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.start()?;
        let result = bytes.iter().try_for_each(|byte| self.write_byte(*byte));
        self.stop()?;
        result
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.dio.set_high()?;
        self.clk.set_high()?;
        delay();
        self.dio.set_low()?;
        delay();
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.clk.set_low()?;
        self.dio.set_low()?;
        delay();
        self.clk.set_high()?;
        delay();
        self.dio.set_high()?;
        delay();
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> anyhow::Result<()> {
        for bit in 0..8 {
            self.clk.set_low()?;
            if byte & (1 << bit) != 0 {
                self.dio.set_high()?;
            } else {
                self.dio.set_low()?;
            }
            delay();
            self.clk.set_high()?;
            delay();
        }

        // Ninth clock: release DIO and sample the acknowledge.
        self.clk.set_low()?;
        self.dio.set_high()?;
        delay();
        self.clk.set_high()?;
        delay();
        let acked = self.dio.is_low();
        self.clk.set_low()?;
        delay();

        if acked {
            Ok(())
        } else {
            Err(anyhow!("display did not acknowledge byte {byte:#04x}"))
        }
    }
}

fn segments(glyph: Glyph) -> u8 {
    match glyph {
        Glyph::Blank => 0,
        Glyph::Dash => DASH_SEGMENTS,
        Glyph::Digit(digit) => DIGIT_SEGMENTS[usize::from(digit % 10)],
    }
}

fn delay() {
    Ets::delay_us(BIT_DELAY_US);
}
