/// Colour channels of the bulb.
///
/// The bulb carries two three-channel driver chips: the first drives the
/// cold and warm white LEDs, the second red, green and blue. Chip channel 2
/// is not wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Cold,
    Warm,
    Red,
    Green,
    Blue,
}

impl Channel {
    /// Order used by LED command messages (`c,w,r,g,b`).
    pub const ALL: [Self; 5] = [Self::Cold, Self::Warm, Self::Red, Self::Green, Self::Blue];

    pub fn chip_index(self) -> u8 {
        match self {
            Self::Cold => 0,
            Self::Warm => 1,
            Self::Green => 3,
            Self::Red => 4,
            Self::Blue => 5,
        }
    }
}

pub trait LedDriver {
    fn max_value(&self) -> u16;
    fn set_channel(&mut self, channel: u8, value: u16);
    /// Latches all pending channel values into the chips.
    fn commit(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedLevels {
    pub cold: u16,
    pub warm: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl LedLevels {
    /// Parses a `cold,warm,red,green,blue` command.
    ///
    /// Missing or non-numeric fields read as 0 and anything past the fifth
    /// field is ignored, so `"255"` means cold white only.
    pub fn parse(message: &str) -> Self {
        let mut values = [0_u16; 5];
        for (slot, field) in values.iter_mut().zip(message.split(',')) {
            *slot = leading_number(field);
        }
        Self::from_array(values)
    }

    pub fn from_array([cold, warm, red, green, blue]: [u16; 5]) -> Self {
        Self {
            cold,
            warm,
            red,
            green,
            blue,
        }
    }

    pub fn to_array(self) -> [u16; 5] {
        [self.cold, self.warm, self.red, self.green, self.blue]
    }

    pub fn get(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Cold => self.cold,
            Channel::Warm => self.warm,
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Blue => self.blue,
        }
    }

    pub fn is_off(&self) -> bool {
        self.to_array().iter().all(|value| *value == 0)
    }

    pub fn to_message(self) -> String {
        self.to_array()
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Caps every channel at `max`.
    pub fn clamped(self, max: u16) -> Self {
        Self::from_array(self.to_array().map(|value| value.min(max)))
    }

    /// Writes all five channels, clamped to the driver range, then commits once.
    pub fn apply(&self, driver: &mut dyn LedDriver) {
        let levels = self.clamped(driver.max_value());
        for channel in Channel::ALL {
            driver.set_channel(channel.chip_index(), levels.get(channel));
        }
        driver.commit();
    }
}

fn leading_number(field: &str) -> u16 {
    let digits = field.trim_start();
    let digits = digits.strip_prefix('+').unwrap_or(digits);
    digits
        .chars()
        .take_while(char::is_ascii_digit)
        .filter_map(|digit| digit.to_digit(10))
        .fold(0_u16, |acc, digit| {
            acc.saturating_mul(10).saturating_add(digit as u16)
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        channels: [u16; 6],
        commits: u32,
    }

    impl LedDriver for Recorder {
        fn max_value(&self) -> u16 {
            255
        }

        fn set_channel(&mut self, channel: u8, value: u16) {
            self.channels[channel as usize] = value;
        }

        fn commit(&mut self) {
            self.commits += 1;
        }
    }

    #[test]
    fn parses_full_command() {
        let levels = LedLevels::parse("10,20,30,40,50");
        assert_eq!(levels.to_array(), [10, 20, 30, 40, 50]);
    }

    #[test]
    fn parses_partial_and_garbage_fields_as_zero() {
        assert_eq!(LedLevels::parse("255").to_array(), [255, 0, 0, 0, 0]);
        assert_eq!(LedLevels::parse("x, 7,12abc,,").to_array(), [0, 7, 12, 0, 0]);
        assert_eq!(LedLevels::parse("1,2,3,4,5,6,7").to_array(), [1, 2, 3, 4, 5]);
        assert!(LedLevels::parse("").is_off());
        assert_eq!(LedLevels::parse("-5,99999999").to_array(), [0, u16::MAX, 0, 0, 0]);
    }

    #[test]
    fn applies_through_channel_map() {
        let mut driver = Recorder::default();
        LedLevels::parse("1,2,3,4,5").apply(&mut driver);

        // cold, warm, unused, green, red, blue
        assert_eq!(driver.channels, [1, 2, 0, 4, 3, 5]);
        assert_eq!(driver.commits, 1);
    }

    #[test]
    fn clamps_to_driver_range() {
        let mut driver = Recorder::default();
        LedLevels::parse("1000,0,0,0,0").apply(&mut driver);
        assert_eq!(driver.channels[0], 255);
    }

    #[test]
    fn clamped_levels_report_what_the_driver_shows() {
        let levels = LedLevels::parse("0,300,1,70000,255").clamped(255);
        assert_eq!(levels.to_array(), [0, 255, 1, 255, 255]);
        assert_eq!(levels.to_message(), "0,255,1,255,255");
    }

    #[test]
    fn message_round_trip() {
        let levels = LedLevels::parse("0,128,0,64,0");
        assert_eq!(levels.to_message(), "0,128,0,64,0");
    }
}
