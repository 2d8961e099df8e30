use bulb_common::LedDriver;
use tracing::{debug, info};

pub const LED_CHANNELS: usize = 6;
pub const LED_MAX: u16 = 255;

/// Stand-in for the two LED driver chips on host builds.
///
/// Writes are staged until `commit`, mirroring the chips' latch behaviour,
/// and every commit is logged.
#[derive(Debug, Default)]
pub struct SimulatedLeds {
    pending: [u16; LED_CHANNELS],
    latched: [u16; LED_CHANNELS],
    commits: u64,
}

impl SimulatedLeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> [u16; LED_CHANNELS] {
        self.latched
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl LedDriver for SimulatedLeds {
    fn max_value(&self) -> u16 {
        LED_MAX
    }

    fn set_channel(&mut self, channel: u8, value: u16) {
        match self.pending.get_mut(channel as usize) {
            Some(slot) => *slot = value.min(LED_MAX),
            None => debug!("ignoring write to led channel {channel}"),
        }
    }

    fn commit(&mut self) {
        if self.pending == self.latched {
            return;
        }
        self.latched = self.pending;
        self.commits += 1;
        info!("leds {:?}", self.latched);
    }
}

#[cfg(test)]
mod tests {
    use bulb_common::LedLevels;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn values_latch_on_commit() {
        let mut leds = SimulatedLeds::new();
        leds.set_channel(1, 100);
        assert_eq!(leds.channels(), [0; LED_CHANNELS]);

        leds.commit();
        assert_eq!(leds.channels(), [0, 100, 0, 0, 0, 0]);
        assert_eq!(leds.commits(), 1);
    }

    #[test]
    fn unchanged_commit_is_skipped_and_out_of_range_ignored() {
        let mut leds = SimulatedLeds::new();
        leds.set_channel(9, 10);
        leds.commit();
        assert_eq!(leds.commits(), 0);

        leds.set_channel(0, 4_000);
        leds.commit();
        assert_eq!(leds.channels()[0], LED_MAX);
    }

    #[test]
    fn applies_command_levels() {
        let mut leds = SimulatedLeds::new();
        LedLevels::parse("0,0,10,20,30").apply(&mut leds);
        assert_eq!(leds.channels(), [0, 0, 0, 20, 10, 30]);
    }
}
