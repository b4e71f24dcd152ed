use serde::{Deserialize, Serialize};

pub const MAX_PWM_CHANNELS: usize = 8;
const WS2812_CHANNELS: usize = 3;
const WS2812_FACTOR: f32 = 255.0 / 65_535.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverFamily {
    Pwm,
    My9291,
    My9231,
    Ws2812,
}

impl DriverFamily {
    pub fn channels_per_chip(self) -> usize {
        match self {
            Self::Pwm => MAX_PWM_CHANNELS,
            Self::My9291 => 4,
            Self::My9231 => 3,
            Self::Ws2812 => WS2812_CHANNELS,
        }
    }
}

/// Hardware backend receiving per-channel duty followed by one latch.
pub trait DutySink: Send {
    fn set_channel(&mut self, chip: usize, channel: usize, duty: u16);
    fn update(&mut self);
}

pub struct DriverInterface {
    family: DriverFamily,
    num_chips: usize,
    channels_per_chip: usize,
    sink: Option<Box<dyn DutySink>>,
}

impl std::fmt::Debug for DriverInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverInterface")
            .field("family", &self.family)
            .field("num_chips", &self.num_chips)
            .field("channels_per_chip", &self.channels_per_chip)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl DriverInterface {
    pub fn new(family: DriverFamily, num_chips: usize, sink: Option<Box<dyn DutySink>>) -> Self {
        let num_chips = match family {
            DriverFamily::Pwm => 1,
            _ => num_chips.max(1),
        };
        Self {
            family,
            num_chips,
            channels_per_chip: family.channels_per_chip(),
            sink,
        }
    }

    pub fn family(&self) -> DriverFamily {
        self.family
    }

    /// Size of the duty array this driver consumes.
    pub fn duty_len(&self) -> usize {
        match self.family {
            DriverFamily::Ws2812 => WS2812_CHANNELS,
            _ => self.num_chips * self.channels_per_chip,
        }
    }

    pub fn set_all(&mut self, duty: &[u16]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        match self.family {
            DriverFamily::Pwm => {
                for (channel, value) in duty.iter().take(self.channels_per_chip).enumerate() {
                    sink.set_channel(0, channel, *value);
                }
            }
            DriverFamily::My9291 | DriverFamily::My9231 => {
                for channel in 0..self.channels_per_chip {
                    for chip in 0..self.num_chips {
                        let value = duty
                            .get(chip * self.channels_per_chip + channel)
                            .copied()
                            .unwrap_or(0);
                        sink.set_channel(chip, channel, value);
                    }
                }
            }
            DriverFamily::Ws2812 => {
                let mut color = [0_u16; WS2812_CHANNELS];
                for (slot, value) in color.iter_mut().zip(duty) {
                    *slot = (f32::from(*value) * WS2812_FACTOR).round() as u16;
                }
                for pixel in 0..self.num_chips {
                    for (channel, value) in color.iter().enumerate() {
                        sink.set_channel(pixel, channel, *value);
                    }
                }
            }
        }
        sink.update();
    }
}

/// Assigns duty-array indexes to configured light outputs.
#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    family: DriverFamily,
    capacity: usize,
    pwm_gpios: Vec<u8>,
}

impl ChannelAllocator {
    pub fn new(family: DriverFamily, num_chips: usize) -> Self {
        let capacity = match family {
            DriverFamily::Pwm => MAX_PWM_CHANNELS,
            DriverFamily::Ws2812 => WS2812_CHANNELS,
            _ => num_chips.max(1) * family.channels_per_chip(),
        };
        Self {
            family,
            capacity,
            pwm_gpios: Vec::new(),
        }
    }

    /// For PWM the configured number is a GPIO and gets the next free
    /// channel. For chip drivers it is the channel index itself.
    pub fn allocate(&mut self, configured: Option<u8>) -> Option<u8> {
        let configured = configured?;
        match self.family {
            DriverFamily::Pwm => {
                if let Some(index) = self.pwm_gpios.iter().position(|gpio| *gpio == configured) {
                    return u8::try_from(index).ok();
                }
                if self.pwm_gpios.len() >= self.capacity {
                    log::warn!("pwm channel limit reached, gpio {configured} ignored");
                    return None;
                }
                self.pwm_gpios.push(configured);
                u8::try_from(self.pwm_gpios.len() - 1).ok()
            }
            DriverFamily::Ws2812 => Some(configured.min(WS2812_CHANNELS as u8 - 1)),
            DriverFamily::My9291 | DriverFamily::My9231 => {
                (usize::from(configured) < self.capacity).then_some(configured)
            }
        }
    }

    /// Fixed red/green/blue layout of pixel strips.
    pub fn ws2812_rgb() -> [Option<u8>; 3] {
        [Some(0), Some(1), Some(2)]
    }

    pub fn pwm_gpios(&self) -> &[u8] {
        &self.pwm_gpios
    }

    pub fn duty_len(&self) -> usize {
        match self.family {
            DriverFamily::Pwm => self.pwm_gpios.len(),
            _ => self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Set(usize, usize, u16),
        Update,
    }

    struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl DutySink for Recorder {
        fn set_channel(&mut self, chip: usize, channel: usize, duty: u16) {
            self.0.lock().unwrap().push(Call::Set(chip, channel, duty));
        }

        fn update(&mut self) {
            self.0.lock().unwrap().push(Call::Update);
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Call>>>, Box<dyn DutySink>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (calls.clone(), Box::new(Recorder(calls)))
    }

    #[test]
    fn chip_chain_latches_once_after_all_channels() {
        let (calls, sink) = recorder();
        let mut driver = DriverInterface::new(DriverFamily::My9231, 2, Some(sink));
        driver.set_all(&[1, 2, 3, 4, 5, 6]);

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Call::Set(0, 0, 1),
                Call::Set(1, 0, 4),
                Call::Set(0, 1, 2),
                Call::Set(1, 1, 5),
                Call::Set(0, 2, 3),
                Call::Set(1, 2, 6),
                Call::Update,
            ]
        );
    }

    #[test]
    fn pixel_strip_writes_same_color_everywhere() {
        let (calls, sink) = recorder();
        let mut driver = DriverInterface::new(DriverFamily::Ws2812, 2, Some(sink));
        driver.set_all(&[65_535, 0, 32_768]);

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Call::Set(0, 0, 255),
                Call::Set(0, 1, 0),
                Call::Set(0, 2, 128),
                Call::Set(1, 0, 255),
                Call::Set(1, 1, 0),
                Call::Set(1, 2, 128),
                Call::Update,
            ]
        );
    }

    #[test]
    fn missing_sink_is_a_no_op() {
        let mut driver = DriverInterface::new(DriverFamily::Pwm, 1, None);
        driver.set_all(&[10, 20]);
        assert_eq!(driver.duty_len(), MAX_PWM_CHANNELS);
    }

    #[test]
    fn pwm_channels_are_sequential_and_capped() {
        let mut allocator = ChannelAllocator::new(DriverFamily::Pwm, 1);
        let assigned: Vec<Option<u8>> = (10..20).map(|gpio| allocator.allocate(Some(gpio))).collect();

        assert_eq!(&assigned[..3], &[Some(0), Some(1), Some(2)]);
        assert_eq!(assigned[7], Some(7));
        assert_eq!(assigned[8], None);
        assert_eq!(allocator.allocate(Some(11)), Some(1));
        assert_eq!(allocator.allocate(None), None);
    }

    #[test]
    fn chip_channels_must_exist() {
        let mut allocator = ChannelAllocator::new(DriverFamily::My9291, 1);
        assert_eq!(allocator.allocate(Some(3)), Some(3));
        assert_eq!(allocator.allocate(Some(4)), None);
    }
}
