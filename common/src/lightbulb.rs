use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    color::{color_temperature_mix, hsi_to_rgbw, to_duty},
    config::LightbulbConfig,
    driver::{ChannelAllocator, DriverFamily},
    types::{ChId, GroupId},
};

pub const RGBW_PERIOD_MS: u64 = 10;
pub const AUTODIMMER_WINDOW_MS: u64 = 500;

/// Non-blocking guard over the shared duty array write path.
#[derive(Debug, Clone, Default)]
pub struct PwmGate(Arc<AtomicBool>);

impl PwmGate {
    pub fn try_acquire(&self) -> Option<PwmPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PwmPermit(self.0.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Held while a duty frame is on its way to hardware. Released on drop.
#[derive(Debug)]
pub struct PwmPermit(Arc<AtomicBool>);

impl Drop for PwmPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct PwmFrame {
    duty: Vec<u16>,
    _permit: PwmPermit,
}

impl PwmFrame {
    pub fn duty(&self) -> &[u16] {
        &self.duty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Color { white: bool },
    ColorTemperature,
    Dimmable,
}

/// Characteristic values the duty targets are derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightState {
    pub on: bool,
    pub brightness: f32,
    pub hue: f32,
    pub saturation: f32,
    pub color_temp: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Autodimmer {
    pub step: u8,
    pub delay_ms: u64,
    pub remaining: u8,
}

impl Autodimmer {
    pub fn enabled(&self) -> bool {
        self.step > 0
    }

    pub fn start(&mut self) {
        self.remaining = if self.step == 0 {
            0
        } else {
            u8::try_from(4 * 100 / u32::from(self.step)).unwrap_or(u8::MAX)
        };
    }

    pub fn stop(&mut self) {
        self.remaining = 0;
    }

    pub fn next_brightness(&self, current: i32) -> i32 {
        let step = i32::from(self.step);
        if current >= 100 {
            step
        } else {
            (current + step).min(100)
        }
    }

    pub fn delay_after(&self, brightness: i32) -> u64 {
        if brightness >= 100 {
            self.delay_ms * 2
        } else {
            self.delay_ms
        }
    }
}

#[derive(Debug, Clone)]
pub struct LightbulbGroup {
    pub ch0: ChId,
    pub group: GroupId,
    pub kind: LightKind,
    pub step: u16,
    pub autodimmer: Autodimmer,
    channels: [Option<u8>; 4],
    factors: [f32; 4],
    targets: [u16; 4],
}

impl LightbulbGroup {
    pub fn from_config(
        ch0: ChId,
        group: GroupId,
        config: &LightbulbConfig,
        allocator: &mut ChannelAllocator,
        family: DriverFamily,
    ) -> Self {
        let (kind, channels, factors) = if family == DriverFamily::Ws2812 {
            let [r, g, b] = ChannelAllocator::ws2812_rgb();
            (
                LightKind::Color { white: false },
                [r, g, b, None],
                [config.factor_r, config.factor_g, config.factor_b, 1.0],
            )
        } else if config.cw.is_some() && config.ww.is_some() {
            (
                LightKind::ColorTemperature,
                [
                    allocator.allocate(config.cw),
                    allocator.allocate(config.ww),
                    None,
                    None,
                ],
                [config.factor_w, config.factor_w, 1.0, 1.0],
            )
        } else if config.r.is_some() && config.g.is_some() && config.b.is_some() {
            (
                LightKind::Color {
                    white: config.w.is_some(),
                },
                [
                    allocator.allocate(config.r),
                    allocator.allocate(config.g),
                    allocator.allocate(config.b),
                    allocator.allocate(config.w),
                ],
                [
                    config.factor_r,
                    config.factor_g,
                    config.factor_b,
                    config.factor_w,
                ],
            )
        } else {
            (
                LightKind::Dimmable,
                [None, None, None, allocator.allocate(config.w)],
                [1.0, 1.0, 1.0, config.factor_w],
            )
        };

        Self {
            ch0,
            group,
            kind,
            step: config.step,
            autodimmer: Autodimmer {
                step: config.autodimmer_step,
                delay_ms: config.autodimmer_delay_ms,
                remaining: 0,
            },
            channels,
            factors,
            targets: [0; 4],
        }
    }

    pub fn targets(&self) -> [u16; 4] {
        self.targets
    }

    fn update_targets(&mut self, state: &LightState) {
        let level = if state.on { state.brightness } else { 0.0 };
        let f = self.factors;
        self.targets = match self.kind {
            LightKind::Color { white } => {
                let mix = hsi_to_rgbw(state.hue, state.saturation, level, white);
                [
                    to_duty(mix.r, f[0]),
                    to_duty(mix.g, f[1]),
                    to_duty(mix.b, f[2]),
                    to_duty(mix.w, f[3]),
                ]
            }
            LightKind::ColorTemperature => {
                let (cool, warm) = color_temperature_mix(state.color_temp, level);
                [to_duty(cool, f[0]), to_duty(warm, f[1]), 0, 0]
            }
            LightKind::Dimmable => [0, 0, 0, to_duty(level / 100.0, f[3])],
        };
    }
}

#[derive(Debug)]
pub enum SlewOutcome {
    Frame { frame: PwmFrame, converging: usize },
    Missed,
}

/// Owns the shared duty array and ramps it toward every group's targets.
#[derive(Debug, Default)]
pub struct LightbulbEngine {
    groups: Vec<LightbulbGroup>,
    duty: Vec<u16>,
    gate: PwmGate,
    missed: u64,
}

impl LightbulbEngine {
    pub fn new(duty_len: usize) -> Self {
        Self {
            groups: Vec::new(),
            duty: vec![0; duty_len],
            gate: PwmGate::default(),
            missed: 0,
        }
    }

    pub fn add(&mut self, group: LightbulbGroup) -> usize {
        let needed = group
            .channels
            .iter()
            .flatten()
            .map(|channel| usize::from(*channel) + 1)
            .max()
            .unwrap_or(0);
        if needed > self.duty.len() {
            self.duty.resize(needed, 0);
        }
        self.groups.push(group);
        self.groups.len() - 1
    }

    pub fn group(&self, index: usize) -> Option<&LightbulbGroup> {
        self.groups.get(index)
    }

    pub fn group_mut(&mut self, index: usize) -> Option<&mut LightbulbGroup> {
        self.groups.get_mut(index)
    }

    pub fn find(&self, ch0: ChId) -> Option<usize> {
        self.groups.iter().position(|group| group.ch0 == ch0)
    }

    pub fn gate(&self) -> PwmGate {
        self.gate.clone()
    }

    pub fn duty(&self) -> &[u16] {
        &self.duty
    }

    pub fn missed_ticks(&self) -> u64 {
        self.missed
    }

    pub fn set_state(&mut self, index: usize, state: &LightState) {
        if let Some(group) = self.groups.get_mut(index) {
            group.update_targets(state);
        }
    }

    /// One slew step over every group. Returns the frame to push plus the
    /// number of channels still away from target.
    pub fn slew_tick(&mut self) -> SlewOutcome {
        let Some(permit) = self.gate.try_acquire() else {
            self.missed += 1;
            log::warn!("lightbulb pwm update missed");
            return SlewOutcome::Missed;
        };

        let mut converging = 0;
        for group in &self.groups {
            let step = i32::from(group.step);
            for (channel, target) in group.channels.iter().zip(group.targets) {
                let Some(index) = channel.map(usize::from) else {
                    continue;
                };
                let Some(current) = self.duty.get_mut(index) else {
                    continue;
                };
                let diff = i32::from(target) - i32::from(*current);
                if diff.abs() <= step {
                    *current = target;
                } else {
                    let next = i32::from(*current) + step * diff.signum();
                    *current = next.clamp(0, i32::from(u16::MAX)) as u16;
                    converging += 1;
                }
            }
        }

        SlewOutcome::Frame {
            frame: PwmFrame {
                duty: self.duty.clone(),
                _permit: permit,
            },
            converging,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::color::PWM_SCALE;

    fn rgbw_config() -> LightbulbConfig {
        LightbulbConfig {
            r: Some(12),
            g: Some(13),
            b: Some(14),
            w: Some(15),
            ..LightbulbConfig::default()
        }
    }

    fn engine_with(config: &LightbulbConfig) -> LightbulbEngine {
        let mut allocator = ChannelAllocator::new(DriverFamily::Pwm, 1);
        let group =
            LightbulbGroup::from_config(ChId(0), GroupId(0), config, &mut allocator, DriverFamily::Pwm);
        let mut engine = LightbulbEngine::new(allocator.duty_len());
        engine.add(group);
        engine
    }

    fn full_white() -> LightState {
        LightState {
            on: true,
            brightness: 100.0,
            hue: 0.0,
            saturation: 0.0,
            color_temp: 153.0,
        }
    }

    #[test]
    fn converges_within_expected_ticks() {
        let mut engine = engine_with(&rgbw_config());
        engine.set_state(0, &full_white());
        let step = u32::from(engine.group(0).unwrap().step);
        let expected = u32::from(PWM_SCALE).div_ceil(step);

        let mut ticks = 0;
        loop {
            ticks += 1;
            let SlewOutcome::Frame { converging, .. } = engine.slew_tick() else {
                panic!("gate should be free");
            };
            if converging == 0 {
                break;
            }
            assert!(ticks < expected);
        }

        assert_eq!(ticks, expected);
        assert_eq!(engine.duty()[3], PWM_SCALE);
        assert_eq!(&engine.duty()[..3], &[0, 0, 0]);
    }

    #[test]
    fn busy_gate_drops_the_tick() {
        let mut engine = engine_with(&rgbw_config());
        engine.set_state(0, &full_white());
        let first = engine.slew_tick();
        let before = engine.duty().to_vec();

        assert!(matches!(engine.slew_tick(), SlewOutcome::Missed));
        assert_eq!(engine.duty(), before.as_slice());
        assert_eq!(engine.missed_ticks(), 1);

        drop(first);
        assert!(matches!(engine.slew_tick(), SlewOutcome::Frame { .. }));
    }

    #[test]
    fn turning_off_targets_zero() {
        let mut engine = engine_with(&rgbw_config());
        engine.set_state(0, &full_white());
        assert_eq!(engine.group(0).unwrap().targets()[3], PWM_SCALE);

        engine.set_state(
            0,
            &LightState {
                on: false,
                ..full_white()
            },
        );
        assert_eq!(engine.group(0).unwrap().targets(), [0, 0, 0, 0]);
    }

    #[test]
    fn white_spectrum_uses_cool_and_warm_channels() {
        let config = LightbulbConfig {
            cw: Some(4),
            ww: Some(5),
            ..LightbulbConfig::default()
        };
        let mut engine = engine_with(&config);
        assert_eq!(engine.group(0).unwrap().kind, LightKind::ColorTemperature);

        engine.set_state(
            0,
            &LightState {
                color_temp: 400.0,
                ..full_white()
            },
        );
        assert_eq!(engine.group(0).unwrap().targets(), [0, PWM_SCALE, 0, 0]);
    }

    #[test]
    fn autodimmer_ramp_wraps_after_full() {
        let mut dimmer = Autodimmer {
            step: 20,
            delay_ms: 1_000,
            remaining: 0,
        };
        dimmer.start();

        assert_eq!(dimmer.remaining, 20);
        assert_eq!(dimmer.next_brightness(90), 100);
        assert_eq!(dimmer.next_brightness(100), 20);
        assert_eq!(dimmer.delay_after(100), 2_000);
        assert_eq!(dimmer.delay_after(40), 1_000);
    }
}
