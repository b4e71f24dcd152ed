use crate::{config::WindowCoverConfig, timers::TimerRequest};

pub const WINDOW_COVER_POLL_PERIOD_MS: u64 = 250;
pub const WINDOW_COVER_MARGIN_SYNC: f32 = 15.0;

const CORRECTION_SCALE: f32 = 0.000_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    Closing,
    Opening,
    Stopped,
}

impl Motion {
    /// HomeKit PositionState value.
    pub fn code(self) -> i32 {
        match self {
            Self::Closing => 0,
            Self::Opening => 1,
            Self::Stopped => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverEvent {
    Closing,
    Opening,
    Reached,
    ClosingFromMoving,
    OpeningFromMoving,
    StoppedWhileClosing,
    StoppedWhileOpening,
    Obstruction,
    ObstructionCleared,
}

impl CoverEvent {
    pub fn code(self) -> u8 {
        match self {
            Self::Closing => 0,
            Self::Opening => 1,
            Self::Reached => 2,
            Self::ClosingFromMoving => 3,
            Self::OpeningFromMoving => 4,
            Self::StoppedWhileClosing => 5,
            Self::StoppedWhileOpening => 6,
            Self::Obstruction => 7,
            Self::ObstructionCleared => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverStep {
    pub event: Option<CoverEvent>,
    pub timer: TimerRequest,
}

impl CoverStep {
    fn idle() -> Self {
        Self {
            event: None,
            timer: TimerRequest::Keep,
        }
    }

    fn with(event: CoverEvent, timer: TimerRequest) -> Self {
        Self {
            event: Some(event),
            timer,
        }
    }
}

/// Maps travel time (logical position) to the physical opening.
///
/// Outside 0..=100 the curve continues linearly so overrun past the ends
/// still moves the estimate.
pub fn real_position(logical: f32, correction: f32) -> f32 {
    if logical <= 0.0 || logical >= 100.0 || correction == 0.0 {
        return logical;
    }
    logical / (1.0 + (100.0 - logical) * correction * CORRECTION_SCALE)
}

/// Inverse of [`real_position`] inside 0..=100.
pub fn logical_position(real: f32, correction: f32) -> f32 {
    if real <= 0.0 || real >= 100.0 || correction == 0.0 {
        return real;
    }
    let k = correction * CORRECTION_SCALE;
    real * (1.0 + 100.0 * k) / (1.0 + real * k)
}

#[derive(Debug, Clone)]
pub struct WindowCover {
    position: f32,
    target: i32,
    motion: Motion,
    obstruction: bool,
    open_step: f32,
    close_step: f32,
    correction: f32,
}

impl WindowCover {
    pub fn new(config: &WindowCoverConfig) -> Self {
        let ticks_per_second = 1_000.0 / WINDOW_COVER_POLL_PERIOD_MS as f32;
        Self {
            position: 0.0,
            target: 0,
            motion: Motion::Stopped,
            obstruction: false,
            open_step: 100.0 / config.open_time_s / ticks_per_second,
            close_step: 100.0 / config.close_time_s / ticks_per_second,
            correction: config.correction,
        }
    }

    pub fn restore(&mut self, real: i32) {
        let real = real.clamp(0, 100);
        self.position = logical_position(real as f32, self.correction);
        self.target = real;
        self.motion = Motion::Stopped;
    }

    pub fn motion(&self) -> Motion {
        self.motion
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn obstruction(&self) -> bool {
        self.obstruction
    }

    pub fn real(&self) -> f32 {
        real_position(self.position, self.correction)
    }

    /// Rounded CurrentPosition as reported to HomeKit.
    pub fn current(&self) -> i32 {
        self.real().round().clamp(0.0, 100.0) as i32
    }

    pub fn request(&mut self, target: i32) -> CoverStep {
        let target = target.clamp(0, 100);
        self.target = target;
        let current = self.current();

        if target == current {
            return match self.motion {
                Motion::Stopped => CoverStep::idle(),
                _ => {
                    self.motion = Motion::Stopped;
                    CoverStep::with(CoverEvent::Reached, TimerRequest::Stop)
                }
            };
        }

        let wanted = if target > current {
            Motion::Opening
        } else {
            Motion::Closing
        };
        let previous = self.motion;
        self.motion = wanted;

        match (previous, wanted) {
            (prev, next) if prev == next => CoverStep::idle(),
            (Motion::Stopped, Motion::Opening) => {
                CoverStep::with(CoverEvent::Opening, TimerRequest::Start)
            }
            (Motion::Stopped, _) => CoverStep::with(CoverEvent::Closing, TimerRequest::Start),
            (_, Motion::Opening) => {
                CoverStep::with(CoverEvent::OpeningFromMoving, TimerRequest::Keep)
            }
            _ => CoverStep::with(CoverEvent::ClosingFromMoving, TimerRequest::Keep),
        }
    }

    pub fn stop(&mut self) -> CoverStep {
        let event = match self.motion {
            Motion::Stopped => return CoverStep::idle(),
            Motion::Closing => CoverEvent::StoppedWhileClosing,
            Motion::Opening => CoverEvent::StoppedWhileOpening,
        };
        self.halt();
        CoverStep::with(event, TimerRequest::Stop)
    }

    /// One 250 ms step of travel.
    pub fn tick(&mut self) -> CoverStep {
        let margin = if self.target == 0 || self.target == 100 {
            WINDOW_COVER_MARGIN_SYNC
        } else {
            0.0
        };
        let target = self.target as f32;

        let reached = match self.motion {
            Motion::Opening => {
                self.position += self.open_step;
                self.real() >= target + margin
            }
            Motion::Closing => {
                self.position -= self.close_step;
                self.real() <= target - margin
            }
            Motion::Stopped => {
                return CoverStep {
                    event: None,
                    timer: TimerRequest::Stop,
                };
            }
        };

        if !reached {
            return CoverStep::idle();
        }
        self.position = logical_position(target, self.correction);
        self.motion = Motion::Stopped;
        CoverStep::with(CoverEvent::Reached, TimerRequest::Stop)
    }

    /// Obstruction halts the cover where it is.
    pub fn set_obstruction(&mut self, obstruction: bool) -> CoverStep {
        if self.obstruction == obstruction {
            return CoverStep::idle();
        }
        self.obstruction = obstruction;
        if !obstruction {
            return CoverStep::with(CoverEvent::ObstructionCleared, TimerRequest::Keep);
        }
        if self.motion == Motion::Stopped {
            return CoverStep::with(CoverEvent::Obstruction, TimerRequest::Keep);
        }
        self.halt();
        CoverStep::with(CoverEvent::Obstruction, TimerRequest::Stop)
    }

    fn halt(&mut self) {
        self.position = self.position.clamp(0.0, 100.0);
        self.motion = Motion::Stopped;
        self.target = self.current();
    }
}
