use crate::{config::GarageConfig, timers::TimerRequest};

pub const GARAGE_POLL_PERIOD_MS: u64 = 1_000;

pub const TARGET_OPEN: i32 = 0;
pub const TARGET_CLOSED: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorState {
    Opened,
    Closed,
    Opening,
    Closing,
    Stopped,
}

impl DoorState {
    pub fn code(self) -> i32 {
        match self {
            Self::Opened => 0,
            Self::Closed => 1,
            Self::Opening => 2,
            Self::Closing => 3,
            Self::Stopped => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Opened),
            1 => Some(Self::Closed),
            2 => Some(Self::Opening),
            3 => Some(Self::Closing),
            4 => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarageEvent {
    Opened,
    Closed,
    Opening,
    Closing,
    Stopped,
    OpeningFromMoving,
    ClosingFromMoving,
    Obstruction,
    ObstructionCleared,
}

impl GarageEvent {
    pub fn code(self) -> u8 {
        match self {
            Self::Opened => 0,
            Self::Closed => 1,
            Self::Opening => 2,
            Self::Closing => 3,
            Self::Stopped => 4,
            Self::OpeningFromMoving => 5,
            Self::ClosingFromMoving => 6,
            Self::Obstruction => 7,
            Self::ObstructionCleared => 8,
        }
    }
}

/// Position report from a physical end or motion sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorSensor {
    Opened,
    Closed,
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GarageStep {
    pub event: Option<GarageEvent>,
    pub timer: TimerRequest,
}

impl GarageStep {
    fn idle() -> Self {
        Self {
            event: None,
            timer: TimerRequest::Keep,
        }
    }

    fn with(event: GarageEvent, timer: TimerRequest) -> Self {
        Self {
            event: Some(event),
            timer,
        }
    }
}

/// Time-integrated garage door position.
///
/// `current_time` counts seconds of opening travel: 0 is fully closed and
/// `working_time` is fully open. Closing runs faster or slower by
/// `close_factor` so one accumulator covers both directions.
#[derive(Debug, Clone)]
pub struct GarageDoor {
    state: DoorState,
    target: i32,
    obstruction: bool,
    current_time: f32,
    working_time: f32,
    margin: f32,
    close_factor: f32,
    has_opened_sensor: bool,
    has_closed_sensor: bool,
}

impl GarageDoor {
    pub fn new(config: &GarageConfig, has_opened_sensor: bool, has_closed_sensor: bool) -> Self {
        Self {
            state: DoorState::Closed,
            target: TARGET_CLOSED,
            obstruction: false,
            current_time: 0.0,
            working_time: config.open_time_s,
            margin: config.margin_s,
            close_factor: config.open_time_s / config.close_time_s,
            has_opened_sensor,
            has_closed_sensor,
        }
    }

    pub fn state(&self) -> DoorState {
        self.state
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn obstruction(&self) -> bool {
        self.obstruction
    }

    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    pub fn is_moving(&self) -> bool {
        matches!(self.state, DoorState::Opening | DoorState::Closing)
    }

    /// Places the door at rest in `state` without firing anything. Used at boot.
    pub fn restore(&mut self, state: DoorState) {
        self.state = match state {
            DoorState::Opening => DoorState::Opened,
            DoorState::Closing => DoorState::Closed,
            other => other,
        };
        match self.state {
            DoorState::Opened => {
                self.current_time = self.working_time;
                self.target = TARGET_OPEN;
            }
            DoorState::Closed => {
                self.current_time = 0.0;
                self.target = TARGET_CLOSED;
            }
            _ => self.current_time = self.working_time / 2.0,
        }
    }

    pub fn request(&mut self, target: i32) -> GarageStep {
        self.target = if target == TARGET_OPEN {
            TARGET_OPEN
        } else {
            TARGET_CLOSED
        };

        if self.target == TARGET_OPEN {
            match self.state {
                DoorState::Opened | DoorState::Opening => GarageStep::idle(),
                DoorState::Closing => {
                    self.state = DoorState::Opening;
                    self.current_time = self.margin;
                    GarageStep::with(GarageEvent::OpeningFromMoving, TimerRequest::Keep)
                }
                DoorState::Closed | DoorState::Stopped => {
                    self.state = DoorState::Opening;
                    GarageStep::with(GarageEvent::Opening, TimerRequest::Start)
                }
            }
        } else {
            match self.state {
                DoorState::Closed | DoorState::Closing => GarageStep::idle(),
                DoorState::Opening => {
                    self.state = DoorState::Closing;
                    self.current_time = self.working_time - self.margin;
                    GarageStep::with(GarageEvent::ClosingFromMoving, TimerRequest::Keep)
                }
                DoorState::Opened | DoorState::Stopped => {
                    self.state = DoorState::Closing;
                    GarageStep::with(GarageEvent::Closing, TimerRequest::Start)
                }
            }
        }
    }

    pub fn stop(&mut self) -> GarageStep {
        if !self.is_moving() {
            return GarageStep::idle();
        }
        self.state = DoorState::Stopped;
        GarageStep::with(GarageEvent::Stopped, TimerRequest::Stop)
    }

    /// One second of travel.
    pub fn tick(&mut self) -> GarageStep {
        match self.state {
            DoorState::Opening => {
                self.current_time += 1.0;
                if self.has_opened_sensor {
                    if self.current_time >= self.working_time + self.margin {
                        return self.halt_obstructed();
                    }
                } else if self.current_time >= self.working_time - self.margin {
                    self.state = DoorState::Opened;
                    self.current_time = self.working_time;
                    return GarageStep::with(GarageEvent::Opened, TimerRequest::Stop);
                }
                GarageStep::idle()
            }
            DoorState::Closing => {
                self.current_time -= self.close_factor;
                if self.has_closed_sensor {
                    if self.current_time <= -self.margin {
                        return self.halt_obstructed();
                    }
                } else if self.current_time <= self.margin {
                    self.state = DoorState::Closed;
                    self.current_time = 0.0;
                    return GarageStep::with(GarageEvent::Closed, TimerRequest::Stop);
                }
                GarageStep::idle()
            }
            _ => GarageStep {
                event: None,
                timer: TimerRequest::Stop,
            },
        }
    }

    /// Sensor reports set state directly and never fire actions.
    pub fn sensor(&mut self, report: DoorSensor) -> TimerRequest {
        match report {
            DoorSensor::Opened => {
                self.state = DoorState::Opened;
                self.target = TARGET_OPEN;
                self.current_time = self.working_time;
                TimerRequest::Stop
            }
            DoorSensor::Closed => {
                self.state = DoorState::Closed;
                self.target = TARGET_CLOSED;
                self.current_time = 0.0;
                TimerRequest::Stop
            }
            DoorSensor::Opening => {
                self.state = DoorState::Opening;
                self.target = TARGET_OPEN;
                TimerRequest::Start
            }
            DoorSensor::Closing => {
                self.state = DoorState::Closing;
                self.target = TARGET_CLOSED;
                TimerRequest::Start
            }
        }
    }

    pub fn set_obstruction(&mut self, obstruction: bool) -> Option<GarageEvent> {
        if self.obstruction == obstruction {
            return None;
        }
        self.obstruction = obstruction;
        Some(if obstruction {
            GarageEvent::Obstruction
        } else {
            GarageEvent::ObstructionCleared
        })
    }

    fn halt_obstructed(&mut self) -> GarageStep {
        self.state = DoorState::Stopped;
        self.obstruction = true;
        GarageStep::with(GarageEvent::Obstruction, TimerRequest::Stop)
    }
}
